//! HTTP callbacks for Courier responses.
//!
//! The dispatcher side uses [`HttpCallbackSender`] to POST each
//! [`ResponseEnvelope`] as JSON to the request's callback URL. The caller side
//! feeds the request body of that POST into a [`CallbackReceiver`], which
//! completes the matching slot in its [`CorrelationRegistry`].
//!
//! # Usage
//!
//! ```rust,ignore
//! // dispatcher process
//! let dispatcher = Dispatcher::new(IdempotencyStore::default())
//!     .with_callback(HttpCallbackSender::new().with_timeout(Duration::from_secs(5)));
//!
//! // caller process, inside the HTTP route for the callback URL
//! let receiver = CallbackReceiver::new(registry.clone());
//! receiver.receive(&body)?;
//! ```

use std::time::Duration;

use async_trait::async_trait;
use courier_core::{CallbackSender, CorrelationRegistry, ResponseEnvelope};
use thiserror::Error;
use tracing::debug;

/// Callback delivery and receipt failures.
#[derive(Debug, Error)]
pub enum WebhookError {
    /// The callback target is not an absolute URL.
    #[error("invalid callback target '{target}': {reason}")]
    InvalidTarget { target: String, reason: String },

    /// The HTTP request could not be completed.
    #[error("callback request to {target} failed: {source}")]
    Request {
        target: String,
        #[source]
        source: reqwest::Error,
    },

    /// The receiver answered with a non-success status.
    #[error("callback to {target} rejected with status {status}: {body}")]
    Rejected {
        target: String,
        status: u16,
        body: String,
    },

    /// An incoming callback body is not a response envelope.
    #[error("malformed callback body: {0}")]
    Malformed(#[from] serde_json::Error),
}

// =============================================================================
// Sending
// =============================================================================

/// Delivers response envelopes with an HTTP POST.
///
/// # Defaults
///
/// - timeout: 10 seconds per delivery
#[derive(Debug, Clone)]
pub struct HttpCallbackSender {
    client: reqwest::Client,
    timeout: Duration,
}

impl Default for HttpCallbackSender {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpCallbackSender {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout: Duration::from_secs(10),
        }
    }

    /// Share a preconfigured client (proxies, TLS roots, connection pool).
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// POST `response` to `target`.
    ///
    /// # Errors
    ///
    /// [`WebhookError::InvalidTarget`] before any I/O when `target` does not
    /// parse, [`WebhookError::Request`] on transport failure or timeout and
    /// [`WebhookError::Rejected`] on a non-2xx answer.
    pub async fn post(&self, target: &str, response: &ResponseEnvelope) -> Result<(), WebhookError> {
        let url = reqwest::Url::parse(target).map_err(|e| WebhookError::InvalidTarget {
            target: target.to_string(),
            reason: e.to_string(),
        })?;

        let resp = self
            .client
            .post(url)
            .timeout(self.timeout)
            .json(response)
            .send()
            .await
            .map_err(|source| WebhookError::Request {
                target: target.to_string(),
                source,
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(WebhookError::Rejected {
                target: target.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        debug!(%target, id = %response.id, "callback delivered");
        Ok(())
    }
}

#[async_trait]
impl CallbackSender for HttpCallbackSender {
    async fn deliver(&self, target: &str, response: &ResponseEnvelope) -> anyhow::Result<()> {
        self.post(target, response).await?;
        Ok(())
    }
}

// =============================================================================
// Receiving
// =============================================================================

/// Completes pending requests from callback bodies.
#[derive(Debug, Clone)]
pub struct CallbackReceiver {
    registry: CorrelationRegistry,
}

impl CallbackReceiver {
    pub fn new(registry: CorrelationRegistry) -> Self {
        Self { registry }
    }

    /// Decode `body` and complete the request it answers.
    ///
    /// Returns whether a caller was still waiting. Late or unknown responses
    /// are dropped.
    pub fn receive(&self, body: &[u8]) -> Result<bool, WebhookError> {
        let response: ResponseEnvelope = serde_json::from_slice(body)?;
        let awaited = self.registry.contains(&response.id);
        self.registry.complete(response);
        Ok(awaited)
    }
}
