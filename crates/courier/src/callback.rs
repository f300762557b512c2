//! Result delivery to callback targets.
//!
//! The dispatcher hands every command/query result to a [`CallbackSender`].
//! Targets are URL-shaped strings; a `{kind}` placeholder in the target is
//! replaced by `command` or `query` before delivery. Delivery failures are
//! logged by the dispatcher and never retried.

use async_trait::async_trait;
use tracing::debug;

use crate::envelope::{RequestKind, ResponseEnvelope};
use crate::registry::CorrelationRegistry;

/// Placeholder substituted with the request kind in callback targets.
pub const KIND_PLACEHOLDER: &str = "{kind}";

/// Resolve a callback target for a request of `kind`.
pub fn resolve_target(target: &str, kind: RequestKind) -> String {
    target.replace(KIND_PLACEHOLDER, kind.as_str())
}

/// Delivers a response envelope to a resolved target.
#[async_trait]
pub trait CallbackSender: Send + Sync + 'static {
    async fn deliver(&self, target: &str, response: &ResponseEnvelope) -> anyhow::Result<()>;
}

/// Drops every response. Used when nobody listens for callbacks.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCallbackSender;

#[async_trait]
impl CallbackSender for NoopCallbackSender {
    async fn deliver(&self, target: &str, response: &ResponseEnvelope) -> anyhow::Result<()> {
        debug!(%target, id = %response.id, "callback discarded");
        Ok(())
    }
}

/// Completes a local [`CorrelationRegistry`] directly.
///
/// For deployments where caller and dispatcher share a process; the target is
/// ignored.
#[derive(Debug, Clone)]
pub struct RegistryCallback {
    registry: CorrelationRegistry,
}

impl RegistryCallback {
    pub fn new(registry: CorrelationRegistry) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl CallbackSender for RegistryCallback {
    async fn deliver(&self, _target: &str, response: &ResponseEnvelope) -> anyhow::Result<()> {
        self.registry.complete(response.clone());
        Ok(())
    }
}
