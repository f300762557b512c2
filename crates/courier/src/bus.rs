//! Caller-side buses.
//!
//! [`LocalBus`] runs requests against an in-process [`Dispatcher`], keeping
//! the same idempotency and deadline semantics as the remote path.
//!
//! [`RemoteBus`] sends requests over a [`Transport`] and parks the caller on a
//! [`CorrelationRegistry`] slot until the reply arrives (through
//! [`CorrelationRegistry::complete`]) or the timeout fires.
//!
//! ```ignore
//! let bus = RemoteBus::new(KafkaTransport::new(producer), registry.clone())
//!     .with_callback_url("https://orders.internal/replies/{kind}")
//!     .with_timeout(Duration::from_secs(10));
//!
//! let receipt = bus.send(&PlaceOrder { order_id, amount }).await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::debug;
use uuid::Uuid;

use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::envelope::{RequestEnvelope, ResponseEnvelope};
use crate::error::{CourierError, Result};
use crate::message::{Command, Event, Message, Query};
use crate::registry::CorrelationRegistry;

/// Moves request envelopes to the remote side.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, request: RequestEnvelope) -> anyhow::Result<()>;
}

// =============================================================================
// Remote
// =============================================================================

/// Request/response over a transport, correlated by request id.
#[derive(Clone)]
pub struct RemoteBus {
    transport: Arc<dyn Transport>,
    registry: CorrelationRegistry,
    callback_url: Option<String>,
    timeout: Duration,
}

impl RemoteBus {
    /// Uses the registry's default timeout.
    pub fn new<T: Transport>(transport: T, registry: CorrelationRegistry) -> Self {
        let timeout = registry.config().default_timeout;
        Self {
            transport: Arc::new(transport),
            registry,
            callback_url: None,
            timeout,
        }
    }

    /// Where the remote dispatcher should deliver replies.
    pub fn with_callback_url(mut self, url: impl Into<String>) -> Self {
        self.callback_url = Some(url.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn registry(&self) -> &CorrelationRegistry {
        &self.registry
    }

    /// Send a command and wait for its result.
    pub async fn send<C: Command>(&self, command: &C) -> Result<C::Output> {
        self.call(RequestEnvelope::command(command)?, C::MESSAGE_TYPE)
            .await
    }

    /// Send a command under a caller-chosen idempotency key.
    pub async fn send_with_key<C: Command>(
        &self,
        key: impl Into<String>,
        command: &C,
    ) -> Result<C::Output> {
        self.call(RequestEnvelope::command(command)?.with_id(key), C::MESSAGE_TYPE)
            .await
    }

    /// Send a query and wait for its result.
    pub async fn query<Q: Query>(&self, query: &Q) -> Result<Q::Output> {
        self.call(RequestEnvelope::query(query)?, Q::MESSAGE_TYPE).await
    }

    /// Publish an event. Returns once the transport accepted it.
    pub async fn publish<E: Event>(&self, event: &E) -> Result<()> {
        let envelope = RequestEnvelope::event(event)?;
        let id = envelope.id.clone();
        self.transport
            .send(envelope)
            .await
            .map_err(|source| CourierError::Transport { id, source })
    }

    async fn call<T: DeserializeOwned>(&self, envelope: RequestEnvelope, type_name: &str) -> Result<T> {
        let mut envelope = envelope.with_timeout(self.timeout).synchronous();
        envelope.callback_url = self.callback_url.clone();
        let id = envelope.id.clone();

        let pending = self.registry.register(id.clone(), self.timeout)?;
        if let Err(source) = self.transport.send(envelope).await {
            self.registry.cancel(&id);
            return Err(CourierError::Transport { id, source });
        }
        debug!(%id, message_type = type_name, "request sent, awaiting reply");

        let response = pending.wait().await?;
        response.decode(type_name)
    }
}

impl std::fmt::Debug for RemoteBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteBus")
            .field("callback_url", &self.callback_url)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Local
// =============================================================================

/// In-process request execution through a [`Dispatcher`].
#[derive(Debug, Clone)]
pub struct LocalBus {
    dispatcher: Arc<Dispatcher>,
}

impl LocalBus {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub async fn send<C: Command>(&self, command: &C) -> Result<C::Output> {
        self.send_with_key(Uuid::new_v4().to_string(), command).await
    }

    /// Runs the handler at most once per `key`; repeats return the stored result.
    pub async fn send_with_key<C: Command>(
        &self,
        key: impl Into<String>,
        command: &C,
    ) -> Result<C::Output> {
        let envelope = RequestEnvelope::command(command)?.with_id(key);
        let response = self.execute::<C>(envelope).await?;
        response.decode(C::MESSAGE_TYPE)
    }

    pub async fn query<Q: Query>(&self, query: &Q) -> Result<Q::Output> {
        self.query_with_key(Uuid::new_v4().to_string(), query).await
    }

    pub async fn query_with_key<Q: Query>(
        &self,
        key: impl Into<String>,
        query: &Q,
    ) -> Result<Q::Output> {
        let envelope = RequestEnvelope::query(query)?.with_id(key);
        let response = self.execute::<Q>(envelope).await?;
        response.decode(Q::MESSAGE_TYPE)
    }

    /// Fan an event out to local subscribers. Skipped if `key` was seen before.
    pub async fn publish_with_key<E: Event>(&self, key: impl Into<String>, event: &E) -> Result<()> {
        let envelope = RequestEnvelope::event(event)?.with_id(key);
        self.dispatcher.dispatch(envelope).await?;
        Ok(())
    }

    pub async fn publish<E: Event>(&self, event: &E) -> Result<()> {
        self.publish_with_key(Uuid::new_v4().to_string(), event).await
    }

    async fn execute<M: Message>(&self, envelope: RequestEnvelope) -> Result<ResponseEnvelope> {
        let id = envelope.id.clone();
        match self.dispatcher.dispatch(envelope).await? {
            DispatchOutcome::Completed(response) | DispatchOutcome::Replayed(response) => {
                Ok(response)
            }
            DispatchOutcome::NoHandler => Err(CourierError::NoHandler {
                message_type: M::MESSAGE_TYPE.to_string(),
            }),
            DispatchOutcome::InFlight => Err(CourierError::AlreadyRegistered { id }),
            DispatchOutcome::Expired
            | DispatchOutcome::TimedOut
            | DispatchOutcome::Published { .. } => Err(CourierError::Timeout {
                id,
                timeout: Duration::ZERO,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::handler::{CommandHandler, EventHandler};
    use crate::idempotency::IdempotencyStore;
    use crate::registry::RegistryConfig;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Increment {
        by: u32,
    }
    crate::impl_message!(Increment);
    impl Command for Increment {
        type Output = u32;
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Reset;
    crate::impl_event!(Reset);

    struct Counter {
        total: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl CommandHandler<Increment> for Counter {
        async fn handle(&self, command: Increment) -> anyhow::Result<u32> {
            let after = self.total.fetch_add(command.by as usize, Ordering::SeqCst) + command.by as usize;
            Ok(after as u32)
        }
    }

    #[async_trait]
    impl EventHandler<Reset> for Counter {
        async fn handle(&self, _event: &Reset) -> anyhow::Result<()> {
            self.total.store(0, Ordering::SeqCst);
            Ok(())
        }
    }

    fn local_bus(total: &Arc<AtomicUsize>) -> LocalBus {
        let dispatcher = Dispatcher::new(IdempotencyStore::default());
        dispatcher
            .register_command::<Increment, _>(Counter {
                total: total.clone(),
            })
            .unwrap();
        dispatcher
            .subscribe::<Reset, _>(Counter {
                total: total.clone(),
            })
            .unwrap();
        LocalBus::new(Arc::new(dispatcher))
    }

    #[tokio::test]
    async fn test_local_send_is_idempotent_per_key() {
        let total = Arc::new(AtomicUsize::new(0));
        let bus = local_bus(&total);

        assert_eq!(bus.send_with_key("k1", &Increment { by: 5 }).await.unwrap(), 5);
        assert_eq!(bus.send_with_key("k1", &Increment { by: 5 }).await.unwrap(), 5);
        assert_eq!(bus.send(&Increment { by: 1 }).await.unwrap(), 6);
        assert_eq!(total.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_local_publish_skips_seen_key() {
        let total = Arc::new(AtomicUsize::new(0));
        let bus = local_bus(&total);

        bus.publish_with_key("reset-1", &Reset).await.unwrap();
        bus.send(&Increment { by: 3 }).await.unwrap();
        bus.publish_with_key("reset-1", &Reset).await.unwrap();
        assert_eq!(total.load(Ordering::SeqCst), 3);

        bus.publish(&Reset).await.unwrap();
        assert_eq!(total.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_local_send_without_handler() {
        let bus = LocalBus::new(Arc::new(Dispatcher::new(IdempotencyStore::default())));
        assert!(matches!(
            bus.send(&Increment { by: 1 }).await,
            Err(CourierError::NoHandler { .. })
        ));
    }

    /// Records envelopes and answers nothing.
    #[derive(Default, Clone)]
    struct BlackHole {
        sent: Arc<Mutex<Vec<RequestEnvelope>>>,
    }

    #[async_trait]
    impl Transport for BlackHole {
        async fn send(&self, request: RequestEnvelope) -> anyhow::Result<()> {
            self.sent.lock().unwrap().push(request);
            Ok(())
        }
    }

    struct Broken;

    #[async_trait]
    impl Transport for Broken {
        async fn send(&self, _request: RequestEnvelope) -> anyhow::Result<()> {
            anyhow::bail!("broker unavailable")
        }
    }

    #[tokio::test]
    async fn test_remote_send_completed_by_registry() {
        let transport = BlackHole::default();
        let registry = CorrelationRegistry::default();
        let bus = RemoteBus::new(transport.clone(), registry.clone())
            .with_callback_url("http://me/{kind}")
            .with_timeout(Duration::from_secs(5));

        let call = tokio::spawn({
            let bus = bus.clone();
            async move { bus.send(&Increment { by: 2 }).await }
        });

        let envelope = loop {
            if let Some(envelope) = transport.sent.lock().unwrap().first().cloned() {
                break envelope;
            }
            tokio::task::yield_now().await;
        };
        assert!(envelope.sync);
        assert_eq!(envelope.timeout_ms, Some(5_000));
        assert_eq!(envelope.callback_url.as_deref(), Some("http://me/{kind}"));
        assert!(registry.contains(&envelope.id));

        registry.complete(ResponseEnvelope::new(envelope.id.clone(), Some("12".into())));
        assert_eq!(call.await.unwrap().unwrap(), 12);
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_send_times_out() {
        let registry = CorrelationRegistry::new(RegistryConfig::default());
        let bus = RemoteBus::new(BlackHole::default(), registry.clone())
            .with_timeout(Duration::from_millis(200));

        let err = bus.send(&Increment { by: 1 }).await.unwrap_err();
        assert!(matches!(err, CourierError::Timeout { .. }));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_remote_transport_failure_releases_slot() {
        let registry = CorrelationRegistry::default();
        let bus = RemoteBus::new(Broken, registry.clone());

        let err = bus.send(&Increment { by: 1 }).await.unwrap_err();
        assert!(matches!(err, CourierError::Transport { .. }));
        assert!(registry.is_empty());
    }
}
