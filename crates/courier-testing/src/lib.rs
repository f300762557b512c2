//! Test doubles for courier and courier-saga.
//!
//! Everything here is deterministic: nothing sleeps on the wall clock, and
//! scheduled saga messages only fire when the test says so.
//!
//! # Quick Start
//!
//! ## Remote bus without a broker
//!
//! ```ignore
//! let registry = CorrelationRegistry::default();
//! let dispatcher = Arc::new(
//!     Dispatcher::new(IdempotencyStore::default()).with_callback(RegistryCallback::new(registry.clone())),
//! );
//! dispatcher.register_command::<PlaceOrder, _>(PlaceOrderHandler)?;
//!
//! let bus = RemoteBus::new(LoopbackTransport::new(dispatcher), registry)
//!     .with_callback_url("loopback://{kind}");
//! let receipt = bus.send(&PlaceOrder { .. }).await?;
//! ```
//!
//! ## Driving saga timeouts by hand
//!
//! ```ignore
//! let scheduler = Arc::new(ManualScheduler::new());
//! let engine = SagaEngine::builder(definition, repo).with_scheduler(scheduler.clone()).build();
//!
//! engine.consume(OrderAccepted { .. }).await?;
//! assert_eq!(scheduler.pending_types(), vec!["PaymentTimeout"]);
//!
//! scheduler.fire_all().await;
//! assert!(engine.is_cancelled("o-1").await?);
//! ```

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use courier_core::{
    AnyMessage, CallbackSender, Dispatcher, Message, RequestEnvelope, ResponseEnvelope, Transport,
};
use courier_saga::{
    InMemorySagaRepository, MessageSink, Publisher, SagaData, SagaError, SagaInstance,
    SagaRepository, Scheduler, StoreError,
};
use tokio::sync::Notify;
use tracing::warn;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// Callback
// =============================================================================

#[derive(Debug, Default)]
struct CallbackLog {
    deliveries: Mutex<Vec<(String, ResponseEnvelope)>>,
    delivered: Notify,
}

/// Records every callback delivery. Clones share one log.
#[derive(Debug, Default, Clone)]
pub struct RecordingCallback {
    log: Arc<CallbackLog>,
}

impl RecordingCallback {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(target, response)` pairs in delivery order.
    pub fn deliveries(&self) -> Vec<(String, ResponseEnvelope)> {
        lock(&self.log.deliveries).clone()
    }

    pub fn count(&self) -> usize {
        lock(&self.log.deliveries).len()
    }

    /// Wait until at least `count` deliveries have been recorded.
    ///
    /// Wrap in `tokio::time::timeout` if the delivery might never happen.
    pub async fn wait_for(&self, count: usize) {
        loop {
            let notified = self.log.delivered.notified();
            if self.count() >= count {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl CallbackSender for RecordingCallback {
    async fn deliver(&self, target: &str, response: &ResponseEnvelope) -> anyhow::Result<()> {
        lock(&self.log.deliveries).push((target.to_string(), response.clone()));
        self.log.delivered.notify_waiters();
        Ok(())
    }
}

// =============================================================================
// Transport
// =============================================================================

/// A [`Transport`] that hands envelopes straight to an in-process dispatcher.
///
/// Each envelope is dispatched on its own task, so `send` returns before the
/// handler runs, as it would with a real broker.
#[derive(Debug)]
pub struct LoopbackTransport {
    dispatcher: Arc<Dispatcher>,
    sent: Arc<AtomicUsize>,
}

impl LoopbackTransport {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            sent: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Shared counter of envelopes sent so far.
    pub fn sent_counter(&self) -> Arc<AtomicUsize> {
        self.sent.clone()
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(&self, request: RequestEnvelope) -> anyhow::Result<()> {
        self.sent.fetch_add(1, Ordering::SeqCst);
        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move {
            let id = request.id.clone();
            if let Err(e) = dispatcher.dispatch(request).await {
                warn!(%id, error = %e, "loopback dispatch failed");
            }
        });
        Ok(())
    }
}

// =============================================================================
// Publisher
// =============================================================================

/// Records published saga messages, optionally failing selected types.
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    published: Mutex<Vec<Arc<dyn AnyMessage>>>,
    failing: Mutex<HashSet<&'static str>>,
}

impl RecordingPublisher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every publish of `M` fail.
    pub fn fail_on<M: Message>(&self) {
        lock(&self.failing).insert(M::MESSAGE_TYPE);
    }

    /// Routing names of published messages, in order.
    pub fn published_types(&self) -> Vec<&'static str> {
        lock(&self.published)
            .iter()
            .map(|message| message.message_type())
            .collect()
    }

    /// Published messages of type `M`.
    pub fn published<M: Message>(&self) -> Vec<M> {
        lock(&self.published)
            .iter()
            .filter_map(|message| message.downcast_ref::<M>().cloned())
            .collect()
    }

    pub fn clear(&self) {
        lock(&self.published).clear();
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, message: Arc<dyn AnyMessage>) -> anyhow::Result<()> {
        if lock(&self.failing).contains(message.message_type()) {
            anyhow::bail!("publishing {} refused", message.message_type());
        }
        lock(&self.published).push(message);
        Ok(())
    }
}

// =============================================================================
// Scheduler
// =============================================================================

struct Scheduled {
    message: Arc<dyn AnyMessage>,
    delay: Duration,
    sink: Weak<dyn MessageSink>,
}

/// A [`Scheduler`] that holds messages until the test fires them.
#[derive(Default)]
pub struct ManualScheduler {
    pending: Mutex<Vec<Scheduled>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Routing names of messages waiting to fire.
    pub fn pending_types(&self) -> Vec<&'static str> {
        lock(&self.pending)
            .iter()
            .map(|scheduled| scheduled.message.message_type())
            .collect()
    }

    pub fn pending_delays(&self) -> Vec<Duration> {
        lock(&self.pending).iter().map(|scheduled| scheduled.delay).collect()
    }

    /// Drop every pending message without delivering it.
    pub fn discard(&self) {
        lock(&self.pending).clear();
    }

    /// Deliver every pending message, in scheduling order.
    ///
    /// Messages scheduled while firing stay pending for the next call.
    pub async fn fire_all(&self) -> Vec<Result<(), SagaError>> {
        let due: Vec<Scheduled> = std::mem::take(&mut *lock(&self.pending));
        let mut results = Vec::with_capacity(due.len());
        for scheduled in due {
            let result = match scheduled.sink.upgrade() {
                Some(sink) => sink.deliver(scheduled.message).await,
                None => Err(SagaError::EngineStopped),
            };
            results.push(result);
        }
        results
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, message: Arc<dyn AnyMessage>, delay: Duration, sink: Weak<dyn MessageSink>) {
        lock(&self.pending).push(Scheduled {
            message,
            delay,
            sink,
        });
    }
}

impl std::fmt::Debug for ManualScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualScheduler")
            .field("pending", &self.pending_types())
            .finish()
    }
}

// =============================================================================
// Repository
// =============================================================================

/// In-memory repository that can be told to lose the next saves to a
/// concurrent writer.
#[derive(Debug)]
pub struct ConflictInjectingRepository<D> {
    inner: InMemorySagaRepository<D>,
    conflicts: AtomicU32,
    saves: AtomicU32,
}

impl<D: SagaData> ConflictInjectingRepository<D> {
    pub fn new() -> Self {
        Self {
            inner: InMemorySagaRepository::new(),
            conflicts: AtomicU32::new(0),
            saves: AtomicU32::new(0),
        }
    }

    /// Fail the next `count` saves with [`StoreError::Conflict`].
    pub fn inject_conflicts(&self, count: u32) {
        self.conflicts.store(count, Ordering::SeqCst);
    }

    /// Save attempts so far, failed ones included.
    pub fn save_attempts(&self) -> u32 {
        self.saves.load(Ordering::SeqCst)
    }
}

impl<D: SagaData> Default for ConflictInjectingRepository<D> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<D: SagaData> SagaRepository<D> for ConflictInjectingRepository<D> {
    async fn find_by_id(&self, id: &str) -> Result<Option<SagaInstance<D>>, StoreError> {
        self.inner.find_by_id(id).await
    }

    async fn find_all(&self) -> Result<Vec<SagaInstance<D>>, StoreError> {
        self.inner.find_all().await
    }

    async fn save_and_flush(&self, instance: &SagaInstance<D>) -> Result<u64, StoreError> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Conflict);
        }
        self.inner.save_and_flush(instance).await
    }
}

#[cfg(test)]
mod tests {
    use courier_core::{
        impl_event, impl_message, Command, CommandHandler, CorrelationRegistry, IdempotencyStore,
        RegistryCallback, RemoteBus,
    };
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Double {
        value: u32,
    }

    impl_message!(Double);

    impl Command for Double {
        type Output = u32;
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Tick {
        n: u32,
    }

    impl_event!(Tick);

    struct DoubleHandler;

    #[async_trait]
    impl CommandHandler<Double> for DoubleHandler {
        async fn handle(&self, command: Double) -> anyhow::Result<u32> {
            Ok(command.value * 2)
        }
    }

    #[tokio::test]
    async fn test_loopback_round_trip() {
        let registry = CorrelationRegistry::default();
        let dispatcher = Dispatcher::new(IdempotencyStore::default())
            .with_callback(RegistryCallback::new(registry.clone()));
        dispatcher.register_command::<Double, _>(DoubleHandler).unwrap();

        let transport = LoopbackTransport::new(Arc::new(dispatcher));
        let sent = transport.sent_counter();
        let bus = RemoteBus::new(transport, registry.clone())
            .with_callback_url("loopback://{kind}")
            .with_timeout(Duration::from_secs(5));

        assert_eq!(bus.send(&Double { value: 21 }).await.unwrap(), 42);
        assert_eq!(sent.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_recording_callback_sees_resolved_target() {
        let callback = RecordingCallback::new();
        let dispatcher = Dispatcher::new(IdempotencyStore::default()).with_callback(callback.clone());
        dispatcher.register_command::<Double, _>(DoubleHandler).unwrap();
        let transport = LoopbackTransport::new(Arc::new(dispatcher));

        let envelope = RequestEnvelope::command(&Double { value: 4 })
            .unwrap()
            .with_callback("http://orders/{kind}/reply");
        transport.send(envelope).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), callback.wait_for(1))
            .await
            .unwrap();
        let deliveries = callback.deliveries();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].0, "http://orders/command/reply");
        assert_eq!(deliveries[0].1.decode::<u32>("Double").unwrap(), 8);
    }

    #[tokio::test]
    async fn test_recording_publisher_fails_selected_types() {
        let publisher = RecordingPublisher::new();
        publisher.fail_on::<Double>();

        publisher.publish(Arc::new(Tick { n: 1 })).await.unwrap();
        assert!(publisher.publish(Arc::new(Double { value: 1 })).await.is_err());

        assert_eq!(publisher.published_types(), vec!["Tick"]);
        assert_eq!(publisher.published::<Tick>()[0].n, 1);
    }

    #[tokio::test]
    async fn test_injected_conflicts_are_consumed() {
        let repository = ConflictInjectingRepository::<u32>::new();
        repository.inject_conflicts(1);
        let instance = SagaInstance::new("s-1");

        assert!(matches!(
            repository.save_and_flush(&instance).await,
            Err(StoreError::Conflict)
        ));
        assert_eq!(repository.save_and_flush(&instance).await.unwrap(), 1);
        assert_eq!(repository.save_attempts(), 2);
    }

    #[tokio::test]
    async fn test_manual_scheduler_reports_stopped_engine() {
        struct Gone;

        #[async_trait]
        impl MessageSink for Gone {
            async fn deliver(&self, _message: Arc<dyn AnyMessage>) -> Result<(), SagaError> {
                Ok(())
            }
        }

        let scheduler = ManualScheduler::new();
        let sink: Weak<dyn MessageSink> = Weak::<Gone>::new();
        scheduler.schedule(Arc::new(Tick { n: 1 }), Duration::from_secs(30), sink);

        assert_eq!(scheduler.pending_types(), vec!["Tick"]);
        assert_eq!(scheduler.pending_delays(), vec![Duration::from_secs(30)]);

        let results = scheduler.fire_all().await;
        assert!(matches!(results.as_slice(), [Err(SagaError::EngineStopped)]));
        assert_eq!(scheduler.pending_count(), 0);
    }
}
