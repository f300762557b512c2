//! Deadline-bounded, deduplicated execution of inbound requests.
//!
//! The [`Dispatcher`] turns one [`RequestEnvelope`] into at most one handler
//! execution:
//!
//! 1. A request already past `sent_at + timeout` is dropped; its sender has
//!    stopped waiting.
//! 2. A request whose id already has a stored result is not executed again;
//!    the stored result is delivered instead. This absorbs redelivery from
//!    at-least-once transports. A copy that arrives while the first is still
//!    running is skipped.
//! 3. Requests with no bound handler are logged and dropped.
//! 4. The payload is decoded with the decoder registered for its type.
//! 5. The handler runs on its own task, bounded by the time left before the
//!    deadline. Events fan out to every subscriber with per-handler failure
//!    isolation; commands and queries run their single handler, and the result
//!    is stored and sent to the callback target.
//! 6. If the deadline passes first, the task is aborted and nothing is
//!    delivered.
//!
//! # Example
//!
//! ```ignore
//! let dispatcher = Dispatcher::new(IdempotencyStore::default())
//!     .with_callback(HttpCallbackSender::new());
//! dispatcher.register_command::<PlaceOrder, _>(PlaceOrderHandler::new(db))?;
//!
//! // In the transport consumer loop:
//! let outcome = dispatcher.dispatch(envelope).await?;
//! ```

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashSet;
use futures::FutureExt;
use tracing::{debug, error, warn};

use crate::callback::{resolve_target, CallbackSender, NoopCallbackSender};
use crate::envelope::{RequestEnvelope, RequestKind, ResponseEnvelope};
use crate::error::{CourierError, Result};
use crate::handler::{
    CommandHandler, EventHandler, HandlerId, HandlerRegistry, Payload, QueryHandler, Route,
};
use crate::idempotency::IdempotencyStore;
use crate::message::{Command, Event, Query};

/// What happened to a dispatched request.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// The deadline had already passed on arrival.
    Expired,
    /// The request was seen before; the stored result was delivered again.
    Replayed(ResponseEnvelope),
    /// Another delivery of the same id is still executing.
    InFlight,
    /// No handler is bound to the message type.
    NoHandler,
    /// A command or query ran and produced this response.
    Completed(ResponseEnvelope),
    /// An event was fanned out.
    Published {
        /// Handlers that returned successfully.
        succeeded: usize,
        /// Handlers that failed or panicked.
        failed: usize,
    },
    /// The deadline passed while the handler was running; it was aborted.
    TimedOut,
}

/// Routes inbound envelopes to registered handlers.
pub struct Dispatcher {
    handlers: Arc<HandlerRegistry>,
    store: IdempotencyStore<ResponseEnvelope>,
    callback: Arc<dyn CallbackSender>,
    in_flight: DashSet<String>,
}

/// Holds a request id in the in-flight set until dropped.
struct InFlightGuard<'a> {
    ids: &'a DashSet<String>,
    id: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.ids.remove(&self.id);
    }
}

impl Dispatcher {
    /// Dispatcher with an empty handler registry and no callback delivery.
    pub fn new(store: IdempotencyStore<ResponseEnvelope>) -> Self {
        Self {
            handlers: Arc::new(HandlerRegistry::new()),
            store,
            callback: Arc::new(NoopCallbackSender),
            in_flight: DashSet::new(),
        }
    }

    pub fn with_callback<S: CallbackSender>(mut self, sender: S) -> Self {
        self.callback = Arc::new(sender);
        self
    }

    /// Share a handler registry with other dispatchers.
    pub fn with_handlers(mut self, handlers: Arc<HandlerRegistry>) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    pub fn store(&self) -> &IdempotencyStore<ResponseEnvelope> {
        &self.store
    }

    pub fn register_command<C: Command, H: CommandHandler<C>>(&self, handler: H) -> Result<HandlerId> {
        self.handlers.register_command::<C, H>(handler)
    }

    pub fn register_query<Q: Query, H: QueryHandler<Q>>(&self, handler: H) -> Result<HandlerId> {
        self.handlers.register_query::<Q, H>(handler)
    }

    pub fn subscribe<E: Event, H: EventHandler<E>>(&self, handler: H) -> Result<HandlerId> {
        self.handlers.subscribe::<E, H>(handler)
    }

    pub fn remove_handler(&self, id: HandlerId) -> bool {
        self.handlers.remove_handler(id)
    }

    /// Execute one inbound request.
    ///
    /// Returns `Err` for payloads that do not decode, for envelopes whose kind
    /// does not match the registered handler, and for command/query handler
    /// failures. Everything else is reported through [`DispatchOutcome`].
    ///
    /// The id stays claimed until the result is stored, so a concurrent copy
    /// returns [`DispatchOutcome::InFlight`] and a later one is replayed. A
    /// copy arriving after a failed or timed-out run executes again.
    pub async fn dispatch(&self, request: RequestEnvelope) -> Result<DispatchOutcome> {
        let remaining = request.remaining_at(Utc::now());
        if remaining.is_some_and(|left| left.is_zero()) {
            debug!(id = %request.id, message_type = %request.message_type, "request past deadline, dropping");
            return Ok(DispatchOutcome::Expired);
        }

        let Some(_claim) = self.claim(&request.id) else {
            debug!(id = %request.id, message_type = %request.message_type, "request already executing, skipping copy");
            return Ok(DispatchOutcome::InFlight);
        };

        if let Some(cached) = self.store.get(&request.id) {
            debug!(id = %request.id, message_type = %request.message_type, "duplicate request, replaying stored result");
            if request.kind.expects_response() {
                self.deliver(&request, &cached).await;
            }
            return Ok(DispatchOutcome::Replayed(cached));
        }

        let Some(route) = self.handlers.route(&request.message_type) else {
            warn!(id = %request.id, message_type = %request.message_type, "no handler registered, dropping");
            return Ok(DispatchOutcome::NoHandler);
        };

        if route.kind != request.kind {
            warn!(id = %request.id, message_type = %request.message_type, kind = %request.kind, "envelope kind does not match handler");
            return Err(CourierError::KindMismatch {
                message_type: request.message_type.clone(),
                registered: route.kind.as_str(),
                requested: request.kind.as_str(),
            });
        }

        let payload = (route.decode)(&request.message_type, &request.payload).map_err(|e| {
            error!(id = %request.id, error = %e, "dropping undecodable request");
            e
        })?;

        match request.kind {
            RequestKind::Event => Ok(self.fan_out(&request, route, payload, remaining).await),
            RequestKind::Command | RequestKind::Query => {
                self.execute_single(&request, route, payload, remaining).await
            }
        }
    }

    fn claim(&self, id: &str) -> Option<InFlightGuard<'_>> {
        self.in_flight.insert(id.to_string()).then(|| InFlightGuard {
            ids: &self.in_flight,
            id: id.to_string(),
        })
    }

    async fn fan_out(
        &self,
        request: &RequestEnvelope,
        route: Route,
        payload: Payload,
        remaining: Option<Duration>,
    ) -> DispatchOutcome {
        let message_type = request.message_type.clone();
        let subscribers = route.handlers.len();
        let work = async move {
            let mut succeeded = 0;
            let mut failed = 0;
            for registered in route.handlers {
                match guarded(registered.handler.call(payload.clone())).await {
                    Ok(_) => succeeded += 1,
                    Err(e) => {
                        failed += 1;
                        error!(%message_type, error = ?e, "event handler failed");
                    }
                }
            }
            Ok::<_, anyhow::Error>((succeeded, failed))
        };

        match run_bounded(work, remaining).await {
            Some(Ok((succeeded, failed))) => {
                self.store
                    .put(request.id.clone(), ResponseEnvelope::empty(request.id.clone()));
                DispatchOutcome::Published { succeeded, failed }
            }
            Some(Err(e)) => {
                error!(id = %request.id, error = ?e, "event fan-out aborted");
                DispatchOutcome::Published {
                    succeeded: 0,
                    failed: subscribers,
                }
            }
            None => {
                warn!(id = %request.id, message_type = %request.message_type, "event fan-out exceeded deadline");
                DispatchOutcome::TimedOut
            }
        }
    }

    async fn execute_single(
        &self,
        request: &RequestEnvelope,
        route: Route,
        payload: Payload,
        remaining: Option<Duration>,
    ) -> Result<DispatchOutcome> {
        let Some(registered) = route.handlers.first() else {
            return Ok(DispatchOutcome::NoHandler);
        };
        let handler = registered.handler.clone();
        let work = async move { guarded(handler.call(payload)).await };

        match run_bounded(work, remaining).await {
            None => {
                warn!(id = %request.id, message_type = %request.message_type, "handler exceeded deadline, aborted");
                Ok(DispatchOutcome::TimedOut)
            }
            Some(Err(source)) => {
                error!(id = %request.id, message_type = %request.message_type, error = ?source, "handler failed");
                Err(CourierError::Handler {
                    message_type: request.message_type.clone(),
                    source,
                })
            }
            Some(Ok(result)) => {
                let response = ResponseEnvelope::new(request.id.clone(), result);
                self.store.put(request.id.clone(), response.clone());
                self.deliver(request, &response).await;
                Ok(DispatchOutcome::Completed(response))
            }
        }
    }

    async fn deliver(&self, request: &RequestEnvelope, response: &ResponseEnvelope) {
        let Some(target) = request.callback_url.as_deref() else {
            return;
        };
        let target = resolve_target(target, request.kind);
        if let Err(e) = self.callback.deliver(&target, response).await {
            warn!(id = %request.id, %target, error = ?e, "callback delivery failed");
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("handlers", &self.handlers)
            .field("store", &self.store)
            .field("in_flight", &self.in_flight.len())
            .finish_non_exhaustive()
    }
}

/// Run `work` on its own task, aborting it if `limit` elapses first.
///
/// Returns `None` on timeout.
async fn run_bounded<T, F>(work: F, limit: Option<Duration>) -> Option<anyhow::Result<T>>
where
    T: Send + 'static,
    F: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    let mut task = tokio::spawn(work);
    let joined = match limit {
        Some(limit) => match tokio::time::timeout(limit, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                task.abort();
                return None;
            }
        },
        None => task.await,
    };
    Some(joined.unwrap_or_else(|e| Err(anyhow::anyhow!("handler task failed: {e}"))))
}

/// Convert a panic inside `fut` into an error.
async fn guarded<T>(fut: impl Future<Output = anyhow::Result<T>>) -> anyhow::Result<T> {
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(panic_info) => {
            let panic_msg = extract_panic_message(&panic_info);
            error!(panic = %panic_msg, "handler panicked");
            Err(anyhow::anyhow!("handler panicked: {}", panic_msg))
        }
    }
}

fn extract_panic_message(panic_info: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic_info.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic_info.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::idempotency::StoreConfig;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Reserve {
        sku: String,
    }
    crate::impl_message!(Reserve);
    impl Command for Reserve {
        type Output = String;
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Nap {
        millis: u64,
    }
    crate::impl_message!(Nap);
    impl Command for Nap {
        type Output = ();
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Shipped;
    crate::impl_event!(Shipped);

    struct Reserver {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl CommandHandler<Reserve> for Reserver {
        async fn handle(&self, command: Reserve) -> anyhow::Result<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("{}#{}", command.sku, n))
        }
    }

    struct Sleeper {
        finished: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl CommandHandler<Nap> for Sleeper {
        async fn handle(&self, command: Nap) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_millis(command.millis)).await;
            self.finished.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    enum Behaviour {
        Succeed,
        Fail,
        Panic,
    }

    struct Subscriber {
        name: &'static str,
        behaviour: Behaviour,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl EventHandler<Shipped> for Subscriber {
        async fn handle(&self, _event: &Shipped) -> anyhow::Result<()> {
            self.log.lock().unwrap().push(self.name);
            match self.behaviour {
                Behaviour::Succeed => Ok(()),
                Behaviour::Fail => anyhow::bail!("{} refused", self.name),
                Behaviour::Panic => panic!("{} exploded", self.name),
            }
        }
    }

    #[derive(Default)]
    struct RecordingCallback {
        delivered: Mutex<Vec<(String, ResponseEnvelope)>>,
    }

    #[async_trait]
    impl CallbackSender for Arc<RecordingCallback> {
        async fn deliver(&self, target: &str, response: &ResponseEnvelope) -> anyhow::Result<()> {
            self.delivered
                .lock()
                .unwrap()
                .push((target.to_string(), response.clone()));
            Ok(())
        }
    }

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(IdempotencyStore::new(StoreConfig::default()))
    }

    #[tokio::test]
    async fn test_same_id_executes_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let dispatcher = dispatcher();
        dispatcher
            .register_command::<Reserve, _>(Reserver {
                calls: calls.clone(),
            })
            .unwrap();

        let envelope = RequestEnvelope::command(&Reserve { sku: "A".into() })
            .unwrap()
            .with_timeout(Duration::from_secs(5));

        let first = dispatcher.dispatch(envelope.clone()).await.unwrap();
        let second = dispatcher.dispatch(envelope.clone()).await.unwrap();

        let DispatchOutcome::Completed(response) = first else {
            panic!("expected completion, got {first:?}");
        };
        assert_eq!(response.decode::<String>("String").unwrap(), "A#1");
        assert_eq!(second, DispatchOutcome::Replayed(response));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_result_delivered_to_callback_with_kind() {
        let callback = Arc::new(RecordingCallback::default());
        let dispatcher = dispatcher().with_callback(callback.clone());
        dispatcher
            .register_command::<Reserve, _>(Reserver {
                calls: Arc::new(AtomicUsize::new(0)),
            })
            .unwrap();

        let envelope = RequestEnvelope::command(&Reserve { sku: "B".into() })
            .unwrap()
            .with_callback("http://caller/{kind}/reply");
        dispatcher.dispatch(envelope.clone()).await.unwrap();
        dispatcher.dispatch(envelope.clone()).await.unwrap();

        let delivered = callback.delivered.lock().unwrap();
        assert_eq!(delivered.len(), 2);
        assert_eq!(delivered[0].0, "http://caller/command/reply");
        assert_eq!(delivered[0].1.id, envelope.id);
        assert_eq!(delivered[0].1, delivered[1].1);
    }

    #[tokio::test]
    async fn test_expired_request_dropped() {
        let calls = Arc::new(AtomicUsize::new(0));
        let dispatcher = dispatcher();
        dispatcher
            .register_command::<Reserve, _>(Reserver {
                calls: calls.clone(),
            })
            .unwrap();

        let mut envelope = RequestEnvelope::command(&Reserve { sku: "C".into() })
            .unwrap()
            .with_timeout(Duration::from_millis(10));
        envelope.sent_at = Utc::now() - chrono::Duration::seconds(1);

        let outcome = dispatcher.dispatch(envelope).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Expired);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_type_dropped() {
        let outcome = dispatcher()
            .dispatch(RequestEnvelope::command(&Reserve { sku: "D".into() }).unwrap())
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::NoHandler);
    }

    #[tokio::test]
    async fn test_bad_payload_is_deserialization_error() {
        let dispatcher = dispatcher();
        dispatcher
            .register_command::<Reserve, _>(Reserver {
                calls: Arc::new(AtomicUsize::new(0)),
            })
            .unwrap();

        let mut envelope = RequestEnvelope::command(&Reserve { sku: "E".into() }).unwrap();
        envelope.payload = "[1, 2, 3]".into();

        let err = dispatcher.dispatch(envelope.clone()).await.unwrap_err();
        assert!(matches!(err, CourierError::Deserialization { .. }));
        assert!(!dispatcher.store().contains(&envelope.id));
    }

    #[tokio::test]
    async fn test_handler_aborted_at_deadline() {
        let finished = Arc::new(AtomicUsize::new(0));
        let dispatcher = dispatcher();
        dispatcher
            .register_command::<Nap, _>(Sleeper {
                finished: finished.clone(),
            })
            .unwrap();

        let envelope = RequestEnvelope::command(&Nap { millis: 5_000 })
            .unwrap()
            .with_timeout(Duration::from_millis(50));

        let outcome = dispatcher.dispatch(envelope.clone()).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::TimedOut);
        assert!(!dispatcher.store().contains(&envelope.id));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_event_fan_out_isolates_failures() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = dispatcher();
        for (name, behaviour) in [
            ("first", Behaviour::Succeed),
            ("second", Behaviour::Fail),
            ("third", Behaviour::Panic),
            ("fourth", Behaviour::Succeed),
        ] {
            dispatcher
                .subscribe::<Shipped, _>(Subscriber {
                    name,
                    behaviour,
                    log: log.clone(),
                })
                .unwrap();
        }

        let envelope = RequestEnvelope::event(&Shipped).unwrap();
        let outcome = dispatcher.dispatch(envelope.clone()).await.unwrap();

        assert_eq!(
            outcome,
            DispatchOutcome::Published {
                succeeded: 2,
                failed: 2
            }
        );
        assert_eq!(
            *log.lock().unwrap(),
            vec!["first", "second", "third", "fourth"]
        );

        // Redelivery of the same event id is absorbed.
        let again = dispatcher.dispatch(envelope).await.unwrap();
        assert!(matches!(again, DispatchOutcome::Replayed(_)));
        assert_eq!(log.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_concurrent_copy_skipped_while_first_runs() {
        let finished = Arc::new(AtomicUsize::new(0));
        let dispatcher = dispatcher();
        dispatcher
            .register_command::<Nap, _>(Sleeper {
                finished: finished.clone(),
            })
            .unwrap();

        let envelope = RequestEnvelope::command(&Nap { millis: 100 })
            .unwrap()
            .with_timeout(Duration::from_secs(5));

        let (first, second) = tokio::join!(
            dispatcher.dispatch(envelope.clone()),
            dispatcher.dispatch(envelope.clone())
        );

        assert!(matches!(first.unwrap(), DispatchOutcome::Completed(_)));
        assert_eq!(second.unwrap(), DispatchOutcome::InFlight);
        assert_eq!(finished.load(Ordering::SeqCst), 1);

        // Claim released; later copies replay the stored result.
        let third = dispatcher.dispatch(envelope).await.unwrap();
        assert!(matches!(third, DispatchOutcome::Replayed(_)));
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_kind_mismatch_rejected() {
        let dispatcher = dispatcher();
        dispatcher
            .register_command::<Reserve, _>(Reserver {
                calls: Arc::new(AtomicUsize::new(0)),
            })
            .unwrap();

        let mut envelope = RequestEnvelope::command(&Reserve { sku: "F".into() }).unwrap();
        envelope.kind = RequestKind::Query;

        assert!(matches!(
            dispatcher.dispatch(envelope).await,
            Err(CourierError::KindMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_removed_handler_no_longer_routes() {
        let dispatcher = dispatcher();
        let id = dispatcher
            .register_command::<Reserve, _>(Reserver {
                calls: Arc::new(AtomicUsize::new(0)),
            })
            .unwrap();
        assert!(dispatcher.remove_handler(id));

        let outcome = dispatcher
            .dispatch(RequestEnvelope::command(&Reserve { sku: "G".into() }).unwrap())
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::NoHandler);
    }
}
