//! Activity chains: what a saga does when an event arrives in a state.
//!
//! A chain is built fluently and bound to a `(state, event)` pair on the
//! definition:
//!
//! ```ignore
//! ActivityChain::<PaymentReceived, OrderData>::new()
//!     .filter(|ctx, saga| ctx.data().amount >= saga.data.total)
//!     .then(|ctx, saga| saga.data.paid = ctx.data().amount)
//!     .publish(|_, saga| ReserveInventory { order_id: saga.id.clone() })
//!     .transition_to(AWAITING_INVENTORY)
//! ```
//!
//! # Execution Order
//!
//! Steps run in phases, each phase in registration order:
//!
//! 1. **Filters.** All must pass; a failed filter ends the chain with no
//!    mutation, no transition and no save.
//! 2. **Synchronous steps.** `then`, `try_then` and `schedule`.
//! 3. **Asynchronous steps.** `then_async` and `publish`, awaited one by one.
//! 4. **Branches.** `if_else` and `if_then`; each branch is a full chain with
//!    its own directives.
//!
//! A failure in any phase goes to the `catch` handler if there is one and
//! otherwise ends the chain with [`SagaError::Activity`]. Side effects of
//! steps that already ran are not rolled back.
//!
//! Directives apply after the steps, even when `catch` swallowed a failure:
//!
//! 1. Cancellation (`cancel()` or [`EventContext::request_cancel`]) marks the
//!    instance cancelled, moves it to `Cancelled` or the explicit transition
//!    target, and skips everything else.
//! 2. `transition_to`, checked against the allowed-transition table in strict
//!    mode.
//! 3. `finalize` marks the instance completed in `Completed`.

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Context as _;
use courier_core::{AnyMessage, Message};
use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, info, warn};

use crate::context::EventContext;
use crate::definition::TransitionTable;
use crate::error::SagaError;
use crate::publisher::Publisher;
use crate::scheduler::{MessageSink, Scheduler};
use crate::state::{SagaData, SagaInstance, State};

type Predicate<E, D> = Box<dyn Fn(&EventContext<E>, &SagaInstance<D>) -> bool + Send + Sync>;
type Action<E, D> =
    Box<dyn Fn(&mut EventContext<E>, &mut SagaInstance<D>) -> anyhow::Result<()> + Send + Sync>;
type Task<E, D> =
    Box<dyn Fn(Arc<E>, SagaInstance<D>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
type MessageFactory<E, D> =
    Box<dyn Fn(&EventContext<E>, &SagaInstance<D>) -> Arc<dyn AnyMessage> + Send + Sync>;
type CatchHandler<E, D> =
    Box<dyn Fn(&mut EventContext<E>, &mut SagaInstance<D>, &anyhow::Error) + Send + Sync>;

enum SyncStep<E, D> {
    Action(Action<E, D>),
    Schedule {
        factory: MessageFactory<E, D>,
        delay: Duration,
    },
}

enum AsyncStep<E, D> {
    Task(Task<E, D>),
    Publish(MessageFactory<E, D>),
}

struct Branch<E, D> {
    condition: Predicate<E, D>,
    then: Option<ActivityChain<E, D>>,
    otherwise: Option<ActivityChain<E, D>>,
}

/// Steps and directives run for one event in one state.
pub struct ActivityChain<E, D> {
    filters: Vec<Predicate<E, D>>,
    sync_steps: Vec<SyncStep<E, D>>,
    async_steps: Vec<AsyncStep<E, D>>,
    branches: Vec<Branch<E, D>>,
    transition: Option<State>,
    cancel: bool,
    finalize: bool,
    catch: Option<CatchHandler<E, D>>,
}

impl<E: Message, D: SagaData> Default for ActivityChain<E, D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Message, D: SagaData> ActivityChain<E, D> {
    pub fn new() -> Self {
        Self {
            filters: Vec::new(),
            sync_steps: Vec::new(),
            async_steps: Vec::new(),
            branches: Vec::new(),
            transition: None,
            cancel: false,
            finalize: false,
            catch: None,
        }
    }

    /// Only run the chain when `predicate` holds.
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&EventContext<E>, &SagaInstance<D>) -> bool + Send + Sync + 'static,
    {
        self.filters.push(Box::new(predicate));
        self
    }

    /// Infallible synchronous step.
    pub fn then<F>(mut self, step: F) -> Self
    where
        F: Fn(&mut EventContext<E>, &mut SagaInstance<D>) + Send + Sync + 'static,
    {
        self.sync_steps
            .push(SyncStep::Action(Box::new(move |ctx, saga| {
                step(ctx, saga);
                Ok(())
            })));
        self
    }

    /// Fallible synchronous step.
    pub fn try_then<F>(mut self, step: F) -> Self
    where
        F: Fn(&mut EventContext<E>, &mut SagaInstance<D>) -> anyhow::Result<()>
            + Send
            + Sync
            + 'static,
    {
        self.sync_steps.push(SyncStep::Action(Box::new(step)));
        self
    }

    /// Asynchronous step over the event and a snapshot of the instance.
    pub fn then_async<F, Fut>(mut self, step: F) -> Self
    where
        F: Fn(Arc<E>, SagaInstance<D>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.async_steps.push(AsyncStep::Task(Box::new(move |event, saga| {
            step(event, saga).boxed()
        })));
        self
    }

    /// Build a message and hand it to the engine's publisher.
    pub fn publish<M, F>(mut self, factory: F) -> Self
    where
        M: AnyMessage,
        F: Fn(&EventContext<E>, &SagaInstance<D>) -> M + Send + Sync + 'static,
    {
        self.async_steps
            .push(AsyncStep::Publish(Box::new(move |ctx, saga| {
                Arc::new(factory(ctx, saga)) as Arc<dyn AnyMessage>
            })));
        self
    }

    /// Build a message and feed it back into this engine after `delay`.
    pub fn schedule<M, F>(mut self, factory: F, delay: Duration) -> Self
    where
        M: AnyMessage,
        F: Fn(&EventContext<E>, &SagaInstance<D>) -> M + Send + Sync + 'static,
    {
        self.sync_steps.push(SyncStep::Schedule {
            factory: Box::new(move |ctx, saga| Arc::new(factory(ctx, saga)) as Arc<dyn AnyMessage>),
            delay,
        });
        self
    }

    /// Run `then` when `condition` holds and `otherwise` when it does not.
    pub fn if_else<C, T, O>(mut self, condition: C, then: T, otherwise: O) -> Self
    where
        C: Fn(&EventContext<E>, &SagaInstance<D>) -> bool + Send + Sync + 'static,
        T: FnOnce(Self) -> Self,
        O: FnOnce(Self) -> Self,
    {
        self.branches.push(Branch {
            condition: Box::new(condition),
            then: Some(then(Self::new())),
            otherwise: Some(otherwise(Self::new())),
        });
        self
    }

    /// Run `then` when `condition` holds.
    pub fn if_then<C, T>(mut self, condition: C, then: T) -> Self
    where
        C: Fn(&EventContext<E>, &SagaInstance<D>) -> bool + Send + Sync + 'static,
        T: FnOnce(Self) -> Self,
    {
        self.branches.push(Branch {
            condition: Box::new(condition),
            then: Some(then(Self::new())),
            otherwise: None,
        });
        self
    }

    pub fn transition_to(mut self, state: State) -> Self {
        self.transition = Some(state);
        self
    }

    pub fn cancel(mut self) -> Self {
        self.cancel = true;
        self
    }

    pub fn finalize(mut self) -> Self {
        self.finalize = true;
        self
    }

    /// Handle step failures instead of failing the event.
    ///
    /// Directives still apply after the handler returns; call
    /// [`EventContext::request_cancel`] from the handler to compensate.
    pub fn catch<F>(mut self, handler: F) -> Self
    where
        F: Fn(&mut EventContext<E>, &mut SagaInstance<D>, &anyhow::Error) + Send + Sync + 'static,
    {
        self.catch = Some(Box::new(handler));
        self
    }

    fn execute<'a>(
        &'a self,
        ctx: &'a mut EventContext<E>,
        saga: &'a mut SagaInstance<D>,
        env: &'a ChainEnv<'a>,
    ) -> BoxFuture<'a, Result<ChainResult, SagaError>> {
        async move {
            match self.run_steps(ctx, saga, env).await {
                Ok(ChainResult::Filtered) => return Ok(ChainResult::Filtered),
                Ok(ChainResult::Applied) => {}
                Err(error) => match &self.catch {
                    Some(handler) => {
                        warn!(
                            saga_id = %saga.id,
                            event = E::MESSAGE_TYPE,
                            error = %error,
                            "activity failed, running exception handler"
                        );
                        handler(ctx, saga, &error);
                    }
                    None => return Err(into_saga_error(E::MESSAGE_TYPE, error)),
                },
            }

            if self.cancel || ctx.is_cancel_requested() {
                let from = saga.current_state.clone();
                if !saga.cancelled {
                    saga.cancelled = true;
                    saga.move_to(State::CANCELLED);
                }
                if let Some(target) = self.transition {
                    saga.move_to(target);
                }
                ctx.request_cancel();
                env.log_transition(&saga.id, &from, &saga.current_state);
                return Ok(ChainResult::Applied);
            }

            if let Some(target) = self.transition {
                let from = saga.current_state.clone();
                if env.strict && !env.transitions.permits(&from, target) {
                    return Err(SagaError::InvalidStateTransition {
                        from,
                        to: target.name().to_string(),
                    });
                }
                saga.move_to(target);
                env.log_transition(&saga.id, &from, target.name());
            }

            if self.finalize {
                let from = saga.current_state.clone();
                saga.completed = true;
                saga.move_to(State::COMPLETED);
                env.log_transition(&saga.id, &from, State::COMPLETED.name());
            }

            Ok(ChainResult::Applied)
        }
        .boxed()
    }

    fn run_steps<'a>(
        &'a self,
        ctx: &'a mut EventContext<E>,
        saga: &'a mut SagaInstance<D>,
        env: &'a ChainEnv<'a>,
    ) -> BoxFuture<'a, anyhow::Result<ChainResult>> {
        async move {
            if !self.filters.iter().all(|passes| passes(&*ctx, &*saga)) {
                debug!(saga_id = %saga.id, event = E::MESSAGE_TYPE, "filtered");
                return Ok(ChainResult::Filtered);
            }

            for step in &self.sync_steps {
                match step {
                    SyncStep::Action(action) => action(ctx, saga)?,
                    SyncStep::Schedule { factory, delay } => {
                        let message = factory(&*ctx, &*saga);
                        debug!(
                            saga_id = %saga.id,
                            message_type = message.message_type(),
                            delay_ms = delay.as_millis() as u64,
                            "scheduling message"
                        );
                        env.scheduler
                            .schedule(message.clone(), *delay, env.sink.clone());
                        ctx.record_scheduled(message, *delay);
                    }
                }
            }

            for step in &self.async_steps {
                match step {
                    AsyncStep::Task(task) => task(ctx.event().clone(), saga.clone()).await?,
                    AsyncStep::Publish(factory) => {
                        let message = factory(&*ctx, &*saga);
                        env.publisher
                            .publish(message.clone())
                            .await
                            .with_context(|| format!("failed to publish {}", message.message_type()))?;
                        ctx.record_published(message);
                    }
                }
            }

            for branch in &self.branches {
                let chosen = if (branch.condition)(&*ctx, &*saga) {
                    branch.then.as_ref()
                } else {
                    branch.otherwise.as_ref()
                };
                if let Some(chain) = chosen {
                    chain.execute(ctx, saga, env).await?;
                }
            }

            Ok(ChainResult::Applied)
        }
        .boxed()
    }

    fn collect_targets(&self, out: &mut Vec<State>) {
        out.extend(self.transition);
        for branch in &self.branches {
            for chain in [&branch.then, &branch.otherwise].into_iter().flatten() {
                chain.collect_targets(out);
            }
        }
    }
}

/// Step failures keep their identity when they already are saga errors
/// raised by a nested branch.
fn into_saga_error(event_type: &str, error: anyhow::Error) -> SagaError {
    match error.downcast::<SagaError>() {
        Ok(saga_error) => saga_error,
        Err(source) => SagaError::Activity {
            event_type: event_type.to_string(),
            source,
        },
    }
}

impl<E, D> std::fmt::Debug for ActivityChain<E, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityChain")
            .field("filters", &self.filters.len())
            .field("sync_steps", &self.sync_steps.len())
            .field("async_steps", &self.async_steps.len())
            .field("branches", &self.branches.len())
            .field("transition", &self.transition)
            .field("cancel", &self.cancel)
            .field("finalize", &self.finalize)
            .field("catch", &self.catch.is_some())
            .finish()
    }
}

// =============================================================================
// Type-erased execution
// =============================================================================

/// Outcome of running a chain against an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChainResult {
    /// A top-level filter rejected the event; nothing may be saved.
    Filtered,
    Applied,
}

/// Collaborators shared by every chain of one engine.
pub(crate) struct ChainEnv<'a> {
    pub(crate) publisher: &'a dyn Publisher,
    pub(crate) scheduler: &'a dyn Scheduler,
    pub(crate) sink: Weak<dyn MessageSink>,
    pub(crate) transitions: &'a TransitionTable,
    pub(crate) strict: bool,
    pub(crate) log_progress: bool,
}

impl ChainEnv<'_> {
    fn log_transition(&self, saga_id: &str, from: &str, to: &str) {
        if from == to {
            return;
        }
        if self.log_progress {
            info!(%saga_id, %from, %to, "saga transitioned");
        } else {
            debug!(%saga_id, %from, %to, "saga transitioned");
        }
    }
}

/// A chain stored on a definition, independent of its event type.
pub(crate) trait ErasedChain<D>: Send + Sync {
    fn run<'a>(
        &'a self,
        message: &dyn AnyMessage,
        correlation_id: &str,
        saga: &'a mut SagaInstance<D>,
        env: &'a ChainEnv<'a>,
    ) -> BoxFuture<'a, Result<ChainResult, SagaError>>;

    /// Every state this chain can transition into, branches included.
    fn targets(&self) -> Vec<State>;
}

impl<E: Message, D: SagaData> ErasedChain<D> for ActivityChain<E, D> {
    fn run<'a>(
        &'a self,
        message: &dyn AnyMessage,
        correlation_id: &str,
        saga: &'a mut SagaInstance<D>,
        env: &'a ChainEnv<'a>,
    ) -> BoxFuture<'a, Result<ChainResult, SagaError>> {
        let Some(event) = message.downcast_ref::<E>() else {
            let source = anyhow::anyhow!(
                "chain for {} received {}",
                E::MESSAGE_TYPE,
                message.message_type()
            );
            return futures::future::ready(Err(SagaError::Activity {
                event_type: E::MESSAGE_TYPE.to_string(),
                source,
            }))
            .boxed();
        };
        let mut ctx = EventContext::new(Arc::new(event.clone()), correlation_id);
        async move { self.execute(&mut ctx, saga, env).await }.boxed()
    }

    fn targets(&self) -> Vec<State> {
        let mut out = Vec::new();
        self.collect_targets(&mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use courier_core::impl_event;
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::publisher::NoopPublisher;

    const OPEN: State = State::new("Open");
    const CLOSED: State = State::new("Closed");

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Ping {
        id: String,
        amount: u32,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Pong {
        id: String,
    }

    impl_event!(Ping, Pong);

    #[derive(Default)]
    struct RecordingScheduler {
        scheduled: Mutex<Vec<(&'static str, Duration)>>,
    }

    impl Scheduler for RecordingScheduler {
        fn schedule(&self, message: Arc<dyn AnyMessage>, delay: Duration, _sink: Weak<dyn MessageSink>) {
            self.scheduled
                .lock()
                .unwrap()
                .push((message.message_type(), delay));
        }
    }

    struct NullSink;

    #[async_trait]
    impl MessageSink for NullSink {
        async fn deliver(&self, _message: Arc<dyn AnyMessage>) -> Result<(), SagaError> {
            Ok(())
        }
    }

    struct Harness {
        scheduler: RecordingScheduler,
        transitions: TransitionTable,
        strict: bool,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                scheduler: RecordingScheduler::default(),
                transitions: TransitionTable::default(),
                strict: false,
            }
        }

        async fn run(
            &self,
            chain: &ActivityChain<Ping, u32>,
            event: Ping,
            saga: &mut SagaInstance<u32>,
        ) -> Result<ChainResult, SagaError> {
            let sink: Weak<dyn MessageSink> = Weak::<NullSink>::new();
            let env = ChainEnv {
                publisher: &NoopPublisher,
                scheduler: &self.scheduler,
                sink,
                transitions: &self.transitions,
                strict: self.strict,
                log_progress: false,
            };
            let id = event.id.clone();
            chain.run(&event, &id, saga, &env).await
        }
    }

    fn ping(amount: u32) -> Ping {
        Ping {
            id: "p-1".into(),
            amount,
        }
    }

    #[tokio::test]
    async fn test_filter_short_circuits() {
        let chain = ActivityChain::<Ping, u32>::new()
            .filter(|ctx, _| ctx.data().amount > 10)
            .then(|ctx, saga| saga.data += ctx.data().amount)
            .transition_to(OPEN);
        let mut saga = SagaInstance::new("p-1");

        let result = Harness::new().run(&chain, ping(5), &mut saga).await.unwrap();

        assert_eq!(result, ChainResult::Filtered);
        assert_eq!(saga.data, 0);
        assert!(saga.is_in(State::INITIAL));
    }

    #[tokio::test]
    async fn test_steps_then_transition_then_finalize() {
        let chain = ActivityChain::<Ping, u32>::new()
            .then(|ctx, saga| saga.data += ctx.data().amount)
            .then_async(|event, saga| async move {
                assert_eq!(saga.data, event.amount);
                Ok(())
            })
            .schedule(|ctx, _| Pong { id: ctx.data().id.clone() }, Duration::from_secs(5))
            .transition_to(OPEN)
            .finalize();
        let harness = Harness::new();
        let mut saga = SagaInstance::new("p-1");

        harness.run(&chain, ping(7), &mut saga).await.unwrap();

        assert_eq!(saga.data, 7);
        assert!(saga.completed);
        assert!(saga.is_in(State::COMPLETED));
        assert_eq!(
            *harness.scheduler.scheduled.lock().unwrap(),
            vec![("Pong", Duration::from_secs(5))]
        );
    }

    #[tokio::test]
    async fn test_branches_see_emitted_messages() {
        let chain = ActivityChain::<Ping, u32>::new()
            .schedule(|ctx, _| Pong { id: ctx.data().id.clone() }, Duration::from_secs(30))
            .publish(|ctx, _| Pong { id: ctx.data().id.clone() })
            .if_then(
                |ctx, _| !ctx.published().is_empty(),
                |then| {
                    then.then(|ctx, saga| {
                        let scheduled = &ctx.scheduled()[0];
                        assert_eq!(scheduled.message.message_type(), "Pong");
                        assert_eq!(scheduled.delay, Duration::from_secs(30));
                        saga.data = (ctx.published().len() * 10 + ctx.scheduled().len()) as u32;
                    })
                    .transition_to(OPEN)
                },
            );
        let mut saga = SagaInstance::new("p-1");

        Harness::new().run(&chain, ping(1), &mut saga).await.unwrap();

        assert_eq!(saga.data, 11);
        assert!(saga.is_in(OPEN));
    }

    #[tokio::test]
    async fn test_uncaught_failure_becomes_activity_error() {
        let chain = ActivityChain::<Ping, u32>::new()
            .try_then(|_, _| anyhow::bail!("ledger unavailable"))
            .transition_to(OPEN);
        let mut saga = SagaInstance::new("p-1");

        let err = Harness::new().run(&chain, ping(1), &mut saga).await.unwrap_err();

        assert!(matches!(err, SagaError::Activity { ref event_type, .. } if event_type == "Ping"));
        assert!(err.to_string().contains("ledger unavailable"));
        assert!(saga.is_in(State::INITIAL));
    }

    #[tokio::test]
    async fn test_catch_swallows_and_directives_still_apply() {
        let chain = ActivityChain::<Ping, u32>::new()
            .then(|_, saga| saga.data = 1)
            .then_async(|_, _| async { Err::<(), _>(anyhow::anyhow!("downstream refused")) })
            .catch(|ctx, saga, error| {
                assert!(error.to_string().contains("refused"));
                saga.data = 99;
                ctx.request_cancel();
            })
            .transition_to(CLOSED);
        let mut saga = SagaInstance::new("p-1");

        Harness::new().run(&chain, ping(1), &mut saga).await.unwrap();

        assert_eq!(saga.data, 99);
        assert!(saga.cancelled);
        assert!(saga.is_in(CLOSED));
    }

    #[tokio::test]
    async fn test_cancel_without_target_lands_in_cancelled() {
        let chain = ActivityChain::<Ping, u32>::new().cancel().finalize();
        let mut saga = SagaInstance::new("p-1");

        Harness::new().run(&chain, ping(1), &mut saga).await.unwrap();

        assert!(saga.cancelled);
        assert!(!saga.completed);
        assert!(saga.is_in(State::CANCELLED));
    }

    #[tokio::test]
    async fn test_branches_run_their_own_directives() {
        let chain = ActivityChain::<Ping, u32>::new().if_else(
            |ctx, _| ctx.data().amount >= 100,
            |then| then.then(|_, saga| saga.data = 1).transition_to(OPEN),
            |otherwise| otherwise.then(|_, saga| saga.data = 2).transition_to(CLOSED),
        );
        let harness = Harness::new();

        let mut high = SagaInstance::new("p-1");
        harness.run(&chain, ping(150), &mut high).await.unwrap();
        assert_eq!(high.data, 1);
        assert!(high.is_in(OPEN));

        let mut low = SagaInstance::new("p-2");
        harness.run(&chain, ping(3), &mut low).await.unwrap();
        assert_eq!(low.data, 2);
        assert!(low.is_in(CLOSED));
    }

    #[tokio::test]
    async fn test_nested_cancel_is_sticky() {
        let chain = ActivityChain::<Ping, u32>::new()
            .if_then(|ctx, _| ctx.data().amount == 0, |then| then.cancel().transition_to(CLOSED))
            .finalize();
        let mut saga = SagaInstance::new("p-1");

        Harness::new().run(&chain, ping(0), &mut saga).await.unwrap();

        assert!(saga.cancelled);
        assert!(!saga.completed);
        assert!(saga.is_in(CLOSED));
    }

    #[tokio::test]
    async fn test_strict_transition_rejected() {
        let chain = ActivityChain::<Ping, u32>::new()
            .then(|_, saga| saga.data = 5)
            .transition_to(CLOSED);
        let mut harness = Harness::new();
        harness.transitions.allow(State::INITIAL, OPEN);
        harness.strict = true;
        let mut saga = SagaInstance::new("p-1");

        let err = harness.run(&chain, ping(1), &mut saga).await.unwrap_err();

        assert!(matches!(
            err,
            SagaError::InvalidStateTransition { ref from, ref to } if from == "Initial" && to == "Closed"
        ));
        assert!(saga.is_in(State::INITIAL));
    }

    #[test]
    fn test_targets_include_branches() {
        let chain = ActivityChain::<Ping, u32>::new()
            .transition_to(OPEN)
            .if_then(|_, _| true, |then| then.transition_to(CLOSED));

        assert_eq!(ErasedChain::<u32>::targets(&chain), vec![OPEN, CLOSED]);
    }
}
