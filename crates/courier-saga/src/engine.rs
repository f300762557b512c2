//! The saga engine: routes correlated events through a definition.
//!
//! # Processing an Event
//!
//! 1. Events the definition does not declare are ignored.
//! 2. The correlation key selects the instance. A missing instance is created
//!    only when the event has an `initially` binding; otherwise the event
//!    fails with [`SagaError::HandlerNotFound`] in state
//!    [`SAGA_NOT_FOUND_YET`], which is retried because the creating event may
//!    still be in flight.
//! 3. Completed or cancelled instances absorb every event.
//! 4. The `(state, event)` binding runs, then the instance is saved with a
//!    version check. A concurrent writer turns the save into
//!    [`SagaError::Conflict`], which is retried against fresh state.
//!
//! The two retryable failures have independent budgets, see [`SagaConfig`].

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::Utc;
use courier_core::{AnyMessage, Message};
use tracing::{debug, error, warn};

use crate::activity::{ChainEnv, ChainResult};
use crate::config::SagaConfig;
use crate::definition::SagaDefinition;
use crate::error::{RetryClass, SagaError, StoreError, SAGA_NOT_FOUND_YET};
use crate::publisher::{NoopPublisher, Publisher};
use crate::repository::{SagaCounts, SagaRepository};
use crate::scheduler::{MessageSink, Scheduler, TokioScheduler};
use crate::state::{SagaData, SagaInstance, State};

/// Why an event left no trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// The definition does not declare the event.
    UnknownEvent,
    /// The instance is already completed or cancelled.
    Terminal,
    /// The instance is still in `Initial` and nothing is bound for the event.
    NoBinding,
}

/// Result of consuming one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumeOutcome {
    Ignored(IgnoreReason),
    /// A filter rejected the event; nothing was saved.
    Filtered,
    /// The chain ran and the instance was saved in `state`.
    Applied { state: String },
}

impl ConsumeOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, ConsumeOutcome::Applied { .. })
    }
}

/// Runs one [`SagaDefinition`] against a repository.
///
/// Built with [`SagaEngine::builder`] and always held in an [`Arc`], so that
/// scheduled messages can find their way back to the engine.
pub struct SagaEngine<D: SagaData> {
    definition: SagaDefinition<D>,
    repository: Arc<dyn SagaRepository<D>>,
    publisher: Arc<dyn Publisher>,
    scheduler: Arc<dyn Scheduler>,
    config: SagaConfig,
    self_ref: Weak<SagaEngine<D>>,
}

impl<D: SagaData> SagaEngine<D> {
    pub fn builder<R>(definition: SagaDefinition<D>, repository: Arc<R>) -> SagaEngineBuilder<D>
    where
        R: SagaRepository<D>,
    {
        SagaEngineBuilder {
            definition,
            repository,
            publisher: Arc::new(NoopPublisher),
            scheduler: Arc::new(TokioScheduler),
            config: SagaConfig::default(),
        }
    }

    pub fn definition(&self) -> &SagaDefinition<D> {
        &self.definition
    }

    pub fn config(&self) -> &SagaConfig {
        &self.config
    }

    /// Consume a typed event, retrying transient failures.
    pub async fn consume<E: Message>(&self, event: E) -> Result<ConsumeOutcome, SagaError> {
        self.consume_message(&event).await
    }

    /// Consume a type-erased event, retrying transient failures.
    ///
    /// # Errors
    ///
    /// Non-retryable failures are returned as soon as they occur. Retryable
    /// ones ([`SagaError::retry_class`]) are returned once their budget is
    /// exhausted.
    pub async fn consume_message(&self, message: &dyn AnyMessage) -> Result<ConsumeOutcome, SagaError> {
        let mut conflicts = 0u32;
        let mut missing = 0u32;

        loop {
            let error = match self.process(message).await {
                Ok(outcome) => return Ok(outcome),
                Err(error) => error,
            };

            let (attempt, policy) = match error.retry_class() {
                Some(RetryClass::Conflict) => {
                    conflicts += 1;
                    (conflicts, &self.config.conflict_retry)
                }
                Some(RetryClass::NotYetCreated) => {
                    missing += 1;
                    (missing, &self.config.missing_saga_retry)
                }
                None => return Err(error),
            };

            if !policy.allows(attempt) {
                warn!(
                    saga = self.definition.name(),
                    event = message.message_type(),
                    attempts = attempt,
                    error = %error,
                    "retry budget exhausted"
                );
                return Err(error);
            }

            let delay = policy.delay_for_attempt(attempt);
            debug!(
                saga = self.definition.name(),
                event = message.message_type(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "retrying saga event"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// One attempt at processing `message`, without retries.
    pub async fn process(&self, message: &dyn AnyMessage) -> Result<ConsumeOutcome, SagaError> {
        let event_type = message.message_type();
        let Some(correlation_id) = self.definition.correlate(message) else {
            debug!(saga = self.definition.name(), event = event_type, "event not part of saga");
            return Ok(ConsumeOutcome::Ignored(IgnoreReason::UnknownEvent));
        };

        let stored = self
            .repository
            .find_by_id(&correlation_id)
            .await
            .map_err(|e| store_error(&correlation_id, e))?;

        let mut saga = match stored {
            Some(saga) => saga,
            None if self.definition.starts_with(event_type) => SagaInstance::new(correlation_id.clone()),
            None => {
                return Err(SagaError::HandlerNotFound {
                    event_type: event_type.to_string(),
                    state: SAGA_NOT_FOUND_YET.to_string(),
                })
            }
        };

        if saga.is_terminal() {
            debug!(saga_id = %saga.id, event = event_type, "saga already finished, ignoring");
            return Ok(ConsumeOutcome::Ignored(IgnoreReason::Terminal));
        }

        let Some(chain) = self.definition.binding(&saga.current_state, event_type) else {
            if saga.is_in(State::INITIAL) {
                return Ok(ConsumeOutcome::Ignored(IgnoreReason::NoBinding));
            }
            return Err(SagaError::HandlerNotFound {
                event_type: event_type.to_string(),
                state: saga.current_state.clone(),
            });
        };

        debug!(
            saga_id = %saga.id,
            state = %saga.current_state,
            event = event_type,
            "processing saga event"
        );

        let sink: Weak<dyn MessageSink> = self.self_ref.clone();
        let env = ChainEnv {
            publisher: self.publisher.as_ref(),
            scheduler: self.scheduler.as_ref(),
            sink,
            transitions: self.definition.transitions(),
            strict: self.config.strict_transitions,
            log_progress: self.config.log_progress,
        };

        match chain.run(message, &correlation_id, &mut saga, &env).await {
            Ok(ChainResult::Filtered) => return Ok(ConsumeOutcome::Filtered),
            Ok(ChainResult::Applied) => {}
            Err(error @ SagaError::Activity { .. }) if self.config.auto_compensate => {
                self.compensate(saga, &error).await;
                return Err(error);
            }
            Err(error) => return Err(error),
        }

        saga.updated_at = Utc::now();
        saga.version = self.save(&saga).await?;
        Ok(ConsumeOutcome::Applied {
            state: saga.current_state,
        })
    }

    async fn compensate(&self, mut saga: SagaInstance<D>, cause: &SagaError) {
        warn!(saga_id = %saga.id, error = %cause, "activity failed, cancelling saga");
        saga.cancelled = true;
        saga.move_to(State::CANCELLED);
        saga.updated_at = Utc::now();
        if let Err(e) = self.save(&saga).await {
            error!(saga_id = %saga.id, error = %e, "failed to persist compensation");
        }
    }

    async fn save(&self, saga: &SagaInstance<D>) -> Result<u64, SagaError> {
        self.repository
            .save_and_flush(saga)
            .await
            .map_err(|e| store_error(&saga.id, e))
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn instance(&self, id: &str) -> Result<Option<SagaInstance<D>>, SagaError> {
        self.repository
            .find_by_id(id)
            .await
            .map_err(|e| store_error(id, e))
    }

    /// Instances that are neither completed nor cancelled.
    pub async fn active_instances(&self) -> Result<Vec<SagaInstance<D>>, SagaError> {
        let all = self.repository.find_all().await.map_err(|e| match e {
            StoreError::Conflict => SagaError::Store(anyhow::anyhow!("conflict while listing sagas")),
            StoreError::Backend(e) => SagaError::Store(e),
        })?;
        Ok(all.into_iter().filter(|saga| !saga.is_terminal()).collect())
    }

    pub async fn is_completed(&self, id: &str) -> Result<bool, SagaError> {
        Ok(self.instance(id).await?.is_some_and(|saga| saga.completed))
    }

    pub async fn is_cancelled(&self, id: &str) -> Result<bool, SagaError> {
        Ok(self.instance(id).await?.is_some_and(|saga| saga.cancelled))
    }

    pub async fn counts(&self) -> Result<SagaCounts, SagaError> {
        self.repository.counts().await.map_err(|e| match e {
            StoreError::Conflict => SagaError::Store(anyhow::anyhow!("conflict while counting sagas")),
            StoreError::Backend(e) => SagaError::Store(e),
        })
    }
}

fn store_error(id: &str, error: StoreError) -> SagaError {
    match error {
        StoreError::Conflict => SagaError::Conflict { id: id.to_string() },
        StoreError::Backend(e) => SagaError::Store(e),
    }
}

#[async_trait]
impl<D: SagaData> MessageSink for SagaEngine<D> {
    async fn deliver(&self, message: Arc<dyn AnyMessage>) -> Result<(), SagaError> {
        self.consume_message(message.as_ref()).await.map(|_| ())
    }
}

impl<D: SagaData> std::fmt::Debug for SagaEngine<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaEngine")
            .field("definition", &self.definition)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Wires a definition to its collaborators.
///
/// # Defaults
///
/// - publisher: [`NoopPublisher`]
/// - scheduler: [`TokioScheduler`]
/// - config: [`SagaConfig::default`]
pub struct SagaEngineBuilder<D: SagaData> {
    definition: SagaDefinition<D>,
    repository: Arc<dyn SagaRepository<D>>,
    publisher: Arc<dyn Publisher>,
    scheduler: Arc<dyn Scheduler>,
    config: SagaConfig,
}

impl<D: SagaData> SagaEngineBuilder<D> {
    pub fn with_publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.publisher = publisher;
        self
    }

    pub fn with_scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_config(mut self, config: SagaConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Arc<SagaEngine<D>> {
        Arc::new_cyclic(|self_ref| SagaEngine {
            definition: self.definition,
            repository: self.repository,
            publisher: self.publisher,
            scheduler: self.scheduler,
            config: self.config,
            self_ref: self_ref.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use courier_core::impl_event;
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::activity::ActivityChain;
    use crate::repository::InMemorySagaRepository;
    use crate::retry::RetryPolicy;

    const OPEN: State = State::new("Open");

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Opened {
        id: String,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Knocked {
        id: String,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Unrelated {
        id: String,
    }

    impl_event!(Opened, Knocked, Unrelated);

    fn engine(config: SagaConfig) -> (Arc<SagaEngine<u32>>, Arc<InMemorySagaRepository<u32>>) {
        let definition = SagaDefinition::builder("door")
            .state(OPEN)
            .event::<Opened>(|e| e.id.clone())
            .event::<Knocked>(|e| e.id.clone())
            .initially(ActivityChain::<Opened, _>::new().transition_to(OPEN))
            .during(
                OPEN,
                ActivityChain::<Knocked, _>::new()
                    .try_then(|_, _| anyhow::bail!("nobody home")),
            )
            .build()
            .unwrap();
        let repository = Arc::new(InMemorySagaRepository::new());
        let engine = SagaEngine::builder(definition, repository.clone())
            .with_config(config)
            .build();
        (engine, repository)
    }

    #[tokio::test]
    async fn test_unknown_event_is_ignored() {
        let (engine, repository) = engine(SagaConfig::default());

        let outcome = engine.consume(Unrelated { id: "d-1".into() }).await.unwrap();

        assert_eq!(outcome, ConsumeOutcome::Ignored(IgnoreReason::UnknownEvent));
        assert!(repository.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_saga_exhausts_its_own_budget() {
        let config = SagaConfig::default()
            .with_missing_saga_retry(RetryPolicy::default().with_max_retries(2));
        let (engine, _) = engine(config);
        let started = tokio::time::Instant::now();

        let err = engine.consume(Knocked { id: "d-1".into() }).await.unwrap_err();

        assert!(matches!(err, SagaError::HandlerNotFound { ref state, .. } if state == SAGA_NOT_FOUND_YET));
        // 1.2 * 10ms + 1.44 * 10ms, then the budget is spent
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_micros(26_400), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(40), "{elapsed:?}");
    }

    #[tokio::test]
    async fn test_auto_compensate_persists_cancellation() {
        let (engine, _) = engine(SagaConfig::default().with_auto_compensate(true));
        engine.consume(Opened { id: "d-1".into() }).await.unwrap();

        let err = engine.consume(Knocked { id: "d-1".into() }).await.unwrap_err();

        assert!(matches!(err, SagaError::Activity { .. }));
        let saga = engine.instance("d-1").await.unwrap().unwrap();
        assert!(saga.cancelled);
        assert!(saga.is_in(State::CANCELLED));
        assert!(engine.is_cancelled("d-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_failure_without_compensation_keeps_state() {
        let (engine, _) = engine(SagaConfig::default());
        engine.consume(Opened { id: "d-1".into() }).await.unwrap();

        assert!(engine.consume(Knocked { id: "d-1".into() }).await.is_err());

        let saga = engine.instance("d-1").await.unwrap().unwrap();
        assert!(saga.is_in(OPEN));
        assert_eq!(saga.version, 1);
        assert!(!saga.cancelled);
    }
}
