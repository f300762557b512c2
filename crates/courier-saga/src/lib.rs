//! # Courier Saga
//!
//! Long-running, event-driven workflows as declarative state machines.
//!
//! A saga instance is keyed by a correlation id extracted from each event. The
//! [`SagaDefinition`] says which [`ActivityChain`] runs for an event in a given
//! [`State`]; the [`SagaEngine`] loads the instance, runs the chain and saves
//! the result with an optimistic version check.
//!
//! ## Defining a Saga
//!
//! ```ignore
//! const SUBMITTED: State = State::new("Submitted");
//! const AWAITING_PAYMENT: State = State::new("AwaitingPayment");
//!
//! let definition = SagaDefinition::<OrderData>::builder("order")
//!     .states([SUBMITTED, AWAITING_PAYMENT])
//!     .event::<OrderSubmitted>(|e| e.order_id.clone())
//!     .event::<OrderAccepted>(|e| e.order_id.clone())
//!     .event::<PaymentTimeout>(|e| e.order_id.clone())
//!     .initially(
//!         ActivityChain::<OrderSubmitted, OrderData>::new()
//!             .then(|ctx, saga| saga.data.total = ctx.data().total)
//!             .transition_to(SUBMITTED),
//!     )
//!     .during(
//!         SUBMITTED,
//!         ActivityChain::<OrderAccepted, _>::new()
//!             .schedule(|ctx, _| PaymentTimeout { order_id: ctx.correlation_id().into() }, Duration::from_secs(30))
//!             .transition_to(AWAITING_PAYMENT),
//!     )
//!     .during(AWAITING_PAYMENT, ActivityChain::<PaymentTimeout, _>::new().cancel())
//!     .allow_transition(State::INITIAL, SUBMITTED)
//!     .build()?;
//!
//! let engine = SagaEngine::builder(definition, Arc::new(InMemorySagaRepository::new()))
//!     .with_config(SagaConfig::strict())
//!     .build();
//!
//! engine.consume(OrderSubmitted { order_id: "o-1".into(), total: 100 }).await?;
//! ```
//!
//! ## Failure Handling
//!
//! - Version conflicts and events that outrun their saga's creation are
//!   retried with exponential backoff ([`RetryPolicy`]), each with its own
//!   budget.
//! - Step failures surface as [`SagaError::Activity`] unless the chain has a
//!   `catch` handler; with [`SagaConfig::auto_compensate`] the instance is
//!   cancelled first.
//! - Strict mode rejects transitions missing from the allowed-transition
//!   table with [`SagaError::InvalidStateTransition`], leaving the stored
//!   instance untouched.

mod activity;
mod config;
mod context;
mod definition;
mod engine;
mod error;
mod publisher;
mod repository;
mod retry;
mod scheduler;
mod state;

pub use activity::ActivityChain;
pub use config::SagaConfig;
pub use context::{EventContext, ScheduledMessage};
pub use definition::{SagaDefinition, SagaDefinitionBuilder, TransitionTable};
pub use engine::{ConsumeOutcome, IgnoreReason, SagaEngine, SagaEngineBuilder};
pub use error::{RetryClass, SagaError, StoreError, SAGA_NOT_FOUND_YET};
pub use publisher::{NoopPublisher, Publisher, TransportPublisher};
pub use repository::{InMemorySagaRepository, SagaCounts, SagaRepository};
pub use retry::RetryPolicy;
pub use scheduler::{MessageSink, Scheduler, TokioScheduler};
pub use state::{SagaData, SagaInstance, State};
