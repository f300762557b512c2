//! Saga states and persisted instances.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A named node in a saga's state machine.
///
/// States are declared as constants and registered on the definition:
///
/// ```ignore
/// const SUBMITTED: State = State::new("Submitted");
/// const AWAITING_PAYMENT: State = State::new("AwaitingPayment");
///
/// SagaDefinition::builder("order").states([SUBMITTED, AWAITING_PAYMENT])
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct State(&'static str);

impl State {
    /// Pseudo-state of an instance that has not been persisted yet.
    pub const INITIAL: State = State("Initial");
    /// Terminal marker set by finalization.
    pub const COMPLETED: State = State("Completed");
    /// Terminal marker set by cancellation without an explicit target.
    pub const CANCELLED: State = State("Cancelled");

    pub const fn new(name: &'static str) -> Self {
        State(name)
    }

    pub const fn name(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

impl PartialEq<State> for str {
    fn eq(&self, other: &State) -> bool {
        self == other.0
    }
}

impl PartialEq<State> for String {
    fn eq(&self, other: &State) -> bool {
        self.as_str() == other.0
    }
}

/// Domain data owned by a concrete saga.
pub trait SagaData: Default + Clone + Send + Sync + 'static {}

impl<T: Default + Clone + Send + Sync + 'static> SagaData for T {}

/// One persisted saga instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaInstance<D> {
    /// Correlation key extracted from the events.
    pub id: String,
    pub current_state: String,
    pub cancelled: bool,
    pub completed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Optimistic concurrency counter. Zero until the first save.
    pub version: u64,
    pub data: D,
}

impl<D: SagaData> SagaInstance<D> {
    /// A fresh, unsaved instance in [`State::INITIAL`].
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            current_state: State::INITIAL.name().to_string(),
            cancelled: false,
            completed: false,
            created_at: now,
            updated_at: now,
            version: 0,
            data: D::default(),
        }
    }
}

impl<D> SagaInstance<D> {
    pub fn is_in(&self, state: State) -> bool {
        self.current_state == state.name()
    }

    /// Completed or cancelled; no further events apply.
    pub fn is_terminal(&self) -> bool {
        self.completed || self.cancelled
    }

    /// Never saved.
    pub fn is_new(&self) -> bool {
        self.version == 0
    }

    pub(crate) fn move_to(&mut self, state: State) {
        self.current_state = state.name().to_string();
    }
}
