//! Saga errors and their retry classification.

use thiserror::Error;

/// State label reported when a correlated event arrives before the saga exists.
pub const SAGA_NOT_FOUND_YET: &str = "Saga not found yet";

/// Errors raised while defining or running a saga.
#[derive(Debug, Error)]
pub enum SagaError {
    /// No activity is bound to the event in the instance's current state.
    #[error("handler not found for event '{event_type}' in state '{state}'")]
    HandlerNotFound {
        /// Routing name of the event.
        event_type: String,
        /// Current state, or [`SAGA_NOT_FOUND_YET`] when no instance exists.
        state: String,
    },

    /// Strict mode rejected a transition.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// State the instance was in.
        from: String,
        /// Requested target state.
        to: String,
    },

    /// Another writer saved the instance since it was loaded.
    #[error("saga {id} was modified concurrently")]
    Conflict {
        /// Correlation id of the instance.
        id: String,
    },

    /// The repository failed for a reason other than a version conflict.
    #[error("saga repository failed: {0}")]
    Store(#[source] anyhow::Error),

    /// A step of the activity chain failed and no exception handler caught it.
    #[error("activity for event '{event_type}' failed: {source}")]
    Activity {
        /// Routing name of the event being handled.
        event_type: String,
        /// Failure raised by the step.
        #[source]
        source: anyhow::Error,
    },

    /// The saga definition is inconsistent.
    #[error("invalid saga definition: {0}")]
    Definition(String),

    /// The engine was dropped before a scheduled message could be delivered.
    #[error("saga engine is no longer running")]
    EngineStopped,
}

/// Independent retry budgets for transient saga failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Optimistic-version conflict on save.
    Conflict,
    /// Correlated event arrived before the creating event was persisted.
    NotYetCreated,
}

impl SagaError {
    /// Which retry budget applies, or `None` when the failure is final.
    pub fn retry_class(&self) -> Option<RetryClass> {
        match self {
            SagaError::Conflict { .. } => Some(RetryClass::Conflict),
            SagaError::HandlerNotFound { state, .. } if state == SAGA_NOT_FOUND_YET => {
                Some(RetryClass::NotYetCreated)
            }
            _ => None,
        }
    }
}

/// Errors from saga instance storage.
///
/// [`StoreError::Conflict`] means another writer got there first and the event
/// should be reprocessed against fresh state. [`StoreError::Backend`] means
/// storage itself failed.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The stored version no longer matches the version that was loaded.
    #[error("version conflict: saga was modified concurrently")]
    Conflict,

    /// Storage backend failed (timeout, connection, serialization).
    #[error("storage backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_not_yet_created_lookup_is_retryable() {
        let missing = SagaError::HandlerNotFound {
            event_type: "OrderAccepted".into(),
            state: SAGA_NOT_FOUND_YET.into(),
        };
        let unbound = SagaError::HandlerNotFound {
            event_type: "OrderAccepted".into(),
            state: "Submitted".into(),
        };

        assert_eq!(missing.retry_class(), Some(RetryClass::NotYetCreated));
        assert_eq!(unbound.retry_class(), None);
        assert_eq!(
            SagaError::Conflict { id: "o-1".into() }.retry_class(),
            Some(RetryClass::Conflict)
        );
        assert_eq!(
            SagaError::InvalidStateTransition {
                from: "A".into(),
                to: "B".into()
            }
            .retry_class(),
            None
        );
    }

    #[test]
    fn test_handler_not_found_message() {
        let err = SagaError::HandlerNotFound {
            event_type: "PaymentReceived".into(),
            state: "Submitted".into(),
        };
        assert_eq!(
            err.to_string(),
            "handler not found for event 'PaymentReceived' in state 'Submitted'"
        );
    }
}
