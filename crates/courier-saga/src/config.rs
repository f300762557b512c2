//! Behavioural knobs for a saga engine.

use std::time::Duration;

use crate::retry::RetryPolicy;

/// Engine configuration, passed to [`SagaEngineBuilder::with_config`].
///
/// # Defaults
///
/// - `conflict_retry`: [`RetryPolicy::default`] (5 retries, 1.2 base, 10ms scale, 500ms cap)
/// - `missing_saga_retry`: same backoff, 5 retries
/// - `strict_transitions`: off
/// - `auto_compensate`: off
/// - `log_progress`: on
///
/// [`SagaEngineBuilder::with_config`]: crate::SagaEngineBuilder::with_config
#[derive(Debug, Clone)]
pub struct SagaConfig {
    /// Budget for optimistic-version conflicts on save.
    pub conflict_retry: RetryPolicy,
    /// Budget for events that arrive before their saga has been created.
    pub missing_saga_retry: RetryPolicy,
    /// Validate every transition against the definition's allowed-transition table.
    pub strict_transitions: bool,
    /// When a chain fails without an exception handler, persist the instance as
    /// cancelled before returning the error.
    pub auto_compensate: bool,
    /// Log state transitions at `info` instead of `debug`.
    pub log_progress: bool,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            conflict_retry: RetryPolicy::default(),
            missing_saga_retry: RetryPolicy::default(),
            strict_transitions: false,
            auto_compensate: false,
            log_progress: true,
        }
    }
}

impl SagaConfig {
    pub fn strict() -> Self {
        Self::default().with_strict_transitions(true)
    }

    pub fn with_conflict_retry(mut self, policy: RetryPolicy) -> Self {
        self.conflict_retry = policy;
        self
    }

    pub fn with_missing_saga_retry(mut self, policy: RetryPolicy) -> Self {
        self.missing_saga_retry = policy;
        self
    }

    /// Add the same jitter bound to both retry budgets.
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.conflict_retry = self.conflict_retry.with_jitter(jitter);
        self.missing_saga_retry = self.missing_saga_retry.with_jitter(jitter);
        self
    }

    pub fn with_strict_transitions(mut self, strict: bool) -> Self {
        self.strict_transitions = strict;
        self
    }

    pub fn with_auto_compensate(mut self, enabled: bool) -> Self {
        self.auto_compensate = enabled;
        self
    }

    pub fn with_log_progress(mut self, enabled: bool) -> Self {
        self.log_progress = enabled;
        self
    }
}
