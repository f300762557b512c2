//! Exponential backoff with optional jitter.
//!
//! Delay before retry `n` (starting at 1) is
//! `min(base^n * scale, cap)` plus, when jitter is enabled, a uniformly random
//! extra in `[0, jitter)`.

use std::time::Duration;

/// Backoff settings for one retry budget.
///
/// # Default Values
///
/// - `max_retries`: 5
/// - `base`: 1.2
/// - `scale`: 10ms
/// - `cap`: 500ms
/// - `jitter`: none
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt. Zero disables retrying.
    pub max_retries: u32,
    pub base: f64,
    pub scale: Duration,
    pub cap: Duration,
    /// Upper bound of the random extra delay, if any.
    pub jitter: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base: 1.2,
            scale: Duration::from_millis(10),
            cap: Duration::from_millis(500),
            jitter: None,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn with_backoff(mut self, base: f64, scale: Duration, cap: Duration) -> Self {
        self.base = base;
        self.scale = scale;
        self.cap = cap;
        self
    }

    #[must_use]
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// Whether another retry is allowed after `attempt` retries have been used.
    pub fn allows(&self, attempt: u32) -> bool {
        attempt <= self.max_retries
    }

    /// Deterministic part of the delay before retry `attempt`.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let nanos = self.base.powi(exponent) * self.scale.as_nanos() as f64;
        let capped = nanos.min(self.cap.as_nanos() as f64).max(0.0);
        Duration::from_nanos(capped.round() as u64)
    }

    /// Full delay before retry `attempt`, jitter included.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let backoff = self.backoff_for_attempt(attempt);
        match self.jitter {
            Some(jitter) if !jitter.is_zero() => {
                let bound = u64::try_from(jitter.as_millis()).unwrap_or(u64::MAX).max(1);
                backoff + Duration::from_millis(fastrand::u64(0..bound))
            }
            _ => backoff,
        }
    }
}
