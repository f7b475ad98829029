//! Retry/backoff policy for transient pipeline failures.

use std::time::Duration;

use crate::ErrorKind;

/// Exponential backoff policy.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of retries for transient I/O failures
    pub max_attempts: u32,

    /// Delay before the first retry
    pub initial_delay: Duration,

    /// Upper bound on any single delay
    pub max_delay: Duration,

    /// Multiplier applied per attempt
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 0,
            ..Default::default()
        }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }

    /// Retry budget for a failure of `kind`.
    pub fn retries_for(&self, kind: ErrorKind) -> u32 {
        kind.max_retries(self.max_attempts)
    }

    /// Whether a failure of `kind` should be retried after `retries_done` retries.
    pub fn should_retry(&self, kind: ErrorKind, retries_done: u32) -> bool {
        kind.is_transient() && retries_done < self.retries_for(kind)
    }
}
