//! # Retry Policy
//!
//! Decides what happens to a message when a consumer reports a failure:
//! another attempt after a delay, the dead-letter collection, or parking it
//! as Failed.
//!
//! The retry delay grows exponentially from `retry_delay_ms` when
//! `retry_backoff_multiplier` is above 1.0 and is capped at
//! `max_retry_delay_ms`. The default multiplier of 1.0 gives a fixed delay.

use crate::config::QueueOptions;
use std::time::Duration;

/// What to do with a message after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Move to the delayed collection and retry after `delay`
    Retry { delay: Duration },
    /// Move to the dead-letter collection
    DeadLetter,
    /// Leave in the ready collection with status Failed
    Park,
}

/// Retry policy configuration
///
/// # Examples
///
/// ```rust
/// use queue_engine_core::retry::{FailureDisposition, RetryPolicy};
/// use std::time::Duration;
///
/// let policy = RetryPolicy::new(3, Duration::from_millis(500), Duration::from_secs(5), 2.0);
///
/// assert_eq!(policy.calculate_delay(1), Duration::from_millis(500));
/// assert_eq!(policy.calculate_delay(2), Duration::from_secs(1));
/// assert_eq!(policy.disposition(3, true), FailureDisposition::DeadLetter);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Failed attempts allowed before the message leaves the retry loop
    pub max_retries: u32,

    /// Delay before the first retry
    pub base_delay: Duration,

    /// Upper bound for any retry delay
    pub max_delay: Duration,

    /// Exponential growth factor, 1.0 for a fixed delay
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_options(&QueueOptions::default())
    }
}

impl RetryPolicy {
    /// Create a new retry policy
    pub fn new(
        max_retries: u32,
        base_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            backoff_multiplier,
        }
    }

    /// Build the policy described by queue options
    pub fn from_options(options: &QueueOptions) -> Self {
        Self::new(
            options.max_retries,
            options.retry_delay(),
            options.max_retry_delay(),
            options.retry_backoff_multiplier,
        )
    }

    /// Delay before retrying a message that has failed `attempts` times
    ///
    /// `attempts` counts failures including the one just recorded, so the
    /// first retry uses `attempts == 1` and gets exactly `base_delay`.
    pub fn calculate_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1);
        if exponent == 0 || self.backoff_multiplier <= 1.0 {
            return self.base_delay.min(self.max_delay);
        }

        let base_secs = self.base_delay.as_secs_f64()
            * self
                .backoff_multiplier
                .powi(exponent.min(i32::MAX as u32) as i32);
        let capped_secs = base_secs.min(self.max_delay.as_secs_f64());

        if capped_secs.is_finite() {
            Duration::from_secs_f64(capped_secs)
        } else {
            self.max_delay
        }
    }

    /// Check if a message that has failed `attempts` times gets another try
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_retries
    }

    /// Decide the next state for a message that has failed `attempts` times
    pub fn disposition(&self, attempts: u32, dead_letter_enabled: bool) -> FailureDisposition {
        if self.should_retry(attempts) {
            FailureDisposition::Retry {
                delay: self.calculate_delay(attempts),
            }
        } else if dead_letter_enabled {
            FailureDisposition::DeadLetter
        } else {
            FailureDisposition::Park
        }
    }
}

#[cfg(test)]
#[path = "retry_tests.rs"]
mod tests;
