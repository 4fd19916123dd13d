//! Backoff policy for reattaching devices

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::duration_millis;

/// How often and how patiently a lost device is reattached
///
/// Attempts are counted from 1; the delay before attempt `n` grows by
/// `backoff_coefficient` per retry, is capped at `max_interval` and is
/// spread by `jitter` so several devices lost at once do not reconnect in
/// lockstep.
///
/// # Example
///
/// ```
/// use devpool::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential()
///     .with_max_attempts(4)
///     .with_initial_interval(Duration::from_secs(2));
///
/// assert!(policy.has_attempts_remaining(3));
/// assert!(!policy.has_attempts_remaining(4));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included
    pub max_attempts: u32,

    #[serde(with = "duration_millis")]
    pub initial_interval: Duration,

    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    pub backoff_coefficient: f64,

    /// Fraction of the delay randomized in both directions (0.0-1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    /// A single attempt: a failed reattach is reported immediately
    fn default() -> Self {
        Self::no_retry()
    }
}

impl RetryPolicy {
    /// 5 attempts, 1s doubling up to 30s, 10% jitter
    pub fn exponential() -> Self {
        Self {
            max_attempts: 5,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(30),
            backoff_coefficient: 2.0,
            jitter: 0.1,
        }
    }

    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            backoff_coefficient: 1.0,
            jitter: 0.0,
        }
    }

    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_interval: interval,
            max_interval: interval,
            backoff_coefficient: 1.0,
            jitter: 0.0,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay to sleep before attempt `attempt` (1-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let Some(retries) = attempt.checked_sub(2) else {
            return Duration::ZERO;
        };

        let base = self.initial_interval.as_secs_f64()
            * self.backoff_coefficient.powi(retries.min(i32::MAX as u32) as i32);
        let capped = base.min(self.max_interval.as_secs_f64());

        if self.jitter <= 0.0 || capped <= 0.0 {
            return Duration::from_secs_f64(capped);
        }

        let spread = capped * self.jitter;
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_secs_f64((capped + offset).max(0.0))
    }

    /// Whether another attempt may follow attempt `attempt`
    pub fn has_attempts_remaining(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}
