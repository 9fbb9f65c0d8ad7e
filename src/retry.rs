//! Exponential-backoff retry policy for the batch embedding path.
//!
//! Only rate-limit signals are retryable; every other embedding failure
//! abandons the batch immediately. The policy is a plain value so the
//! schedule can be tested without any I/O.

use std::time::Duration;

use crate::embedding::EmbedError;

/// Backoff schedule: `min(initial * multiplier^attempt, max_delay)`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts per batch, including the first.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs_f64(1.0),
            multiplier: 2.0,
            max_delay: Duration::from_secs_f64(60.0),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Delay before retrying after the given zero-based failed attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt as i32);
        let delay = self.initial_delay.as_secs_f64() * factor;
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }

    /// Whether an embedding failure is worth retrying at all.
    pub fn retryable(&self, err: &EmbedError) -> bool {
        matches!(err, EmbedError::RateLimited(_))
    }
}
