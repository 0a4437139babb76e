//! Exponential-backoff-with-jitter retry policy shared by every fetch
//! attempt.

use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retry_count: u32,
    pub retry_delay_seconds: f64,
    pub exponential_backoff: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_count: 3,
            retry_delay_seconds: 1.0,
            exponential_backoff: true,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `n` (1-indexed): `base * 2^(n-1)` plus jitter
    /// in `[0, 0.3 * delay]`, or a flat `base` when backoff is disabled.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = if self.exponential_backoff {
            self.retry_delay_seconds * 2f64.powi(attempt as i32 - 1)
        } else {
            self.retry_delay_seconds
        };
        let jitter = rand::rng().random_range(0.0..=(0.3 * base));
        Duration::from_secs_f64(base + jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_exponentially() {
        let policy = RetryPolicy {
            retry_count: 5,
            retry_delay_seconds: 1.0,
            exponential_backoff: true,
        };
        let first = policy.delay_for_attempt(1);
        let third = policy.delay_for_attempt(3);
        assert!(first.as_secs_f64() >= 1.0 && first.as_secs_f64() <= 1.3);
        assert!(third.as_secs_f64() >= 4.0 && third.as_secs_f64() <= 5.2);
    }

    #[test]
    fn flat_delay_without_backoff() {
        let policy = RetryPolicy {
            retry_count: 3,
            retry_delay_seconds: 2.0,
            exponential_backoff: false,
        };
        let delay = policy.delay_for_attempt(4);
        assert!(delay.as_secs_f64() >= 2.0 && delay.as_secs_f64() <= 2.6);
    }
}
