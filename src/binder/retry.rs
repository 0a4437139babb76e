//! Per-transaction retry controller for upstream forwarding failures.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::time::Duration;

const DEFAULT_MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 100;
const MAX_BACKOFF_MS: u64 = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetryReason {
    PeerClosed,
    Timeout,
    NetworkError,
    InterfaceUnavailable,
}

#[derive(Debug, Clone)]
pub struct RetryAttempt {
    pub attempt_number: u32,
    pub reason: RetryReason,
    pub backoff_delay: Duration,
    pub timestamp: DateTime<Utc>,
    pub error: Option<String>,
    pub resolver_endpoint: String,
    pub interface_name: Option<String>,
}

pub enum RetryDecision {
    Retry { delay: Duration },
    Exhausted { attempts: Vec<RetryAttempt> },
}

pub struct RetryController {
    max_retries: u32,
    initial_backoff_ms: u64,
    history: DashMap<u16, Vec<RetryAttempt>>,
}

impl Default for RetryController {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES, INITIAL_BACKOFF_MS)
    }
}

impl RetryController {
    pub fn new(max_retries: u32, initial_backoff_ms: u64) -> Self {
        Self {
            max_retries,
            initial_backoff_ms,
            history: DashMap::new(),
        }
    }

    /// Records a failure for `transaction_id` and decides whether to
    /// retry. `peer_closed` gets an immediate first retry; other reasons
    /// back off exponentially, capped at 2 seconds.
    pub fn on_failure(
        &self,
        transaction_id: u16,
        reason: RetryReason,
        resolver_endpoint: &str,
        interface_name: Option<&str>,
        error: Option<String>,
    ) -> RetryDecision {
        let mut entry = self.history.entry(transaction_id).or_default();
        let attempt_number = entry.len() as u32 + 1;

        let delay = if reason == RetryReason::PeerClosed && attempt_number == 1 {
            Duration::from_millis(0)
        } else {
            let backoff = self.initial_backoff_ms.saturating_mul(1u64 << (attempt_number.saturating_sub(1)));
            Duration::from_millis(backoff.min(MAX_BACKOFF_MS))
        };

        entry.push(RetryAttempt {
            attempt_number,
            reason,
            backoff_delay: delay,
            timestamp: Utc::now(),
            error,
            resolver_endpoint: resolver_endpoint.to_string(),
            interface_name: interface_name.map(str::to_string),
        });

        if attempt_number > self.max_retries {
            let attempts = (*entry).clone();
            drop(entry);
            self.clear(transaction_id);
            return RetryDecision::Exhausted { attempts };
        }

        RetryDecision::Retry { delay }
    }

    pub fn clear(&self, transaction_id: u16) {
        self.history.remove(&transaction_id);
    }

    pub fn history_for(&self, transaction_id: u16) -> Vec<RetryAttempt> {
        self.history.get(&transaction_id).map(|v| (*v).clone()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_closed_first_retry_is_immediate() {
        let controller = RetryController::default();
        match controller.on_failure(1, RetryReason::PeerClosed, "8.8.8.8:53", None, None) {
            RetryDecision::Retry { delay } => assert_eq!(delay, Duration::from_millis(0)),
            RetryDecision::Exhausted { .. } => panic!("should not be exhausted"),
        }
    }

    #[test]
    fn backoff_doubles_and_caps_at_two_seconds() {
        let controller = RetryController::new(10, 100);
        for expected_ms in [100, 200, 400, 800, 1600, 2000, 2000] {
            match controller.on_failure(2, RetryReason::Timeout, "8.8.8.8:53", None, None) {
                RetryDecision::Retry { delay } => assert_eq!(delay, Duration::from_millis(expected_ms)),
                RetryDecision::Exhausted { .. } => panic!("should not be exhausted yet"),
            }
        }
    }

    #[test]
    fn exhausts_after_max_retries_and_reports_full_history() {
        let controller = RetryController::new(2, 100);
        controller.on_failure(3, RetryReason::NetworkError, "8.8.8.8:53", None, None);
        controller.on_failure(3, RetryReason::NetworkError, "8.8.8.8:53", None, None);
        match controller.on_failure(3, RetryReason::NetworkError, "8.8.8.8:53", None, None) {
            RetryDecision::Exhausted { attempts } => assert_eq!(attempts.len(), 3),
            RetryDecision::Retry { .. } => panic!("should be exhausted"),
        }
        assert!(controller.history_for(3).is_empty());
    }
}
