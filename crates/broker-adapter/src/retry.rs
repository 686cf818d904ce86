//! Retry accounting and linear backoff.

use broker_driver::{headers, Message};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// What to do with a message whose handler just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Republish as retry number `attempt` after waiting `delay`.
    Retry { attempt: u32, delay: Duration },
    /// The retry budget is spent.
    Exhausted,
}

/// Retry ceiling and backoff unit for one topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    backoff_unit: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff_unit: Duration) -> Self {
        Self {
            max_retries,
            backoff_unit,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn backoff_unit(&self) -> Duration {
        self.backoff_unit
    }

    /// Decide for a message that has already been retried `retry_count` times.
    pub fn decide(&self, retry_count: u32) -> RetryDecision {
        if retry_count < self.max_retries {
            let attempt = retry_count + 1;
            RetryDecision::Retry {
                attempt,
                delay: self.backoff_for(attempt),
            }
        } else {
            RetryDecision::Exhausted
        }
    }

    /// Wait before retry number `attempt`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        self.backoff_unit.saturating_mul(attempt)
    }
}

/// Stamp a failed message for redelivery as retry number `attempt`.
pub fn prepare_retry(message: &mut Message, attempt: u32, last_error: &str) {
    message.set_retry_count(attempt);
    message.set_header(headers::LAST_ERROR, last_error);
}

/// Sleep for `delay` unless `cancel` fires first.
///
/// Returns `true` when the full delay elapsed and `false` on cancellation.
pub async fn backoff(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
