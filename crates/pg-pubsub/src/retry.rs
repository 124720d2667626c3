//! Exponential backoff policies.

use std::time::Duration;

/// Retry policy with exponential backoff.
///
/// The delay before retry `n` (1-based) is `min_backoff * 2^(n-1)`, capped at
/// `max_backoff`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of retries; `None` retries forever.
    pub max_retries: Option<u32>,
    /// Delay before the first retry.
    pub min_backoff: Duration,
    /// Upper bound for any delay.
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Policy that never gives up.
    pub fn unbounded(min_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_retries: None,
            min_backoff,
            max_backoff,
        }
    }

    /// Policy that allows at most `max_retries` retries.
    pub fn bounded(max_retries: u32, min_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_retries: Some(max_retries),
            min_backoff,
            max_backoff,
        }
    }

    /// Whether retry number `attempt` (1-based) is allowed.
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_retries.map_or(true, |max| attempt <= max)
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self.min_backoff.saturating_mul(1u32 << exponent);
        std::cmp::min(delay, self.max_backoff)
    }
}
