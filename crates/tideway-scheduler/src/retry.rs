use std::time::Duration;

use serde::Deserialize;

/// Retry timing for job firings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Upper bound for a single attempt; exceeding it counts as a failure.
    pub attempt_timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
            attempt_timeout_ms: 30_000,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `retry` (1-based): base, 2×base, 4×base, ...
    /// capped at the maximum.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(32);
        let delay = self
            .base_backoff_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_backoff_ms);
        Duration::from_millis(delay)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}
