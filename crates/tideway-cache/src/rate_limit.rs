//! Sliding-window rate limiting over the remote store.
//!
//! A window is a JSON array of Unix-millisecond timestamps stored under one
//! key. Check-and-record is a compare-and-swap loop: read, prune, decide,
//! then swap only if nobody else wrote in between. Concurrent callers on any
//! number of instances therefore cannot overcount.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use serde_json::Value;
use tideway_core::{CacheKey, Clock, SystemClock, from_unix_millis};
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::codec;
use crate::guard::{CorruptionGuard, ExpectedShape, Validated};
use crate::store::SharedStore;

const RATE_LIMIT_DECISIONS_TOTAL: &str = "tideway_rate_limit_decisions_total";

/// Behaviour when the store cannot be consulted.
#[derive(Debug, Clone)]
pub struct LimiterSettings {
    /// Allow requests when the store is unreachable.
    pub fail_open: bool,
    /// Compare-and-swap attempts before giving up under contention.
    pub max_swap_attempts: u32,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            fail_open: true,
            max_swap_attempts: 16,
        }
    }
}

/// Result of a single check-and-record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_at: OffsetDateTime,
    /// The store was not consulted successfully; the decision comes from the
    /// fail-open/fail-closed policy.
    pub bypassed: bool,
}

#[derive(Clone)]
pub struct SlidingWindowLimiter {
    guard: CorruptionGuard,
    clock: Arc<dyn Clock>,
    settings: LimiterSettings,
}

impl SlidingWindowLimiter {
    pub fn new(store: SharedStore) -> Self {
        Self::with_clock(store, Arc::new(SystemClock), LimiterSettings::default())
    }

    pub fn with_clock(store: SharedStore, clock: Arc<dyn Clock>, settings: LimiterSettings) -> Self {
        Self {
            guard: CorruptionGuard::new(store),
            clock,
            settings,
        }
    }

    pub fn settings(&self) -> &LimiterSettings {
        &self.settings
    }

    /// Check whether one more event fits into the window and record it if so.
    ///
    /// An event exactly `window` old has expired. Denied checks still
    /// rewrite the pruned list so the key's TTL stays fresh.
    pub async fn check_and_record(
        &self,
        key: &CacheKey,
        window: Duration,
        max_events: u32,
    ) -> RateLimitDecision {
        let store = self.guard.store();
        let window_ms = window.as_millis() as i64;

        for attempt in 1..=self.settings.max_swap_attempts {
            let now_ms = self.clock.now_millis();

            let read = match self.guard.load(key.as_str(), ExpectedShape::TimestampSequence).await {
                Ok(read) => read,
                Err(err) => return self.bypass(key, window, max_events, &err),
            };
            let mut timestamps = match &read.value {
                Validated::Valid(value) => timestamps_from(value),
                Validated::Missing | Validated::Reset => Vec::new(),
            };

            timestamps.retain(|ts| now_ms - ts < window_ms);
            timestamps.sort_unstable();

            let allowed = (timestamps.len() as u64) < max_events as u64;
            if allowed {
                timestamps.push(now_ms);
            }

            let encoded = match codec::encode(&timestamps) {
                Ok(encoded) => encoded,
                Err(err) => return self.bypass(key, window, max_events, &err),
            };

            match store
                .compare_and_swap(key.as_str(), read.text.as_deref(), &encoded, window)
                .await
            {
                Ok(true) => {
                    let oldest = timestamps.first().copied().unwrap_or(now_ms);
                    let decision = RateLimitDecision {
                        allowed,
                        remaining: if allowed {
                            max_events.saturating_sub(timestamps.len() as u32)
                        } else {
                            0
                        },
                        reset_at: from_unix_millis(oldest + window_ms),
                        bypassed: false,
                    };
                    record_decision(key, &decision);
                    return decision;
                }
                Ok(false) => {
                    debug!(key = %key, attempt, "rate limit window changed concurrently, retrying");
                }
                Err(err) => return self.bypass(key, window, max_events, &err),
            }
        }

        warn!(
            key = %key,
            attempts = self.settings.max_swap_attempts,
            "rate limit contention exhausted swap attempts, denying"
        );
        let decision = RateLimitDecision {
            allowed: false,
            remaining: 0,
            reset_at: self.clock.now() + window,
            bypassed: false,
        };
        record_decision(key, &decision);
        decision
    }

    fn bypass(
        &self,
        key: &CacheKey,
        window: Duration,
        max_events: u32,
        err: &tideway_core::Error,
    ) -> RateLimitDecision {
        let allowed = self.settings.fail_open;
        warn!(
            key = %key,
            error = %err,
            fail_open = allowed,
            "rate limiter store unavailable"
        );
        let decision = RateLimitDecision {
            allowed,
            remaining: if allowed { max_events } else { 0 },
            reset_at: self.clock.now() + window,
            bypassed: true,
        };
        record_decision(key, &decision);
        decision
    }
}

fn timestamps_from(value: &Value) -> Vec<i64> {
    value
        .as_array()
        .map(|items| items.iter().filter_map(Value::as_i64).collect())
        .unwrap_or_default()
}

fn record_decision(key: &CacheKey, decision: &RateLimitDecision) {
    let outcome = match (decision.allowed, decision.bypassed) {
        (true, false) => "allowed",
        (false, false) => "denied",
        (true, true) => "fail_open",
        (false, true) => "fail_closed",
    };
    counter!(
        RATE_LIMIT_DECISIONS_TOTAL,
        "resource" => key.resource().to_string(),
        "outcome" => outcome
    )
    .increment(1);
}
