//! Multi-scope rate limit policies.
//!
//! A request is checked against each configured scope in order (per user,
//! per IP, global, daily, ...). Every scope is its own key and window. The
//! first denial stops the sequence, so later scopes are neither checked nor
//! recorded, and no scope is ever recorded twice for one request.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tideway_core::{Error, KeyBuilder, Result};
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::rate_limit::{RateLimitDecision, SlidingWindowLimiter};

/// What a scope is keyed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeSubject {
    User,
    Ip,
    Global,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitScope {
    /// Scope name, also the key resource suffix. `[a-z0-9_.-]` only.
    pub name: String,
    pub subject: ScopeSubject,
    pub window_secs: u64,
    pub max_events: u32,
}

impl RateLimitScope {
    pub fn new(name: &str, subject: ScopeSubject, window: Duration, max_events: u32) -> Self {
        Self {
            name: name.to_string(),
            subject,
            window_secs: window.as_secs(),
            max_events,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    fn resource(&self) -> String {
        format!("rate.{}", self.name)
    }
}

/// Who is making the request, as far as rate limiting cares.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestIdentity {
    pub user_id: Option<String>,
    pub ip: Option<String>,
}

impl RequestIdentity {
    fn subject_id(&self, subject: ScopeSubject) -> Option<&str> {
        let id = match subject {
            ScopeSubject::User => self.user_id.as_deref(),
            ScopeSubject::Ip => self.ip.as_deref(),
            ScopeSubject::Global => Some("all"),
        };
        id.filter(|id| !id.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeOutcome {
    pub scope: String,
    pub decision: RateLimitDecision,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyDecision {
    pub allowed: bool,
    /// Smallest remaining budget among the scopes that were checked.
    pub remaining: Option<u32>,
    /// Scope that rejected the request.
    pub denied_scope: Option<String>,
    /// When the rejecting scope frees up again.
    pub retry_at: Option<OffsetDateTime>,
    pub checked: Vec<ScopeOutcome>,
}

#[derive(Clone)]
pub struct RateLimitPolicy {
    limiter: SlidingWindowLimiter,
    keys: KeyBuilder,
    scopes: Vec<RateLimitScope>,
}

impl RateLimitPolicy {
    pub fn new(limiter: SlidingWindowLimiter, keys: KeyBuilder, scopes: Vec<RateLimitScope>) -> Result<Self> {
        for scope in &scopes {
            keys.build(&scope.resource(), "probe")?;
            if scope.window_secs == 0 {
                return Err(Error::invalid_key(format!(
                    "scope '{}' must have a non-zero window",
                    scope.name
                )));
            }
        }
        Ok(Self {
            limiter,
            keys,
            scopes,
        })
    }

    pub fn scopes(&self) -> &[RateLimitScope] {
        &self.scopes
    }

    pub async fn check(&self, identity: &RequestIdentity) -> PolicyDecision {
        let mut checked = Vec::with_capacity(self.scopes.len());

        for scope in &self.scopes {
            let Some(subject_id) = identity.subject_id(scope.subject) else {
                debug!(scope = %scope.name, "skipping scope without subject");
                continue;
            };
            let key = match self.keys.build(&scope.resource(), subject_id) {
                Ok(key) => key,
                Err(err) => {
                    warn!(scope = %scope.name, error = %err, "skipping scope with unusable key");
                    continue;
                }
            };

            let decision = self
                .limiter
                .check_and_record(&key, scope.window(), scope.max_events)
                .await;
            let allowed = decision.allowed;
            let retry_at = decision.reset_at;
            checked.push(ScopeOutcome {
                scope: scope.name.clone(),
                decision,
            });

            if !allowed {
                return PolicyDecision {
                    allowed: false,
                    remaining: Some(0),
                    denied_scope: Some(scope.name.clone()),
                    retry_at: Some(retry_at),
                    checked,
                };
            }
        }

        PolicyDecision {
            allowed: true,
            remaining: checked.iter().map(|o| o.decision.remaining).min(),
            denied_scope: None,
            retry_at: None,
            checked,
        }
    }
}

/// The scopes a booking form is protected with out of the box.
pub fn default_booking_scopes() -> Vec<RateLimitScope> {
    vec![
        RateLimitScope::new("booking-user", ScopeSubject::User, Duration::from_secs(60), 5),
        RateLimitScope::new("booking-ip", ScopeSubject::Ip, Duration::from_secs(60), 20),
        RateLimitScope::new("booking-global", ScopeSubject::Global, Duration::from_secs(60), 500),
        RateLimitScope::new("booking-daily", ScopeSubject::User, Duration::from_secs(86_400), 20),
    ]
}
