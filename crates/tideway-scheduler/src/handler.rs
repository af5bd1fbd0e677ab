//! Job handler seam.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use time::OffsetDateTime;
use tideway_core::unix_millis;

/// What a handler gets to know about one firing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobContext {
    pub job_id: String,
    /// Nominal time of the cycle being run. Redeliveries share it.
    pub cycle: OffsetDateTime,
    /// 1-based attempt number within this firing.
    pub attempt: u32,
    pub target: Option<String>,
}

impl JobContext {
    pub fn cycle_millis(&self) -> i64 {
        unix_millis(self.cycle)
    }

    /// Key downstream collaborators use to drop duplicate deliveries.
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}", self.job_id, self.cycle_millis())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// Worth retrying: timeouts, 5xx, connection failures.
    #[error("{0}")]
    Transient(String),

    /// Retrying cannot help: bad configuration, rejected request.
    #[error("{0}")]
    Permanent(String),
}

impl HandlerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, HandlerError::Transient(_))
    }
}

/// The work behind a job.
///
/// Delivery is at-least-once, so implementations must be idempotent for a
/// given [`JobContext::cycle`].
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, ctx: &JobContext) -> Result<(), HandlerError>;
}

/// Handlers by job id.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, job_id: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(job_id.into(), handler);
    }

    pub fn with(mut self, job_id: impl Into<String>, handler: Arc<dyn JobHandler>) -> Self {
        self.register(job_id, handler);
        self
    }

    pub fn get(&self, job_id: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_id).cloned()
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.handlers.contains_key(job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn idempotency_key_names_job_and_cycle() {
        let ctx = JobContext {
            job_id: "calendar-sync".into(),
            cycle: datetime!(2025-08-10 10:30:00 UTC),
            attempt: 2,
            target: None,
        };
        assert_eq!(ctx.idempotency_key(), "calendar-sync:1754821800000");
    }
}
