//! Job and run type definitions.

use std::fmt;
use std::time::Duration;

use croner::Cron;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Job priority tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    /// The single job that must survive any dependency outage
    Critical,
    High,
    Medium,
    Low,
}

impl JobPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobPriority::Critical => "critical",
            JobPriority::High => "high",
            JobPriority::Medium => "medium",
            JobPriority::Low => "low",
        }
    }
}

/// Which backend fires a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobBackend {
    /// In-process cron loop, no external dependency
    Primary,
    /// Third-party push scheduler calling back over HTTP
    Secondary,
}

impl JobBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobBackend::Primary => "primary",
            JobBackend::Secondary => "secondary",
        }
    }
}

/// Outcome of the most recent firing of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Failure,
    /// Redelivery of a cycle that already completed
    Skipped,
    /// Never fired since startup
    #[default]
    Unknown,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Failure => "failure",
            RunStatus::Skipped => "skipped",
            RunStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a job does when it fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobAction {
    /// Record liveness in the shared cache
    Heartbeat,
    /// Ask the notification collaborator to send the job's digest
    NotificationDigest,
    /// POST to the job's downstream target
    HttpTask,
}

fn default_retries() -> u32 {
    3
}

/// One entry of the job table, as written in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDefinition {
    pub id: String,
    /// Callback path the secondary backend pushes to, e.g. `/api/jobs/calendar-sync`
    pub endpoint: String,
    /// Five-field cron expression, UTC
    pub cron: String,
    pub priority: JobPriority,
    pub backend: JobBackend,
    #[serde(default = "default_retries")]
    pub retries: u32,
    pub action: JobAction,
    /// Downstream URL for `http_task` jobs
    #[serde(default)]
    pub target: Option<String>,
}

impl JobDefinition {
    pub fn new(
        id: &str,
        cron: &str,
        priority: JobPriority,
        backend: JobBackend,
        action: JobAction,
    ) -> Self {
        Self {
            id: id.to_string(),
            endpoint: format!("/api/jobs/{id}"),
            cron: cron.to_string(),
            priority,
            backend,
            retries: default_retries(),
            action,
            target: None,
        }
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }
}

/// A parsed cron cadence.
#[derive(Debug, Clone)]
pub struct Cadence {
    expression: String,
    cron: Cron,
}

impl Cadence {
    /// Parse a five-field cron expression.
    pub fn parse(expression: &str) -> Result<Self, String> {
        let fields = expression.split_whitespace().count();
        if fields != 5 {
            return Err(format!("expected 5 fields, found {fields}"));
        }
        let cron = Cron::new(expression).parse().map_err(|e| e.to_string())?;
        Ok(Self {
            expression: expression.to_string(),
            cron,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First occurrence strictly after `after`.
    pub fn next_after(&self, after: OffsetDateTime) -> Option<OffsetDateTime> {
        // croner works on chrono; second precision is all a cron needs.
        let from = chrono::DateTime::from_timestamp(after.unix_timestamp(), 0)?;
        let next = self.cron.find_next_occurrence(&from, false).ok()?;
        OffsetDateTime::from_unix_timestamp(next.timestamp()).ok()
    }

    /// Gap between the two occurrences following `reference`.
    ///
    /// For irregular expressions this is the local gap, not the minimum.
    pub fn period_near(&self, reference: OffsetDateTime) -> Option<Duration> {
        let first = self.next_after(reference)?;
        let second = self.next_after(first)?;
        let gap = second - first;
        u64::try_from(gap.whole_seconds()).ok().map(Duration::from_secs)
    }
}

/// A validated catalog entry.
#[derive(Debug, Clone)]
pub struct ScheduledJob {
    pub definition: JobDefinition,
    pub cadence: Cadence,
}

impl ScheduledJob {
    pub fn id(&self) -> &str {
        &self.definition.id
    }

    pub fn priority(&self) -> JobPriority {
        self.definition.priority
    }

    pub fn backend(&self) -> JobBackend {
        self.definition.backend
    }

    pub fn retries(&self) -> u32 {
        self.definition.retries
    }

    pub fn is_critical(&self) -> bool {
        self.definition.priority == JobPriority::Critical
    }
}
