//! The static job table and its startup validation.

use std::collections::HashSet;

use crate::error::{SchedulerError, SchedulerResult};
use crate::types::{Cadence, JobAction, JobBackend, JobDefinition, JobPriority, ScheduledJob};

pub const MAX_RETRIES: u32 = 10;
pub const HEARTBEAT_JOB: &str = "heartbeat";

/// The jobs shipped with the service.
pub fn builtin_definitions() -> Vec<JobDefinition> {
    vec![
        JobDefinition::new(
            HEARTBEAT_JOB,
            "*/5 * * * *",
            JobPriority::Critical,
            JobBackend::Primary,
            JobAction::Heartbeat,
        ),
        JobDefinition::new(
            "appointment-reminders",
            "0 * * * *",
            JobPriority::High,
            JobBackend::Secondary,
            JobAction::NotificationDigest,
        ),
        JobDefinition::new(
            "payment-transfers",
            "0 2 * * *",
            JobPriority::High,
            JobBackend::Secondary,
            JobAction::HttpTask,
        ),
        JobDefinition::new(
            "calendar-sync",
            "*/30 * * * *",
            JobPriority::Medium,
            JobBackend::Secondary,
            JobAction::HttpTask,
        ),
        JobDefinition::new(
            "stale-hold-cleanup",
            "30 3 * * *",
            JobPriority::Low,
            JobBackend::Secondary,
            JobAction::HttpTask,
        ),
    ]
}

/// Validated, immutable job table.
#[derive(Debug, Clone)]
pub struct JobCatalog {
    jobs: Vec<ScheduledJob>,
    critical: usize,
}

impl JobCatalog {
    /// Validate `definitions` and build the catalog.
    ///
    /// Requires unique non-empty ids, parseable cadences, exactly one
    /// critical job, critical jobs (and only they) on the primary backend,
    /// and at most [`MAX_RETRIES`] retries per job.
    pub fn new(definitions: Vec<JobDefinition>) -> SchedulerResult<Self> {
        let mut seen = HashSet::new();
        let mut jobs = Vec::with_capacity(definitions.len());

        for definition in definitions {
            let id = definition.id.as_str();
            if id.trim().is_empty() {
                return Err(SchedulerError::InvalidCatalog("job id must not be empty".into()));
            }
            if id.trim() != id {
                return Err(SchedulerError::InvalidCatalog(format!(
                    "job id '{id}' has surrounding whitespace"
                )));
            }
            if !seen.insert(id.to_string()) {
                return Err(SchedulerError::InvalidCatalog(format!("duplicate job id '{id}'")));
            }
            if !definition.endpoint.starts_with('/') {
                return Err(SchedulerError::InvalidCatalog(format!(
                    "job '{id}' endpoint must be an absolute path"
                )));
            }
            if definition.retries > MAX_RETRIES {
                return Err(SchedulerError::InvalidCatalog(format!(
                    "job '{id}' retries {} exceeds maximum {MAX_RETRIES}",
                    definition.retries
                )));
            }
            let critical = definition.priority == JobPriority::Critical;
            let primary = definition.backend == JobBackend::Primary;
            if critical != primary {
                return Err(SchedulerError::InvalidCatalog(format!(
                    "job '{id}' is {} on the {} backend; only the critical job runs on primary",
                    definition.priority.as_str(),
                    definition.backend.as_str()
                )));
            }
            let cadence =
                Cadence::parse(&definition.cron).map_err(|reason| SchedulerError::InvalidCron {
                    job_id: id.to_string(),
                    expression: definition.cron.clone(),
                    reason,
                })?;
            jobs.push(ScheduledJob {
                definition,
                cadence,
            });
        }

        let critical: Vec<usize> = jobs
            .iter()
            .enumerate()
            .filter(|(_, job)| job.is_critical())
            .map(|(index, _)| index)
            .collect();
        if critical.len() != 1 {
            return Err(SchedulerError::InvalidCatalog(format!(
                "exactly one critical job is required, found {}",
                critical.len()
            )));
        }
        let critical = critical[0];

        Ok(Self { jobs, critical })
    }

    pub fn builtin() -> SchedulerResult<Self> {
        Self::new(builtin_definitions())
    }

    pub fn jobs(&self) -> &[ScheduledJob] {
        &self.jobs
    }

    pub fn get(&self, id: &str) -> Option<&ScheduledJob> {
        self.jobs.iter().find(|job| job.id() == id)
    }

    pub fn critical(&self) -> &ScheduledJob {
        &self.jobs[self.critical]
    }

    pub fn on_backend(&self, backend: JobBackend) -> impl Iterator<Item = &ScheduledJob> {
        self.jobs.iter().filter(move |job| job.backend() == backend)
    }
}
