//! Reconciles the secondary backend's schedules with the catalog.
//!
//! Registrations are additive and always applied. Deletions remove
//! somebody's timer, so they only run with `auto_approve`; otherwise they
//! are reported as pending and nothing is touched.

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use tracing::{info, warn};

use crate::catalog::JobCatalog;
use crate::error::SchedulerResult;
use crate::secondary::{PushScheduler, RemoteSchedule, SecondaryConfig};
use crate::types::JobBackend;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedRegistration {
    pub job_id: String,
    pub destination: String,
    pub cron: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletionReason {
    /// Points at one of our job endpoints that no longer exists.
    Stale,
    /// Cron differs from the catalog; a replacement is registered.
    Changed,
    /// A second schedule for the same job.
    Duplicate,
    /// Targets a primary-backend job, which must never depend on the
    /// secondary backend.
    PrimaryJob,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedDeletion {
    pub schedule_id: String,
    pub destination: String,
    pub reason: DeletionReason,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncPlan {
    pub register: Vec<PlannedRegistration>,
    pub delete: Vec<PlannedDeletion>,
    pub unchanged: Vec<String>,
}

impl SyncPlan {
    pub fn is_empty(&self) -> bool {
        self.register.is_empty() && self.delete.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// `(job_id, schedule_id)` of new registrations.
    pub registered: Vec<(String, String)>,
    pub deleted: Vec<PlannedDeletion>,
    /// Deletions held back for lack of approval.
    pub pending_deletions: Vec<PlannedDeletion>,
    pub unchanged: Vec<String>,
}

/// Compute what has to change. Remote schedules outside our callback
/// namespace belong to someone else and are ignored.
pub fn plan(catalog: &JobCatalog, remote: &[RemoteSchedule], config: &SecondaryConfig) -> SyncPlan {
    let namespace = config.destination("/api/jobs/");
    let desired: HashMap<String, (&str, &str)> = catalog
        .on_backend(JobBackend::Secondary)
        .map(|job| {
            (
                config.destination(&job.definition.endpoint),
                (job.id(), job.cadence.expression()),
            )
        })
        .collect();
    let primary: Vec<String> = catalog
        .on_backend(JobBackend::Primary)
        .map(|job| config.destination(&job.definition.endpoint))
        .collect();

    let mut plan = SyncPlan::default();
    let mut satisfied: HashSet<&str> = HashSet::new();

    for schedule in remote {
        let reason = if primary.contains(&schedule.destination) {
            Some(DeletionReason::PrimaryJob)
        } else if let Some(&(job_id, cron)) = desired.get(&schedule.destination) {
            if schedule.cron.split_whitespace().eq(cron.split_whitespace()) {
                if satisfied.insert(job_id) {
                    plan.unchanged.push(job_id.to_string());
                    None
                } else {
                    Some(DeletionReason::Duplicate)
                }
            } else {
                Some(DeletionReason::Changed)
            }
        } else if schedule.destination.starts_with(&namespace) {
            Some(DeletionReason::Stale)
        } else {
            None
        };

        if let Some(reason) = reason {
            plan.delete.push(PlannedDeletion {
                schedule_id: schedule.schedule_id.clone(),
                destination: schedule.destination.clone(),
                reason,
            });
        }
    }

    for job in catalog.on_backend(JobBackend::Secondary) {
        if !satisfied.contains(job.id()) {
            plan.register.push(PlannedRegistration {
                job_id: job.id().to_string(),
                destination: config.destination(&job.definition.endpoint),
                cron: job.cadence.expression().to_string(),
            });
        }
    }

    plan
}

/// List, plan and apply.
pub async fn sync_schedules(
    scheduler: &dyn PushScheduler,
    catalog: &JobCatalog,
    config: &SecondaryConfig,
    auto_approve: bool,
) -> SchedulerResult<SyncReport> {
    let remote = scheduler.list().await?;
    let plan = plan(catalog, &remote, config);

    let mut report = SyncReport {
        unchanged: plan.unchanged.clone(),
        ..SyncReport::default()
    };

    for registration in &plan.register {
        let schedule_id = scheduler
            .register(&registration.destination, &registration.cron)
            .await?;
        info!(
            job_id = %registration.job_id,
            schedule_id = %schedule_id,
            cron = %registration.cron,
            "registered schedule"
        );
        report
            .registered
            .push((registration.job_id.clone(), schedule_id));
    }

    if !auto_approve {
        if !plan.delete.is_empty() {
            warn!(
                pending = plan.delete.len(),
                "schedule deletions need approval; rerun with auto-approve to apply"
            );
        }
        report.pending_deletions = plan.delete;
        return Ok(report);
    }

    for deletion in plan.delete {
        scheduler.delete(&deletion.schedule_id).await?;
        info!(
            schedule_id = %deletion.schedule_id,
            reason = ?deletion.reason,
            "deleted schedule"
        );
        report.deleted.push(deletion);
    }

    Ok(report)
}
