//! In-process cron loop for primary-backend jobs.
//!
//! Depends on nothing but the runner, so it keeps firing while the
//! secondary backend is down.

use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{error, info, warn};

use crate::runner::{JobRunner, RunOutcome};
use crate::types::{Cadence, JobBackend};

struct DueEntry {
    job_id: String,
    cadence: Cadence,
    next_due: Option<OffsetDateTime>,
}

pub struct PrimaryScheduler {
    runner: Arc<JobRunner>,
    entries: Vec<DueEntry>,
    check_interval: Duration,
}

impl PrimaryScheduler {
    pub fn new(runner: Arc<JobRunner>, check_interval: Duration) -> Self {
        let now = runner.clock().now();
        let entries = runner
            .catalog()
            .on_backend(JobBackend::Primary)
            .map(|job| DueEntry {
                job_id: job.id().to_string(),
                cadence: job.cadence.clone(),
                next_due: job.cadence.next_after(now),
            })
            .collect();
        Self {
            runner,
            entries,
            check_interval,
        }
    }

    /// Next planned firing per job.
    pub fn next_due(&self) -> Vec<(String, Option<OffsetDateTime>)> {
        self.entries
            .iter()
            .map(|entry| (entry.job_id.clone(), entry.next_due))
            .collect()
    }

    /// Fire every job whose next occurrence has passed, then plan the next
    /// one. Missed occurrences collapse into a single firing for the most
    /// recent of them.
    pub async fn run_due(&mut self) -> Vec<RunOutcome> {
        let now = self.runner.clock().now();
        let mut outcomes = Vec::new();

        for entry in &mut self.entries {
            let Some(due) = entry.next_due.filter(|due| *due <= now) else {
                continue;
            };
            let cycle = latest_occurrence(&entry.cadence, due, now);
            if cycle != due {
                warn!(
                    job_id = %entry.job_id,
                    missed_from = %due,
                    cycle = %cycle,
                    "primary scheduler fell behind, skipping missed cycles"
                );
            }
            match self.runner.fire(&entry.job_id, cycle).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => error!(job_id = %entry.job_id, error = %e, "primary firing failed"),
            }

            let after = self.runner.clock().now().max(cycle);
            entry.next_due = entry.cadence.next_after(after);
        }

        outcomes
    }

    /// Start the loop in a background task.
    pub fn start(mut self) -> PrimaryHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            info!(
                jobs = self.entries.len(),
                check_interval_ms = self.check_interval.as_millis() as u64,
                "Primary scheduler started"
            );
            let mut ticker = interval(self.check_interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.run_due().await;
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            info!("Primary scheduler shutting down");
                            break;
                        }
                    }
                }
            }
        });

        PrimaryHandle {
            shutdown: shutdown_tx,
            task,
        }
    }
}

/// Last occurrence of `cadence` at or before `now`, starting from `due`.
fn latest_occurrence(cadence: &Cadence, due: OffsetDateTime, now: OffsetDateTime) -> OffsetDateTime {
    let mut latest = due;
    while let Some(next) = cadence.next_after(latest) {
        if next > now {
            break;
        }
        latest = next;
    }
    latest
}

/// Stops the primary loop. Firings already in progress complete.
pub struct PrimaryHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PrimaryHandle {
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            error!(error = %e, "primary scheduler task ended abnormally");
        }
    }
}
