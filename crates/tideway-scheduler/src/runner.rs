//! Runs one firing of a job through its retry state machine.
//!
//! ```text
//! Scheduled -> Firing(1) -> Succeeded
//!                        -> Failed(1) -> Retrying(2) -> Firing(2) -> ...
//!                                                    -> FailedFinal
//! ```
//!
//! A final failure is logged, counted and pushed to the event log. It never
//! affects later firings of the same job.

use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use serde::Serialize;
use tideway_cache::SharedStore;
use tideway_core::{Clock, Error, KeyBuilder, unix_millis};
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

use crate::catalog::JobCatalog;
use crate::cycle::CycleGuard;
use crate::error::{SchedulerError, SchedulerResult};
use crate::events::{EventKind, EventLog, SchedulerEvent};
use crate::handler::{HandlerError, HandlerRegistry, JobContext, JobHandler};
use crate::retry::RetryConfig;
use crate::status::{JobStatusRecord, JobStatusStore};
use crate::types::{RunStatus, ScheduledJob};

const JOB_RUNS_TOTAL: &str = "tideway_job_runs_total";
const JOB_DURATION_SECONDS: &str = "tideway_job_duration_seconds";

/// States a single firing passes through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    Scheduled,
    Firing { attempt: u32 },
    Failed { attempt: u32, error: String },
    Retrying { attempt: u32 },
    Succeeded { attempts: u32 },
    FailedFinal { attempts: u32 },
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunOutcome {
    pub job_id: String,
    pub cycle_millis: i64,
    pub status: RunStatus,
    pub attempts: u32,
    pub error: Option<String>,
    pub transitions: Vec<RunState>,
}

pub struct JobRunner {
    catalog: Arc<JobCatalog>,
    handlers: HandlerRegistry,
    cycles: CycleGuard,
    statuses: JobStatusStore,
    events: EventLog,
    retry: RetryConfig,
    clock: Arc<dyn Clock>,
}

impl JobRunner {
    /// Every catalog job must have a handler.
    pub fn new(
        catalog: Arc<JobCatalog>,
        handlers: HandlerRegistry,
        store: SharedStore,
        keys: KeyBuilder,
        retry: RetryConfig,
        clock: Arc<dyn Clock>,
    ) -> SchedulerResult<Self> {
        if let Some(job) = catalog.jobs().iter().find(|job| !handlers.contains(job.id())) {
            return Err(SchedulerError::MissingHandler(job.id().to_string()));
        }
        Ok(Self {
            catalog,
            handlers,
            cycles: CycleGuard::new(store.clone(), keys),
            statuses: JobStatusStore::new(store, keys),
            events: EventLog::default(),
            retry,
            clock,
        })
    }

    pub fn catalog(&self) -> &Arc<JobCatalog> {
        &self.catalog
    }

    pub fn statuses(&self) -> &JobStatusStore {
        &self.statuses
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Run `job_id` for `cycle` to completion.
    ///
    /// Errors only for jobs the catalog does not know; handler failures are
    /// part of the returned outcome.
    pub async fn fire(&self, job_id: &str, cycle: OffsetDateTime) -> SchedulerResult<RunOutcome> {
        let job = self
            .catalog
            .get(job_id)
            .ok_or_else(|| SchedulerError::UnknownJob(job_id.to_string()))?;
        let handler = self
            .handlers
            .get(job_id)
            .ok_or_else(|| SchedulerError::MissingHandler(job_id.to_string()))?;

        let mut transitions = vec![RunState::Scheduled];

        match self.cycles.is_complete(job_id, cycle).await {
            Ok(true) => {
                info!(job_id, cycle = unix_millis(cycle), "cycle already completed, skipping redelivery");
                transitions.push(RunState::Skipped);
                return Ok(self
                    .finish(job, cycle, RunStatus::Skipped, 0, None, transitions, None)
                    .await);
            }
            Ok(false) => {}
            Err(e) => {
                warn!(job_id, error = %e, "cannot read cycle marker, running anyway");
            }
        }

        let started = Instant::now();
        let (status, attempts, last_error) =
            self.attempt_all(job, handler, cycle, &mut transitions).await;

        if status == RunStatus::Success {
            if let Err(e) = self.cycles.mark_complete(job_id, cycle, self.clock.now()).await {
                warn!(job_id, error = %e, "failed to write cycle marker");
            }
        }

        Ok(self
            .finish(job, cycle, status, attempts, last_error, transitions, Some(started))
            .await)
    }

    async fn attempt_all(
        &self,
        job: &ScheduledJob,
        handler: Arc<dyn JobHandler>,
        cycle: OffsetDateTime,
        transitions: &mut Vec<RunState>,
    ) -> (RunStatus, u32, Option<String>) {
        let max_attempts = job.retries() + 1;
        let mut attempt = 1;

        loop {
            transitions.push(RunState::Firing { attempt });
            let ctx = JobContext {
                job_id: job.id().to_string(),
                cycle,
                attempt,
                target: job.definition.target.clone(),
            };

            let result = match tokio::time::timeout(self.retry.attempt_timeout(), handler.run(&ctx)).await {
                Ok(result) => result,
                Err(_) => Err(HandlerError::Transient(format!(
                    "attempt timed out after {}ms",
                    self.retry.attempt_timeout_ms
                ))),
            };

            let err = match result {
                Ok(()) => {
                    transitions.push(RunState::Succeeded { attempts: attempt });
                    debug!(job_id = %ctx.job_id, attempt, "job succeeded");
                    return (RunStatus::Success, attempt, None);
                }
                Err(err) => err,
            };

            transitions.push(RunState::Failed {
                attempt,
                error: err.to_string(),
            });

            if err.is_transient() && attempt < max_attempts {
                let delay = self.retry.backoff(attempt);
                warn!(
                    job_id = %ctx.job_id,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "job attempt failed, retrying"
                );
                attempt += 1;
                transitions.push(RunState::Retrying { attempt });
                tokio::time::sleep(delay).await;
                continue;
            }

            transitions.push(RunState::FailedFinal { attempts: attempt });
            let (kind, message) = if err.is_transient() {
                let exhausted = Error::RetryExhausted {
                    job_id: ctx.job_id.clone(),
                    attempts: attempt,
                    last_error: err.to_string(),
                };
                (EventKind::RetryExhausted, exhausted.to_string())
            } else {
                (EventKind::PermanentFailure, err.to_string())
            };
            error!(job_id = %ctx.job_id, attempts = attempt, error = %message, "job failed");
            self.events.push(SchedulerEvent {
                job_id: ctx.job_id.clone(),
                kind,
                at: self.clock.now(),
                attempts: attempt,
                message,
            });
            return (RunStatus::Failure, attempt, Some(err.to_string()));
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish(
        &self,
        job: &ScheduledJob,
        cycle: OffsetDateTime,
        status: RunStatus,
        attempts: u32,
        error: Option<String>,
        transitions: Vec<RunState>,
        started: Option<Instant>,
    ) -> RunOutcome {
        let job_id = job.id().to_string();
        counter!(JOB_RUNS_TOTAL, "job" => job_id.clone(), "status" => status.as_str()).increment(1);
        if let Some(started) = started {
            histogram!(JOB_DURATION_SECONDS, "job" => job_id.clone())
                .record(started.elapsed().as_secs_f64());
        }

        self.statuses
            .record(JobStatusRecord {
                job_id: job_id.clone(),
                status,
                attempts,
                cycle_millis: unix_millis(cycle),
                finished_at_millis: self.clock.now_millis(),
                error: error.clone(),
            })
            .await;

        RunOutcome {
            job_id,
            cycle_millis: unix_millis(cycle),
            status,
            attempts,
            error,
            transitions,
        }
    }
}
