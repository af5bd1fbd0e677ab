//! Built-in component probes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tideway_cache::SharedStore;
use tideway_core::Clock;
use tideway_notifications::{NotificationError, Notifier};
use tideway_scheduler::{Cadence, HeartbeatReader, JobRunner, PrimaryHandle, PushScheduler};
use time::OffsetDateTime;

use super::{Probe, ProbeReport};

/// Where the running primary loop is parked; empty until the server starts it.
pub type PrimarySlot = Arc<Mutex<Option<PrimaryHandle>>>;

/// Pings the shared store.
pub struct CacheProbe {
    store: SharedStore,
}

impl CacheProbe {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Probe for CacheProbe {
    fn component(&self) -> &'static str {
        "cache"
    }

    async fn check(&self) -> ProbeReport {
        match self.store.ping().await {
            Ok(()) => ProbeReport::healthy_with(format!("{} store reachable", self.store.name())),
            Err(e) if e.is_unreachable() => ProbeReport::unreachable(e.to_string()),
            Err(e) => ProbeReport::degraded(e.to_string()),
        }
    }
}

/// Heartbeat freshness of the in-process scheduler.
///
/// The heartbeat must be no older than twice its cadence. Before the first
/// heartbeat lands the same allowance counts from process start.
pub struct PrimarySchedulerProbe {
    reader: HeartbeatReader,
    cadence: Cadence,
    clock: Arc<dyn Clock>,
    started_at: OffsetDateTime,
    slot: PrimarySlot,
}

/// Used when a cadence has no following occurrence to measure against.
const FALLBACK_PERIOD: Duration = Duration::from_secs(60);

impl PrimarySchedulerProbe {
    pub fn new(reader: HeartbeatReader, cadence: Cadence, clock: Arc<dyn Clock>, slot: PrimarySlot) -> Self {
        let started_at = clock.now();
        Self {
            reader,
            cadence,
            clock,
            started_at,
            slot,
        }
    }

    fn allowance(&self, reference: OffsetDateTime) -> Duration {
        self.cadence.period_near(reference).unwrap_or(FALLBACK_PERIOD) * 2
    }
}

#[async_trait]
impl Probe for PrimarySchedulerProbe {
    fn component(&self) -> &'static str {
        "primary-scheduler"
    }

    async fn check(&self) -> ProbeReport {
        let loop_running = self.slot.lock().as_ref().map(|handle| handle.is_running());
        if loop_running == Some(false) {
            return ProbeReport::unreachable("primary scheduler loop has stopped");
        }

        let now = self.clock.now();
        match self.reader.last().await {
            Ok(Some(last)) => {
                let age = now - last;
                let allowance = self.allowance(last);
                if age <= allowance {
                    ProbeReport::healthy_with(format!(
                        "last heartbeat {}s ago",
                        age.whole_seconds().max(0)
                    ))
                } else {
                    ProbeReport::unreachable(format!(
                        "heartbeat stale: last {}s ago, allowed {}s",
                        age.whole_seconds(),
                        allowance.as_secs()
                    ))
                }
            }
            Ok(None) => {
                let allowance = self.allowance(self.started_at);
                if now - self.started_at <= allowance {
                    ProbeReport::healthy_with("awaiting first heartbeat")
                } else {
                    ProbeReport::unreachable(format!(
                        "no heartbeat recorded within {}s of startup",
                        allowance.as_secs()
                    ))
                }
            }
            Err(e) => ProbeReport::degraded(format!("heartbeat unreadable: {e}")),
        }
    }
}

/// Lists schedules on the push scheduler.
pub struct SecondarySchedulerProbe {
    scheduler: Option<Arc<dyn PushScheduler>>,
}

impl SecondarySchedulerProbe {
    pub fn new(scheduler: Option<Arc<dyn PushScheduler>>) -> Self {
        Self { scheduler }
    }
}

#[async_trait]
impl Probe for SecondarySchedulerProbe {
    fn component(&self) -> &'static str {
        "secondary-scheduler"
    }

    async fn check(&self) -> ProbeReport {
        let Some(scheduler) = &self.scheduler else {
            return ProbeReport::degraded("not configured");
        };
        match scheduler.list().await {
            Ok(schedules) => ProbeReport::healthy_with(format!(
                "{} schedules registered on {}",
                schedules.len(),
                scheduler.name()
            )),
            Err(e) if e.is_unreachable() => ProbeReport::unreachable(e.to_string()),
            Err(e) => ProbeReport::degraded(e.to_string()),
        }
    }
}

/// Degraded while recent firings used up their retries.
pub struct JobsProbe {
    runner: Arc<JobRunner>,
    window: Duration,
}

impl JobsProbe {
    pub fn new(runner: Arc<JobRunner>, window: Duration) -> Self {
        Self { runner, window }
    }
}

#[async_trait]
impl Probe for JobsProbe {
    fn component(&self) -> &'static str {
        "jobs"
    }

    async fn check(&self) -> ProbeReport {
        let now = self.runner.clock().now();
        let failures = self.runner.events().recent(now, self.window);
        if failures.is_empty() {
            let ran = self.runner.statuses().local_snapshot().len();
            return ProbeReport::healthy_with(format!(
                "{} of {} jobs have run on this instance",
                ran,
                self.runner.catalog().jobs().len()
            ));
        }

        let mut jobs: Vec<&str> = failures.iter().map(|e| e.job_id.as_str()).collect();
        jobs.sort_unstable();
        jobs.dedup();
        ProbeReport::degraded(format!(
            "{} failed firings in the last {}s: {}",
            failures.len(),
            self.window.as_secs(),
            jobs.join(", ")
        ))
    }
}

/// Asks the notification collaborator for its health.
pub struct NotificationsProbe {
    notifier: Arc<dyn Notifier>,
}

impl NotificationsProbe {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier }
    }
}

#[async_trait]
impl Probe for NotificationsProbe {
    fn component(&self) -> &'static str {
        "notifications"
    }

    async fn check(&self) -> ProbeReport {
        match self.notifier.health().await {
            Ok(()) => ProbeReport::healthy_with(format!("{} notifier", self.notifier.name())),
            Err(e @ NotificationError::Unreachable(_)) => ProbeReport::unreachable(e.to_string()),
            Err(e) => ProbeReport::degraded(e.to_string()),
        }
    }
}
