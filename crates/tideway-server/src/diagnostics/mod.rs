//! Criticality-aware health aggregation.
//!
//! Every component registers a [`Probe`]. A report runs the selected probes
//! concurrently, each bounded by the probe timeout, and rolls the results up:
//!
//! - `unhealthy` only when a critical component is unreachable
//! - `degraded` when anything else is not healthy
//! - `healthy` otherwise

pub mod probes;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::future::join_all;
use serde::Serialize;
use thiserror::Error;
use tideway_core::Clock;
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::config::DiagnosticsConfig;
use crate::metrics::record_probe;

pub use probes::{
    CacheProbe, JobsProbe, NotificationsProbe, PrimarySchedulerProbe, PrimarySlot,
    SecondarySchedulerProbe,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Answering, but erroring or slow
    Degraded,
    /// Timed out or could not be contacted
    Unreachable,
}

impl ComponentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentStatus::Healthy => "healthy",
            ComponentStatus::Degraded => "degraded",
            ComponentStatus::Unreachable => "unreachable",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// What a probe found, before timing and criticality are attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeReport {
    pub status: ComponentStatus,
    pub detail: Option<String>,
}

impl ProbeReport {
    pub fn healthy() -> Self {
        Self {
            status: ComponentStatus::Healthy,
            detail: None,
        }
    }

    pub fn healthy_with(detail: impl Into<String>) -> Self {
        Self {
            status: ComponentStatus::Healthy,
            detail: Some(detail.into()),
        }
    }

    pub fn degraded(detail: impl Into<String>) -> Self {
        Self {
            status: ComponentStatus::Degraded,
            detail: Some(detail.into()),
        }
    }

    pub fn unreachable(detail: impl Into<String>) -> Self {
        Self {
            status: ComponentStatus::Unreachable,
            detail: Some(detail.into()),
        }
    }
}

#[async_trait]
pub trait Probe: Send + Sync {
    /// Component name as used in `?component=`.
    fn component(&self) -> &'static str;

    async fn check(&self) -> ProbeReport;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub component: String,
    pub status: ComponentStatus,
    pub latency_ms: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub critical: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiagnosticsReport {
    pub status: OverallStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub components: Vec<HealthReport>,
}

impl DiagnosticsReport {
    pub fn without_details(mut self) -> Self {
        for component in &mut self.components {
            component.detail = None;
        }
        self
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown component '{requested}' (available: {})", available.join(", "))]
pub struct UnknownComponent {
    pub requested: String,
    pub available: Vec<String>,
}

/// Roll component reports up into one status.
pub fn roll_up(reports: &[HealthReport]) -> OverallStatus {
    if reports
        .iter()
        .any(|r| r.critical && r.status == ComponentStatus::Unreachable)
    {
        OverallStatus::Unhealthy
    } else if reports.iter().any(|r| r.status != ComponentStatus::Healthy) {
        OverallStatus::Degraded
    } else {
        OverallStatus::Healthy
    }
}

pub struct DiagnosticsAggregator {
    probes: Vec<Arc<dyn Probe>>,
    critical: HashSet<String>,
    timeout: Duration,
    slow_threshold: Duration,
    clock: Arc<dyn Clock>,
}

impl DiagnosticsAggregator {
    pub fn new(config: &DiagnosticsConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            probes: Vec::new(),
            critical: config.critical.iter().cloned().collect(),
            timeout: config.probe_timeout(),
            slow_threshold: config.slow_threshold(),
            clock,
        }
    }

    /// Reports come back in registration order.
    pub fn register(&mut self, probe: Arc<dyn Probe>) {
        self.probes.push(probe);
    }

    pub fn with(mut self, probe: Arc<dyn Probe>) -> Self {
        self.register(probe);
        self
    }

    pub fn components(&self) -> Vec<&'static str> {
        self.probes.iter().map(|p| p.component()).collect()
    }

    pub fn is_critical(&self, component: &str) -> bool {
        self.critical.contains(component)
    }

    /// Probe `component`, or everything for `None` and `"all"`.
    pub async fn report(&self, component: Option<&str>) -> Result<DiagnosticsReport, UnknownComponent> {
        let selected: Vec<&Arc<dyn Probe>> = match component {
            None | Some("all") => self.probes.iter().collect(),
            Some(name) => {
                let matching: Vec<_> = self
                    .probes
                    .iter()
                    .filter(|p| p.component() == name)
                    .collect();
                if matching.is_empty() {
                    return Err(UnknownComponent {
                        requested: name.to_string(),
                        available: self.components().iter().map(|c| c.to_string()).collect(),
                    });
                }
                matching
            }
        };

        let components = join_all(selected.into_iter().map(|probe| self.run_probe(probe))).await;
        let status = roll_up(&components);
        debug!(status = ?status, components = components.len(), "diagnostics report built");
        Ok(DiagnosticsReport {
            status,
            timestamp: self.clock.now(),
            components,
        })
    }

    async fn run_probe(&self, probe: &Arc<dyn Probe>) -> HealthReport {
        let component = probe.component();
        let started = Instant::now();
        let mut outcome = match tokio::time::timeout(self.timeout, probe.check()).await {
            Ok(outcome) => outcome,
            Err(_) => ProbeReport::unreachable(format!(
                "probe timed out after {}ms",
                self.timeout.as_millis()
            )),
        };
        let latency = started.elapsed();

        if outcome.status == ComponentStatus::Healthy && latency > self.slow_threshold {
            outcome = ProbeReport::degraded(format!(
                "slow response: {}ms (threshold {}ms)",
                latency.as_millis(),
                self.slow_threshold.as_millis()
            ));
        }
        if outcome.status != ComponentStatus::Healthy {
            warn!(
                component,
                status = outcome.status.as_str(),
                detail = outcome.detail.as_deref().unwrap_or(""),
                "component not healthy"
            );
        }
        record_probe(component, outcome.status.as_str());

        HealthReport {
            component: component.to_string(),
            status: outcome.status,
            latency_ms: latency.as_millis() as u64,
            timestamp: self.clock.now(),
            critical: self.is_critical(component),
            detail: outcome.detail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tideway_core::ManualClock;

    struct Fixed(&'static str, ProbeReport);

    #[async_trait]
    impl Probe for Fixed {
        fn component(&self) -> &'static str {
            self.0
        }

        async fn check(&self) -> ProbeReport {
            self.1.clone()
        }
    }

    fn report(component: &str, status: ComponentStatus, critical: bool) -> HealthReport {
        HealthReport {
            component: component.to_string(),
            status,
            latency_ms: 1,
            timestamp: OffsetDateTime::UNIX_EPOCH,
            critical,
            detail: None,
        }
    }

    #[test]
    fn roll_up_rules() {
        use ComponentStatus::*;
        assert_eq!(roll_up(&[]), OverallStatus::Healthy);
        assert_eq!(
            roll_up(&[report("cache", Healthy, true), report("jobs", Degraded, false)]),
            OverallStatus::Degraded
        );
        assert_eq!(
            roll_up(&[report("cache", Degraded, true)]),
            OverallStatus::Degraded
        );
        assert_eq!(
            roll_up(&[report("cache", Unreachable, true), report("jobs", Healthy, false)]),
            OverallStatus::Unhealthy
        );
    }

    #[tokio::test]
    async fn single_component_selection() {
        let aggregator = DiagnosticsAggregator::new(
            &DiagnosticsConfig::default(),
            Arc::new(ManualClock::starting_at_millis(1_700_000_000_000)),
        )
        .with(Arc::new(Fixed("cache", ProbeReport::healthy())))
        .with(Arc::new(Fixed("jobs", ProbeReport::degraded("1 failed firing"))));

        let report = aggregator.report(Some("cache")).await.unwrap();
        assert_eq!(report.status, OverallStatus::Healthy);
        assert_eq!(report.components.len(), 1);

        let err = aggregator.report(Some("billing")).await.unwrap_err();
        assert_eq!(err.available, ["cache", "jobs"]);
    }

    #[test]
    fn details_can_be_stripped() {
        let mut with_detail = report("jobs", ComponentStatus::Degraded, false);
        with_detail.detail = Some("2 failed firings".into());
        let full = DiagnosticsReport {
            status: OverallStatus::Degraded,
            timestamp: OffsetDateTime::UNIX_EPOCH,
            components: vec![with_detail],
        };
        let json = serde_json::to_value(full.without_details()).unwrap();
        assert!(json["components"][0].get("detail").is_none());
        assert_eq!(json["components"][0]["status"], "degraded");
    }
}
