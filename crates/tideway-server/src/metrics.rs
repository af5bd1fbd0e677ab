//! Prometheus metrics for the Tideway server.
//!
//! The library crates emit through the `metrics` facade:
//! - `tideway_rate_limit_decisions_total{resource,outcome}`
//! - `tideway_cache_resets_total{category,reason}`
//! - `tideway_job_runs_total{job,status}` and `tideway_job_duration_seconds{job}`
//!
//! This module installs the recorder and adds the HTTP request metrics.

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Duration;

/// Global Prometheus handle for rendering metrics.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub mod names {
    pub const HTTP_REQUESTS_TOTAL: &str = "tideway_http_requests_total";
    pub const HTTP_REQUEST_DURATION_SECONDS: &str = "tideway_http_request_duration_seconds";
    pub const DIAGNOSTICS_PROBES_TOTAL: &str = "tideway_diagnostics_probes_total";
}

/// Initialize the Prometheus metrics exporter.
///
/// Returns `true` if initialization succeeded, `false` if already initialized.
pub fn init_metrics() -> bool {
    if PROMETHEUS_HANDLE.get().is_some() {
        tracing::debug!("Prometheus metrics already initialized");
        return false;
    }

    // Pull-based: /metrics renders from the handle
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            if PROMETHEUS_HANDLE.set(handle).is_err() {
                tracing::warn!("Failed to store Prometheus handle (already set)");
                return false;
            }
            tracing::info!("Prometheus metrics initialized");
            true
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to install Prometheus recorder");
            false
        }
    }
}

/// Render all metrics in Prometheus text format.
///
/// Returns `None` if metrics were not initialized.
pub fn render_metrics() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|handle| handle.render())
}

/// Record an HTTP request against its matched route.
pub fn record_http_request(method: &str, route: &str, status: u16, duration: Duration) {
    let status_class = match status {
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        500..=599 => "5xx",
        _ => "other",
    };

    counter!(
        names::HTTP_REQUESTS_TOTAL,
        "method" => method.to_string(),
        "route" => route.to_string(),
        "status_class" => status_class
    )
    .increment(1);

    histogram!(
        names::HTTP_REQUEST_DURATION_SECONDS,
        "method" => method.to_string(),
        "route" => route.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record one probe result.
pub fn record_probe(component: &str, status: &'static str) {
    counter!(
        names::DIAGNOSTICS_PROBES_TOTAL,
        "component" => component.to_string(),
        "status" => status
    )
    .increment(1);
}
