use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tideway_core::unix_millis;
use tideway_scheduler::JobBackend;
use tideway_scheduler::secondary::{
    SCHEDULED_AT_HEADER, SIGNATURE_HEADER, callback_cycle, verify_callback,
};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::diagnostics::OverallStatus;
use crate::metrics::render_metrics;
use crate::server::AppState;

#[derive(Serialize)]
pub struct HealthResponse<'a> {
    status: &'a str,
}

pub async fn root() -> impl IntoResponse {
    let body = json!({
        "service": "Tideway",
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    });
    (StatusCode::OK, Json(body))
}

/// Liveness only; dependencies are covered by `/api/diagnostics`.
pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { status: "ok" }))
}

pub async fn metrics() -> Response {
    match render_metrics() {
        Some(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        None => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "metrics_unavailable",
            "metrics recorder is not installed".to_string(),
        ),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct DiagnosticsQuery {
    /// Component name or `all`
    #[serde(default)]
    pub component: Option<String>,
    #[serde(default)]
    pub details: bool,
}

pub async fn diagnostics(State(state): State<AppState>, Query(query): Query<DiagnosticsQuery>) -> Response {
    match state.diagnostics.report(query.component.as_deref()).await {
        Ok(report) => {
            let status = match report.status {
                OverallStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
                OverallStatus::Healthy | OverallStatus::Degraded => StatusCode::OK,
            };
            let report = if query.details {
                report
            } else {
                report.without_details()
            };
            (status, Json(report)).into_response()
        }
        Err(e) => error_response(StatusCode::BAD_REQUEST, "unknown_component", e.to_string()),
    }
}

/// Booking intake. The booking workflow itself runs elsewhere; this only
/// acknowledges requests that made it past the rate limit.
pub async fn create_booking(Json(payload): Json<Value>) -> Response {
    if !payload.is_object() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "invalid_booking",
            "booking request must be a JSON object".to_string(),
        );
    }
    let request_id = Uuid::new_v4().to_string();
    info!(booking_request = %request_id, "booking request accepted");
    (
        StatusCode::ACCEPTED,
        Json(json!({ "status": "accepted", "request_id": request_id })),
    )
        .into_response()
}

/// Push callback from the secondary scheduler.
///
/// The firing runs in the background; the callback is acknowledged once the
/// signature checks out so the scheduler does not redeliver a slow job.
pub async fn job_callback(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(secondary) = state.services.config.scheduler.secondary.as_ref() else {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "push_scheduling_disabled",
            "push scheduling is not configured".to_string(),
        );
    };

    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
    if !signature.is_some_and(|s| verify_callback(&body, s, &secondary.signing_key)) {
        warn!(job_id = %job_id, "rejecting job callback with missing or invalid signature");
        return error_response(
            StatusCode::UNAUTHORIZED,
            "invalid_signature",
            "callback signature missing or invalid".to_string(),
        );
    }

    let Some(job) = state.services.catalog.get(&job_id) else {
        return error_response(
            StatusCode::NOT_FOUND,
            "unknown_job",
            format!("no job named '{job_id}'"),
        );
    };
    if job.backend() != JobBackend::Secondary {
        return error_response(
            StatusCode::CONFLICT,
            "primary_job",
            format!("job '{job_id}' runs on the primary scheduler"),
        );
    }

    let scheduled_at = headers.get(SCHEDULED_AT_HEADER).and_then(|v| v.to_str().ok());
    let cycle = callback_cycle(scheduled_at, state.services.clock.now());
    let runner = state.services.runner.clone();
    let fired = job_id.clone();
    tokio::spawn(async move {
        if let Err(e) = runner.fire(&fired, cycle).await {
            error!(job_id = %fired, error = %e, "job callback firing failed");
        }
    });

    (
        StatusCode::ACCEPTED,
        Json(json!({
            "status": "accepted",
            "job_id": job_id,
            "cycle_millis": unix_millis(cycle),
        })),
    )
        .into_response()
}

fn error_response(status: StatusCode, code: &str, message: String) -> Response {
    (status, Json(json!({ "error": code, "message": message }))).into_response()
}
