use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::json;
use tracing::debug;

use crate::handler::{HandlerError, JobContext, JobHandler};

pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Delegates a job to a downstream HTTP collaborator.
///
/// The target comes from the job definition, or `{base_url}/tasks/{job}`
/// when only a base URL is configured.
pub struct HttpTaskHandler {
    client: Client,
    base_url: Option<String>,
}

impl HttpTaskHandler {
    pub fn new(base_url: Option<String>, timeout: Duration) -> Result<Self, HandlerError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HandlerError::Permanent(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.map(|url| url.trim_end_matches('/').to_string()),
        })
    }

    fn target(&self, ctx: &JobContext) -> Option<String> {
        ctx.target.clone().or_else(|| {
            self.base_url
                .as_ref()
                .map(|base| format!("{base}/tasks/{}", ctx.job_id))
        })
    }
}

#[async_trait]
impl JobHandler for HttpTaskHandler {
    async fn run(&self, ctx: &JobContext) -> Result<(), HandlerError> {
        let Some(target) = self.target(ctx) else {
            return Err(HandlerError::Permanent(format!(
                "job '{}' has no target and no task base url is configured",
                ctx.job_id
            )));
        };

        let response = self
            .client
            .post(&target)
            .header(IDEMPOTENCY_HEADER, ctx.idempotency_key())
            .json(&json!({
                "job": ctx.job_id,
                "cycle": ctx.cycle_millis(),
                "attempt": ctx.attempt,
            }))
            .send()
            .await
            .map_err(|e| HandlerError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            debug!(job_id = %ctx.job_id, target = %target, status = %status, "task accepted");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        let message = format!("{target} returned {status}: {body}");
        if status.is_server_error()
            || status == StatusCode::TOO_MANY_REQUESTS
            || status == StatusCode::REQUEST_TIMEOUT
        {
            Err(HandlerError::Transient(message))
        } else {
            Err(HandlerError::Permanent(message))
        }
    }
}
