//! Client side of the third-party push scheduler.
//!
//! The secondary backend owns the cron timers for business jobs and calls
//! back into `POST /api/jobs/{id}` when one fires. Callbacks are signed with
//! an HMAC over the raw body.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use time::OffsetDateTime;
use tideway_core::from_unix_millis;
use tracing::debug;

use crate::error::{SchedulerError, SchedulerResult};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Tideway-Signature";
/// Optional callback header carrying the nominal fire time in Unix millis.
pub const SCHEDULED_AT_HEADER: &str = "X-Tideway-Scheduled-At";

#[derive(Debug, Clone, Deserialize)]
pub struct SecondaryConfig {
    pub base_url: String,
    pub token: String,
    /// Public base URL of this service, prefixed to job endpoints.
    pub callback_base_url: String,
    /// HMAC key the scheduler signs callbacks with.
    pub signing_key: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    5_000
}

impl SecondaryConfig {
    pub fn validate(&self) -> Result<(), String> {
        for (name, value) in [
            ("base_url", &self.base_url),
            ("token", &self.token),
            ("callback_base_url", &self.callback_base_url),
            ("signing_key", &self.signing_key),
        ] {
            if value.trim().is_empty() {
                return Err(format!("scheduler.secondary.{name} must not be empty"));
            }
        }
        Ok(())
    }

    /// Full callback URL for a job endpoint path.
    pub fn destination(&self, endpoint: &str) -> String {
        format!("{}{}", self.callback_base_url.trim_end_matches('/'), endpoint)
    }
}

/// A schedule as the secondary backend reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSchedule {
    pub schedule_id: String,
    pub destination: String,
    pub cron: String,
}

#[async_trait]
pub trait PushScheduler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Register `destination` to be called on `cron`. Returns the schedule id.
    async fn register(&self, destination: &str, cron: &str) -> SchedulerResult<String>;

    async fn list(&self) -> SchedulerResult<Vec<RemoteSchedule>>;

    /// Delete a schedule. Deleting one that is already gone succeeds.
    async fn delete(&self, schedule_id: &str) -> SchedulerResult<()>;
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterResponse {
    schedule_id: String,
}

/// REST client with bearer authentication.
pub struct HttpPushScheduler {
    client: Client,
    base_url: String,
    token: String,
}

impl HttpPushScheduler {
    pub fn new(config: &SecondaryConfig) -> SchedulerResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| SchedulerError::Secondary(e.to_string()))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/schedules{}", self.base_url, path)
    }
}

fn transport_error(err: reqwest::Error) -> SchedulerError {
    if err.is_connect() || err.is_timeout() {
        SchedulerError::SecondaryUnreachable(err.to_string())
    } else {
        SchedulerError::Secondary(err.to_string())
    }
}

async fn status_error(op: &str, response: reqwest::Response) -> SchedulerError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let message = format!("{op} returned {status}: {body}");
    if status.is_server_error() {
        SchedulerError::SecondaryUnreachable(message)
    } else {
        SchedulerError::Secondary(message)
    }
}

#[async_trait]
impl PushScheduler for HttpPushScheduler {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn register(&self, destination: &str, cron: &str) -> SchedulerResult<String> {
        let response = self
            .client
            .post(self.url(""))
            .bearer_auth(&self.token)
            .json(&serde_json::json!({ "destination": destination, "cron": cron }))
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(status_error("register", response).await);
        }
        let body: RegisterResponse = response.json().await.map_err(transport_error)?;
        debug!(destination, cron, schedule_id = %body.schedule_id, "schedule registered");
        Ok(body.schedule_id)
    }

    async fn list(&self) -> SchedulerResult<Vec<RemoteSchedule>> {
        let response = self
            .client
            .get(self.url(""))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(status_error("list", response).await);
        }
        response.json().await.map_err(transport_error)
    }

    async fn delete(&self, schedule_id: &str) -> SchedulerResult<()> {
        let response = self
            .client
            .delete(self.url(&format!("/{schedule_id}")))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(transport_error)?;
        if response.status().is_success() || response.status() == StatusCode::NOT_FOUND {
            debug!(schedule_id, "schedule deleted");
            return Ok(());
        }
        Err(status_error("delete", response).await)
    }
}

/// In-process push scheduler for tests and local runs without a remote
/// scheduler. Counts every call it receives.
#[derive(Clone, Default)]
pub struct MemoryPushScheduler {
    schedules: Arc<Mutex<Vec<RemoteSchedule>>>,
    next_id: Arc<AtomicU64>,
    calls: Arc<AtomicU64>,
    unreachable: Arc<AtomicBool>,
}

impl MemoryPushScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_schedules(schedules: Vec<RemoteSchedule>) -> Self {
        let scheduler = Self::default();
        *scheduler.schedules.lock() = schedules;
        scheduler
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn schedules(&self) -> Vec<RemoteSchedule> {
        self.schedules.lock().clone()
    }

    fn enter(&self) -> SchedulerResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(SchedulerError::SecondaryUnreachable("simulated outage".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl PushScheduler for MemoryPushScheduler {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn register(&self, destination: &str, cron: &str) -> SchedulerResult<String> {
        self.enter()?;
        let schedule_id = format!("sched-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.schedules.lock().push(RemoteSchedule {
            schedule_id: schedule_id.clone(),
            destination: destination.to_string(),
            cron: cron.to_string(),
        });
        Ok(schedule_id)
    }

    async fn list(&self) -> SchedulerResult<Vec<RemoteSchedule>> {
        self.enter()?;
        Ok(self.schedules())
    }

    async fn delete(&self, schedule_id: &str) -> SchedulerResult<()> {
        self.enter()?;
        self.schedules
            .lock()
            .retain(|schedule| schedule.schedule_id != schedule_id);
        Ok(())
    }
}

/// Hex HMAC-SHA256 of `body`, formatted as the signature header value.
pub fn sign_callback(body: &[u8], signing_key: &str) -> SchedulerResult<String> {
    let mut mac = HmacSha256::new_from_slice(signing_key.as_bytes())
        .map_err(|e| SchedulerError::Secondary(e.to_string()))?;
    mac.update(body);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

/// Constant-time check of a callback signature header.
pub fn verify_callback(body: &[u8], header: &str, signing_key: &str) -> bool {
    let Some(hex_signature) = header.trim().strip_prefix("sha256=") else {
        return false;
    };
    let Ok(signature) = hex::decode(hex_signature) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(signing_key.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature).is_ok()
}

/// Cycle a push callback belongs to: the scheduler's own fire time when it
/// sends one, else the current minute.
pub fn callback_cycle(scheduled_at: Option<&str>, now: OffsetDateTime) -> OffsetDateTime {
    if let Some(millis) = scheduled_at.and_then(|value| value.trim().parse::<i64>().ok()) {
        return from_unix_millis(millis);
    }
    let seconds = now.unix_timestamp();
    OffsetDateTime::from_unix_timestamp(seconds - seconds.rem_euclid(60)).unwrap_or(now)
}
