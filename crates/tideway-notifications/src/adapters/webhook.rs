use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use time::OffsetDateTime;
use tracing::{debug, warn};
use uuid::Uuid;

use super::Notifier;
use crate::error::NotificationError;
use crate::types::{NotificationRequest, SendResult};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Signature-256";

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    /// Where notifications are POSTed.
    pub url: String,
    /// HMAC-SHA256 key for the signature header.
    #[serde(default)]
    pub secret: Option<String>,
    /// Extra headers added to every request.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Endpoint answering GET for health checks. Without one, health checks
    /// only verify the configuration.
    #[serde(default)]
    pub health_url: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    5_000
}

pub struct WebhookNotifier {
    http_client: Client,
    config: WebhookConfig,
}

impl WebhookNotifier {
    pub fn new(config: WebhookConfig) -> Result<Self, NotificationError> {
        if config.url.trim().is_empty() {
            return Err(NotificationError::InvalidConfig("Missing webhook url".into()));
        }
        let http_client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| NotificationError::InvalidConfig(e.to_string()))?;
        Ok(Self {
            http_client,
            config,
        })
    }

    pub fn sign_payload(payload: &str, secret: &str) -> Result<String, NotificationError> {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| NotificationError::InvalidConfig(e.to_string()))?;
        mac.update(payload.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn send(&self, request: &NotificationRequest) -> Result<SendResult, NotificationError> {
        request.validate()?;

        let notification_id = Uuid::new_v4().to_string();
        let timestamp = OffsetDateTime::now_utc()
            .format(&time::format_description::well_known::Rfc3339)
            .unwrap_or_default();

        let payload = json!({
            "notification_id": notification_id,
            "template": request.template,
            "recipient": request.recipient,
            "locale": request.locale,
            "variables": request.variables,
            "timestamp": timestamp
        });
        let payload_str = serde_json::to_string(&payload)
            .map_err(|e| NotificationError::SendFailed(e.to_string()))?;

        let mut http_request = self
            .http_client
            .post(&self.config.url)
            .header("Content-Type", "application/json");

        for (key, value) in &self.config.headers {
            http_request = http_request.header(key, value);
        }

        if let Some(secret) = &self.config.secret {
            let signature = Self::sign_payload(&payload_str, secret)?;
            http_request = http_request.header(SIGNATURE_HEADER, format!("sha256={signature}"));
        }

        let response = http_request.body(payload_str).send().await.map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                NotificationError::Unreachable(e.to_string())
            } else {
                NotificationError::SendFailed(e.to_string())
            }
        })?;

        let status = response.status();
        if status.is_success() {
            debug!(notification_id = %notification_id, template = %request.template, "webhook delivered");
            Ok(SendResult::delivered(Some(notification_id)))
        } else if status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            Err(NotificationError::SendFailed(format!(
                "Webhook returned {status}: {body}"
            )))
        } else {
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, template = %request.template, "webhook rejected notification");
            Ok(SendResult::rejected(format!("Webhook failed: {status} {body}")))
        }
    }

    async fn health(&self) -> Result<(), NotificationError> {
        let Some(health_url) = &self.config.health_url else {
            return Ok(());
        };
        let response = self
            .http_client
            .get(health_url)
            .send()
            .await
            .map_err(|e| NotificationError::Unreachable(e.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(NotificationError::SendFailed(format!(
                "health check returned {}",
                response.status()
            )))
        }
    }
}
