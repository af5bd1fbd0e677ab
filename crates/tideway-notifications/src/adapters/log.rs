use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use super::Notifier;
use crate::error::NotificationError;
use crate::types::{NotificationRequest, SendResult};

/// Writes notifications to the log instead of delivering them.
///
/// Used when no notification collaborator is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn send(&self, request: &NotificationRequest) -> Result<SendResult, NotificationError> {
        request.validate()?;
        let id = Uuid::new_v4().to_string();
        info!(
            notification_id = %id,
            template = %request.template,
            recipient = %request.recipient,
            locale = %request.locale,
            variables = request.variables.len(),
            "notification logged (no notifier configured)"
        );
        Ok(SendResult::delivered(Some(id)))
    }

    async fn health(&self) -> Result<(), NotificationError> {
        Ok(())
    }
}
