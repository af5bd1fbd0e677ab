use std::sync::Arc;

use async_trait::async_trait;
use tideway_notifications::{NotificationRequest, Notifier};
use tracing::info;

use crate::handler::{HandlerError, JobContext, JobHandler};

/// Asks the notification collaborator to send a job's digest.
///
/// The template is named after the job; rendering and recipient fan-out
/// happen downstream.
pub struct NotificationDigestHandler {
    notifier: Arc<dyn Notifier>,
    recipient: String,
    locale: String,
}

impl NotificationDigestHandler {
    pub fn new(notifier: Arc<dyn Notifier>, recipient: impl Into<String>, locale: impl Into<String>) -> Self {
        Self {
            notifier,
            recipient: recipient.into(),
            locale: locale.into(),
        }
    }
}

#[async_trait]
impl JobHandler for NotificationDigestHandler {
    async fn run(&self, ctx: &JobContext) -> Result<(), HandlerError> {
        let request = NotificationRequest::new(ctx.job_id.as_str(), self.recipient.as_str())
            .locale(self.locale.as_str())
            .variable("cycle", ctx.cycle_millis())
            .variable("idempotency_key", ctx.idempotency_key());

        let result = self.notifier.send(&request).await.map_err(|e| {
            if e.is_transient() {
                HandlerError::Transient(e.to_string())
            } else {
                HandlerError::Permanent(e.to_string())
            }
        })?;

        if !result.success {
            return Err(HandlerError::Permanent(
                result
                    .error
                    .unwrap_or_else(|| "notification rejected".to_string()),
            ));
        }
        info!(
            job_id = %ctx.job_id,
            notifier = self.notifier.name(),
            external_id = ?result.external_id,
            "digest notification sent"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tideway_notifications::{NotificationError, SendResult};
    use time::macros::datetime;

    #[derive(Default)]
    struct Recording {
        sent: Mutex<Vec<NotificationRequest>>,
        outcome: Mutex<Option<NotificationError>>,
    }

    #[async_trait]
    impl Notifier for Recording {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn send(&self, request: &NotificationRequest) -> Result<SendResult, NotificationError> {
            self.sent.lock().push(request.clone());
            match self.outcome.lock().take() {
                Some(err) => Err(err),
                None => Ok(SendResult::delivered(None)),
            }
        }

        async fn health(&self) -> Result<(), NotificationError> {
            Ok(())
        }
    }

    fn ctx() -> JobContext {
        JobContext {
            job_id: "appointment-reminders".into(),
            cycle: datetime!(2025-08-10 10:00:00 UTC),
            attempt: 1,
            target: None,
        }
    }

    #[tokio::test]
    async fn sends_template_named_after_job() {
        let notifier = Arc::new(Recording::default());
        let handler = NotificationDigestHandler::new(notifier.clone(), "ops@example.com", "en");
        handler.run(&ctx()).await.unwrap();

        let sent = notifier.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].template, "appointment-reminders");
        assert_eq!(
            sent[0].variables["idempotency_key"],
            "appointment-reminders:1754820000000"
        );
    }

    #[tokio::test]
    async fn maps_error_classes() {
        let notifier = Arc::new(Recording::default());
        let handler = NotificationDigestHandler::new(notifier.clone(), "ops@example.com", "en");

        *notifier.outcome.lock() = Some(NotificationError::Unreachable("down".into()));
        assert!(handler.run(&ctx()).await.unwrap_err().is_transient());

        *notifier.outcome.lock() = Some(NotificationError::InvalidRequest("bad".into()));
        assert!(!handler.run(&ctx()).await.unwrap_err().is_transient());
    }
}
