pub mod log;
pub mod webhook;

use async_trait::async_trait;

use crate::error::NotificationError;
use crate::types::{NotificationRequest, SendResult};

/// The notification collaborator as seen from the scheduler and server.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Short name used in logs and diagnostics.
    fn name(&self) -> &'static str;

    /// Send a notification.
    ///
    /// `Ok` with `success == false` means the collaborator answered and
    /// refused; `Err` means it could not be asked.
    async fn send(&self, request: &NotificationRequest) -> Result<SendResult, NotificationError>;

    /// Check that the collaborator is reachable.
    async fn health(&self) -> Result<(), NotificationError>;
}

pub use log::LogNotifier;
pub use webhook::{WebhookConfig, WebhookNotifier};
