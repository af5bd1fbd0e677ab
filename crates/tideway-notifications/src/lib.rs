pub mod adapters;
pub mod error;
pub mod types;

pub use adapters::{LogNotifier, Notifier, WebhookConfig, WebhookNotifier};
pub use error::NotificationError;
pub use types::{NotificationRequest, SendResult};
