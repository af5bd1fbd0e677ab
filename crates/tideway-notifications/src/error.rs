use thiserror::Error;

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Notifier unreachable: {0}")]
    Unreachable(String),
}

impl NotificationError {
    /// Whether retrying the same request could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::SendFailed(_) | Self::Unreachable(_))
    }
}
