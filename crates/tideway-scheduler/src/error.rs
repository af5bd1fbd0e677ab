use thiserror::Error;

pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Invalid job catalog: {0}")]
    InvalidCatalog(String),

    #[error("Invalid cron expression '{expression}' for job '{job_id}': {reason}")]
    InvalidCron {
        job_id: String,
        expression: String,
        reason: String,
    },

    #[error("Unknown job: {0}")]
    UnknownJob(String),

    #[error("No handler registered for job: {0}")]
    MissingHandler(String),

    #[error("Secondary scheduler request failed: {0}")]
    Secondary(String),

    #[error("Secondary scheduler unreachable: {0}")]
    SecondaryUnreachable(String),

    #[error(transparent)]
    Core(#[from] tideway_core::Error),
}

impl SchedulerError {
    pub fn is_unreachable(&self) -> bool {
        match self {
            Self::SecondaryUnreachable(_) => true,
            Self::Core(err) => err.is_unreachable(),
            _ => false,
        }
    }
}
