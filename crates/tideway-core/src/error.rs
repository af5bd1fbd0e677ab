use thiserror::Error;

/// Result alias used by the cache and scheduler layers.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure taxonomy of the resilience layer.
///
/// Only [`Error::InvalidKey`] is a caller bug. Every other variant describes a
/// condition the layer recovers from locally; none of them is ever rendered
/// to an end user.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid cache key: {reason}")]
    InvalidKey { reason: String },

    #[error("unexpected value type for key '{key}': {found}")]
    UnexpectedValueType { key: String, found: String },

    #[error("corrupted entry for key '{key}': expected {expected}, {reason}")]
    CorruptedEntry {
        key: String,
        expected: &'static str,
        reason: String,
    },

    #[error("backend '{backend}' unreachable: {reason}")]
    BackendUnreachable { backend: String, reason: String },

    #[error("job '{job_id}' failed after {attempts} attempts: {last_error}")]
    RetryExhausted {
        job_id: String,
        attempts: u32,
        last_error: String,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub fn invalid_key(reason: impl Into<String>) -> Self {
        Self::InvalidKey {
            reason: reason.into(),
        }
    }

    pub fn unexpected_value_type(key: impl Into<String>, found: impl Into<String>) -> Self {
        Self::UnexpectedValueType {
            key: key.into(),
            found: found.into(),
        }
    }

    pub fn corrupted(key: impl Into<String>, expected: &'static str, reason: impl Into<String>) -> Self {
        Self::CorruptedEntry {
            key: key.into(),
            expected,
            reason: reason.into(),
        }
    }

    pub fn unreachable(backend: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::BackendUnreachable {
            backend: backend.into(),
            reason: reason.into(),
        }
    }

    /// Whether the error means a dependency could not be reached in time.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::BackendUnreachable { .. })
    }

    /// Whether the error stems from a caller bug rather than the environment.
    pub fn is_caller_error(&self) -> bool {
        matches!(self, Self::InvalidKey { .. })
    }
}
