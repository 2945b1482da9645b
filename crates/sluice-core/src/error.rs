use thiserror::Error;

/// Application-wide error types for Sluice.
#[derive(Error, Debug)]
pub enum AppError {
    /// User-supplied input (range bounds, resource names) is malformed.
    ///
    /// Raised before any network call is made on behalf of the input.
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Engine or backend configuration is invalid.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Upstream failure worth retrying: network errors, 5xx, 408 and 429.
    #[error("Transient upstream error for {url}: {message}")]
    TransientUpstream {
        url: String,
        status_code: Option<u16>,
        message: String,
    },

    /// Upstream failure that will not go away on retry: 4xx or an undecodable body.
    #[error("Permanent upstream error for {url}: {message}")]
    PermanentUpstream {
        url: String,
        status_code: Option<u16>,
        message: String,
    },

    /// The retry budget ran out; carries the last transient failure.
    #[error("Retries exhausted after {attempts} attempts: {last}")]
    ExhaustedRetries {
        attempts: u32,
        #[source]
        last: Box<AppError>,
    },

    /// Reading or writing checkpoint state failed.
    #[error("Checkpoint error: {0}")]
    CheckpointError(String),

    /// Database operation failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// The run was cancelled before it finished.
    #[error("Run cancelled")]
    Cancelled,

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl AppError {
    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::TransientUpstream { .. })
    }

    /// Build a permanent error for a payload that decoded but has the wrong shape.
    pub fn malformed_payload(url: &str, message: impl Into<String>) -> Self {
        AppError::PermanentUpstream {
            url: url.to_string(),
            status_code: None,
            message: message.into(),
        }
    }
}
