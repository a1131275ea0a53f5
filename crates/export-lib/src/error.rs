//! Error taxonomy for export runs

use std::time::Duration;
use thiserror::Error;

/// Errors produced by the export pipeline stages
#[derive(Debug, Error)]
pub enum ExportError {
    /// Query parameters rejected before any network call
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// Network failure reaching the allocation API or storage
    #[error("transport error: {0}")]
    Transport(String),

    /// A network call exceeded its deadline
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// Allocation API answered with a non-success status code
    #[error("allocation API returned code {code}: {message}")]
    Api { code: i64, message: String },

    /// Response shape violates the nested window/key mapping contract
    #[error("malformed allocation response: {0}")]
    Flatten(String),

    /// Requested output format needs an encoder that is not present
    #[error("dependency unavailable: {0}")]
    DependencyUnavailable(String),

    /// Serializer failure while producing an artifact
    #[error("encoding failed: {0}")]
    Encode(String),

    /// Storage credential rejected
    #[error("storage authentication failed: {0}")]
    Auth(String),

    /// Transient storage failure
    #[error("upload failed: {0}")]
    Upload(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("run cancelled")]
    Cancelled,
}

impl ExportError {
    /// Whether the runner may retry the stage that produced this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExportError::Transport(_) | ExportError::Timeout { .. } | ExportError::Upload(_)
        )
    }

    /// Stable error class name used in run reports and metrics labels
    pub fn kind(&self) -> &'static str {
        match self {
            ExportError::InvalidQuery(_) => "InvalidQuery",
            ExportError::Transport(_) | ExportError::Timeout { .. } => "TransportError",
            ExportError::Api { .. } => "ApiError",
            ExportError::Flatten(_) => "FlattenError",
            ExportError::DependencyUnavailable(_) => "DependencyUnavailable",
            ExportError::Encode(_) => "EncodeError",
            ExportError::Auth(_) => "AuthError",
            ExportError::Upload(_) => "UploadError",
            ExportError::Config(_) => "ConfigError",
            ExportError::Io(_) => "IoError",
            ExportError::Cancelled => "Cancelled",
        }
    }
}

impl From<reqwest::Error> for ExportError {
    fn from(err: reqwest::Error) -> Self {
        ExportError::Transport(err.to_string())
    }
}

impl From<csv::Error> for ExportError {
    fn from(err: csv::Error) -> Self {
        ExportError::Encode(err.to_string())
    }
}
