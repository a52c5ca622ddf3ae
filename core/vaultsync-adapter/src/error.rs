//! Adapter error types.

use thiserror::Error;
use vaultsync_sync::SyncError;

/// Result type for adapter operations.
pub type AdapterResult<T> = Result<T, AdapterError>;

/// Errors raised by the sink-side collaborators.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// The sink answered with a non-success status.
    #[error("sink responded {status}: {body}")]
    Http { status: u16, body: String },

    /// The request never got a response.
    #[error("network error: {0}")]
    Network(String),

    /// Id mapping database failure.
    #[error("mapping database error: {0}")]
    Database(String),

    /// A schema mapping file could not be read or parsed.
    #[error("invalid schema mapping: {0}")]
    Schema(String),

    /// A change for a table without a schema mapping.
    #[error("no schema mapping for table {0}")]
    UnmappedTable(String),

    /// A mapping with an empty local id, global id or table.
    #[error("invalid id mapping: {0}")]
    InvalidMapping(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl AdapterError {
    /// Whether retrying the same request later could succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Http { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl From<AdapterError> for SyncError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::Serialization(e) => SyncError::Serialization(e),
            AdapterError::UnmappedTable(table) => SyncError::UnknownTable(table),
            other => SyncError::Sink(other.to_string()),
        }
    }
}
