//! Error types for the sync layer.

use thiserror::Error;
use vaultsync_storage::StorageError;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The observation channel failed (subscription dropped, source offline).
    #[error("transport error: {0}")]
    Transport(String),

    /// Reading the system of record failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// The sink rejected or failed a delivery.
    #[error("sink error: {0}")]
    Sink(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A record could not be turned into a change event.
    #[error("invalid record: {0}")]
    Record(#[from] vaultsync_types::Error),

    /// A table name that the registry does not know.
    #[error("unknown table: {0}")]
    UnknownTable(String),

    /// Registry configuration is inconsistent.
    #[error("invalid registry: {0}")]
    Registry(String),

    /// Outbox persistence failed.
    #[error("outbox error: {0}")]
    Outbox(String),

    /// `start` called on a running engine or observer.
    #[error("already running")]
    AlreadyRunning,

    /// Operation requires a running engine or observer.
    #[error("not running")]
    NotRunning,

    /// Channel closed.
    #[error("channel closed")]
    ChannelClosed,
}

impl SyncError {
    /// Whether the error belongs to the observation channel and should be
    /// handled by the connection supervisor rather than dropped with the
    /// notification.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Transport(_)
                | Self::ChannelClosed
                | Self::Storage(StorageError::Unavailable(_) | StorageError::Subscription(_))
        )
    }
}
