//! Error types for the storage layer.

use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur in storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Table or column name that is not a plain identifier.
    #[error("invalid identifier: {0:?}")]
    InvalidIdentifier(String),

    /// A relation path names a relation the table does not declare.
    #[error("unknown relation {relation:?} on table {table}")]
    UnknownRelation { table: String, relation: String },

    /// The store or collection refused the subscription.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// An established subscription broke.
    #[error("subscription error: {0}")]
    Subscription(String),

    /// A blocking task panicked or was cancelled.
    #[error("background task failed: {0}")]
    Task(String),
}
