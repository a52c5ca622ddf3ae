//! Core type definitions for vaultsync.
//!
//! This crate defines the fundamental types that flow through the change
//! capture engine:
//! - Local and global entity identifiers
//! - Pluralized table names used for routing
//! - The normalized `ChangeEvent` handed to the sink
//! - Payload flattening (JSON-safe, private fields stripped)
//!
//! Nothing here performs I/O. Observers, storage and the sink live in their
//! own crates.

mod change;
pub mod flatten;
mod ids;
mod table;

pub use change::{ChangeEvent, Operation, Record};
pub use flatten::{extract_id, flatten_record, flatten_value, ID_ALIASES};
pub use ids::{EntityId, GlobalId};
pub use table::TableName;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid entity id: {0:?}")]
    InvalidId(String),

    #[error("invalid table name: {0:?}")]
    InvalidTable(String),

    #[error("record has no usable id field")]
    MissingId,

    #[error("record is not a JSON object")]
    NotAnObject,
}
