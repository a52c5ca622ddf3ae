//! System-of-record access for vaultsync.
//!
//! - [`RecordStore`]: reload an entity from committed state, with relations
//! - [`SqliteRecordStore`]: SQLite store whose commit hooks feed the
//!   commit-hook observer
//! - [`MemoryCollection`]: document collection with snapshot subscriptions

mod collection;
mod error;
mod memory;
mod relation;
mod sqlite;
mod store;

pub use collection::{
    ChangeKind, Document, DocumentChange, DocumentSource, MemoryCollection, Snapshot,
    SnapshotStream,
};
pub use error::{StorageError, StorageResult};
pub use memory::MemoryRecordStore;
pub use relation::{Relation, RelationMap};
pub use sqlite::{CommitFeed, CommittedRow, RowAction, SqliteRecordStore};
pub use store::RecordStore;
