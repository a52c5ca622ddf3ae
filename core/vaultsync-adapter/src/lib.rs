//! Sink-side collaborators for the vaultsync engine.
//!
//! - [`LockedIds`]: ids the sink is writing, with expiring locks
//! - [`MappingDb`]: local ↔ global id mappings in SQLite
//! - [`SchemaRegistry`]: per-table schema mapping files
//! - [`HttpSink`]: webhook delivery of changes

mod error;
mod http_sink;
mod locks;
mod mapping_db;
mod schema;

pub use error::{AdapterError, AdapterResult};
pub use http_sink::{HttpSink, HttpSinkConfig, SOURCE_HEADER};
pub use locks::{LockedIds, DEFAULT_LOCK_TTL};
pub use mapping_db::{MappingDb, MAPPING_DB_FILE};
pub use schema::{SchemaMapping, SchemaRegistry};
