//! Local ↔ global id mappings.
//!
//! Every record the sink has published gets a global id. The mapping is
//! kept in its own SQLite file, `mappings.db`, so it survives restarts and
//! can be shared with the inbound side of the sink.

use crate::error::{AdapterError, AdapterResult};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};
use vaultsync_sync::{GlobalIdLookup, SyncResult};
use vaultsync_types::{EntityId, GlobalId, TableName};

/// File name of the mapping database inside its directory.
pub const MAPPING_DB_FILE: &str = "mappings.db";

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS id_mappings (
        local_id TEXT NOT NULL,
        global_id TEXT NOT NULL,
        table_name TEXT NOT NULL,
        created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
        PRIMARY KEY (global_id, table_name)
    );
    CREATE INDEX IF NOT EXISTS idx_local_id ON id_mappings(local_id);
    CREATE INDEX IF NOT EXISTS idx_table_name ON id_mappings(table_name);
";

/// SQLite-backed id mapping store.
#[derive(Clone)]
pub struct MappingDb {
    conn: Arc<Mutex<Connection>>,
}

impl MappingDb {
    /// Opens (or creates) `mappings.db` inside `dir`.
    pub fn open(dir: impl AsRef<Path>) -> AdapterResult<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let path = dir.join(MAPPING_DB_FILE);
        let conn = Connection::open(&path)
            .map_err(|e| AdapterError::Database(format!("failed to open {}: {e}", path.display())))?;
        info!(path = %path.display(), "mapping database opened");
        Self::with_connection(conn)
    }

    /// Opens an in-memory mapping store (for testing).
    pub fn open_in_memory() -> AdapterResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| AdapterError::Database(format!("failed to open in-memory db: {e}")))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> AdapterResult<Self> {
        conn.execute_batch(SCHEMA)
            .map_err(|e| AdapterError::Database(format!("failed to init schema: {e}")))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records that `local` in `table` is published as `global`.
    ///
    /// An existing mapping for the local id wins; returns whether a new
    /// mapping was written.
    pub fn store_mapping(&self, local: &str, global: &str, table: &str) -> AdapterResult<bool> {
        if local.trim().is_empty() || global.trim().is_empty() || table.trim().is_empty() {
            return Err(AdapterError::InvalidMapping(format!(
                "local={local:?} global={global:?} table={table:?}"
            )));
        }
        if let Some(existing) = self.global_for(local, table)? {
            debug!(local, table, existing = %existing, "mapping already exists");
            return Ok(false);
        }
        self.conn()
            .execute(
                "INSERT INTO id_mappings (local_id, global_id, table_name) VALUES (?1, ?2, ?3)",
                params![local, global, table],
            )
            .map_err(|e| AdapterError::Database(format!("failed to store mapping: {e}")))?;
        debug!(local, global, table, "mapping stored");
        Ok(true)
    }

    fn global_for(&self, local: &str, table: &str) -> AdapterResult<Option<String>> {
        self.conn()
            .query_row(
                "SELECT global_id FROM id_mappings WHERE local_id = ?1 AND table_name = ?2",
                params![local, table],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| AdapterError::Database(format!("failed to read mapping: {e}")))
    }

    /// Global id of a local record, if it was ever published.
    pub fn global_id(&self, local: &EntityId, table: &TableName) -> AdapterResult<Option<GlobalId>> {
        Ok(self
            .global_for(local.as_str(), table.as_str())?
            .and_then(GlobalId::new))
    }

    /// Local id behind a global id.
    pub fn local_id(&self, global: &GlobalId, table: &TableName) -> AdapterResult<Option<EntityId>> {
        let local: Option<String> = self
            .conn()
            .query_row(
                "SELECT local_id FROM id_mappings WHERE global_id = ?1 AND table_name = ?2",
                params![global.as_str(), table.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| AdapterError::Database(format!("failed to read mapping: {e}")))?;
        Ok(local.and_then(|l| EntityId::parse(&l).ok()))
    }

    /// Drops the mapping of a local record. Returns whether one existed.
    pub fn delete_mapping(&self, local: &str, table: &str) -> AdapterResult<bool> {
        let deleted = self
            .conn()
            .execute(
                "DELETE FROM id_mappings WHERE local_id = ?1 AND table_name = ?2",
                params![local, table],
            )
            .map_err(|e| AdapterError::Database(format!("failed to delete mapping: {e}")))?;
        Ok(deleted > 0)
    }

    pub fn len(&self) -> AdapterResult<usize> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM id_mappings", [], |row| row.get(0))
            .map_err(|e| AdapterError::Database(format!("failed to count mappings: {e}")))?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    pub fn is_empty(&self) -> AdapterResult<bool> {
        Ok(self.len()? == 0)
    }
}

#[async_trait]
impl GlobalIdLookup for MappingDb {
    async fn global_id(&self, local: &EntityId, table: &TableName) -> SyncResult<Option<GlobalId>> {
        Ok(MappingDb::global_id(self, local, table)?)
    }
}
