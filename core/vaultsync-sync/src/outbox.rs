//! Persistent outbox for failed deliveries.
//!
//! Uses its own SQLite file. Only the latest failed change per
//! `(table, entity)` is kept: the sink wants the current state, not the
//! history of attempts.

use crate::error::SyncError;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use vaultsync_types::ChangeEvent;

/// A change waiting for redelivery.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxEntry {
    pub seq: i64,
    pub event: ChangeEvent,
    pub attempts: u32,
    pub last_error: String,
}

/// SQLite-backed queue of changes the sink failed to accept.
#[derive(Clone)]
pub struct DeliveryOutbox {
    conn: Arc<Mutex<Connection>>,
}

impl DeliveryOutbox {
    /// Opens (or creates) an outbox at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        let conn = Connection::open(path)
            .map_err(|e| SyncError::Outbox(format!("failed to open outbox: {e}")))?;
        Self::with_connection(conn)
    }

    /// Opens an in-memory outbox (for testing).
    pub fn open_in_memory() -> Result<Self, SyncError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| SyncError::Outbox(format!("failed to open in-memory outbox: {e}")))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, SyncError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS outbox (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                table_name TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                event TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 1,
                last_error TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE(table_name, entity_id)
            );
            ",
        )
        .map_err(|e| SyncError::Outbox(format!("failed to init outbox schema: {e}")))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores a failed change, replacing any older entry for the same
    /// entity.
    pub fn push(&self, event: &ChangeEvent, error: &str) -> Result<(), SyncError> {
        let json = serde_json::to_string(event)?;
        self.conn()
            .execute(
                "INSERT INTO outbox (table_name, entity_id, event, last_error, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(table_name, entity_id) DO UPDATE SET
                    event = excluded.event,
                    attempts = outbox.attempts + 1,
                    last_error = excluded.last_error",
                params![
                    event.table_name.as_str(),
                    event.entity_id.as_str(),
                    json,
                    error,
                    Utc::now().to_rfc3339(),
                ],
            )
            .map_err(|e| SyncError::Outbox(format!("failed to store change: {e}")))?;
        Ok(())
    }

    /// Oldest entries first.
    pub fn pending(&self, limit: usize) -> Result<Vec<OutboxEntry>, SyncError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT seq, event, attempts, last_error FROM outbox ORDER BY seq ASC LIMIT ?1",
            )
            .map_err(|e| SyncError::Outbox(format!("failed to prepare outbox query: {e}")))?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt
            .query_map(params![limit], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, u32>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .map_err(|e| SyncError::Outbox(format!("failed to read outbox: {e}")))?;

        let mut entries = Vec::new();
        for row in rows {
            let (seq, json, attempts, last_error) =
                row.map_err(|e| SyncError::Outbox(format!("failed to read outbox row: {e}")))?;
            entries.push(OutboxEntry {
                seq,
                event: serde_json::from_str(&json)?,
                attempts,
                last_error,
            });
        }
        Ok(entries)
    }

    /// Removes a delivered entry.
    pub fn remove(&self, seq: i64) -> Result<bool, SyncError> {
        let removed = self
            .conn()
            .execute("DELETE FROM outbox WHERE seq = ?1", params![seq])
            .map_err(|e| SyncError::Outbox(format!("failed to remove entry: {e}")))?;
        Ok(removed > 0)
    }

    /// Records another failed attempt on an entry.
    pub fn record_failure(&self, seq: i64, error: &str) -> Result<(), SyncError> {
        self.conn()
            .execute(
                "UPDATE outbox SET attempts = attempts + 1, last_error = ?2 WHERE seq = ?1",
                params![seq, error],
            )
            .map_err(|e| SyncError::Outbox(format!("failed to update entry: {e}")))?;
        Ok(())
    }

    /// Attempts recorded for an entity, if it is queued.
    pub fn attempts(&self, table: &str, entity_id: &str) -> Result<Option<u32>, SyncError> {
        self.conn()
            .query_row(
                "SELECT attempts FROM outbox WHERE table_name = ?1 AND entity_id = ?2",
                params![table, entity_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| SyncError::Outbox(format!("failed to read entry: {e}")))
    }

    pub fn len(&self) -> Result<usize, SyncError> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM outbox", [], |row| row.get(0))
            .map_err(|e| SyncError::Outbox(format!("failed to count outbox: {e}")))?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    pub fn is_empty(&self) -> Result<bool, SyncError> {
        Ok(self.len()? == 0)
    }
}
