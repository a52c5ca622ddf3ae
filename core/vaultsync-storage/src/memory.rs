//! In-memory record store.

use crate::error::StorageResult;
use crate::relation::RelationMap;
use crate::store::{find_with_relations, key_of, scalar_filter, RecordStore, RowSource};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use vaultsync_types::{EntityId, Record};

/// A record store holding JSON rows in memory.
///
/// Rows are keyed by their `id` field; inserting a row with an existing id
/// replaces it.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    tables: RwLock<HashMap<String, Vec<Record>>>,
    relations: RelationMap,
}

impl MemoryRecordStore {
    /// Creates an empty store with the given relation declarations.
    #[must_use]
    pub fn new(relations: RelationMap) -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            relations,
        }
    }

    /// Inserts or replaces a row. Rows without an id are appended as-is
    /// (junction tables commonly have none).
    pub fn upsert(&self, table: &str, row: Record) {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        let rows = tables.entry(table.to_string()).or_default();
        let id = row.get("id").and_then(key_of);
        match id.and_then(|id| {
            rows.iter()
                .position(|r| r.get("id").and_then(key_of).as_deref() == Some(id.as_str()))
        }) {
            Some(idx) => rows[idx] = row,
            None => rows.push(row),
        }
    }

    /// Removes a row by id. Returns whether a row was removed.
    pub fn remove(&self, table: &str, id: &str) -> bool {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        let Some(rows) = tables.get_mut(table) else {
            return false;
        };
        let before = rows.len();
        rows.retain(|r| r.get("id").and_then(key_of).as_deref() != Some(id));
        rows.len() != before
    }

    /// Number of rows in a table.
    #[must_use]
    pub fn len(&self, table: &str) -> usize {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(table)
            .map_or(0, Vec::len)
    }
}

impl RowSource for MemoryRecordStore {
    fn row_by_id(&self, table: &str, id: &str) -> StorageResult<Option<Record>> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        Ok(tables.get(table).and_then(|rows| {
            rows.iter()
                .find(|r| r.get("id").and_then(key_of).as_deref() == Some(id))
                .cloned()
        }))
    }

    fn rows_where(&self, table: &str, column: &str, value: &str) -> StorageResult<Vec<Record>> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        Ok(tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|r| r.get(column).and_then(key_of).as_deref() == Some(value))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn first_matching(&self, table: &str, fields: &[(String, Value)]) -> StorageResult<Option<Record>> {
        if fields.is_empty() {
            return Ok(None);
        }
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        Ok(tables.get(table).and_then(|rows| {
            rows.iter()
                .find(|r| fields.iter().all(|(k, v)| r.get(k) == Some(v)))
                .cloned()
        }))
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn find_one(
        &self,
        table: &str,
        id: &EntityId,
        relations: &[String],
    ) -> StorageResult<Option<Record>> {
        find_with_relations(self, &self.relations, table, id.as_str(), relations)
    }

    async fn find_matching(&self, table: &str, fields: &Record) -> StorageResult<Option<Record>> {
        self.first_matching(table, &scalar_filter(fields))
    }
}
