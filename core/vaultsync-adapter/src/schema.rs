//! Schema mappings.
//!
//! Each synced table has a JSON mapping file naming the sink schema its
//! records are published under:
//!
//! ```json
//! {
//!   "tableName": "users",
//!   "schemaId": "550e8400-e29b-41d4-a716-446655440000",
//!   "ownerEnamePath": "ename",
//!   "localToUniversalMap": { "handle": "username" }
//! }
//! ```
//!
//! Tables without a mapping are not forwarded.

use crate::error::{AdapterError, AdapterResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};
use vaultsync_types::TableName;

/// One table's mapping file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaMapping {
    pub table_name: String,
    pub schema_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_ename_path: Option<String>,
    #[serde(default)]
    pub local_to_universal_map: Map<String, Value>,
}

/// Schema mappings keyed by routing table name.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    mappings: HashMap<TableName, SchemaMapping>,
}

impl SchemaRegistry {
    /// Loads every `*.json` file in `dir`. A later file for the same table
    /// replaces an earlier one (files are read in name order).
    pub fn load_dir(dir: impl AsRef<Path>) -> AdapterResult<Self> {
        let dir = dir.as_ref();
        let mut paths: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        let mut registry = Self::default();
        for path in paths {
            let content = std::fs::read_to_string(&path)?;
            let mapping: SchemaMapping = serde_json::from_str(&content).map_err(|e| {
                AdapterError::Schema(format!("{}: {e}", path.display()))
            })?;
            if registry.insert(mapping)?.is_some() {
                warn!(file = %path.display(), "schema mapping overrides an earlier file");
            }
        }
        info!(dir = %dir.display(), tables = registry.len(), "schema mappings loaded");
        Ok(registry)
    }

    /// Builds a registry from mappings already in memory.
    pub fn from_mappings(mappings: impl IntoIterator<Item = SchemaMapping>) -> AdapterResult<Self> {
        let mut registry = Self::default();
        for mapping in mappings {
            registry.insert(mapping)?;
        }
        Ok(registry)
    }

    fn insert(&mut self, mapping: SchemaMapping) -> AdapterResult<Option<SchemaMapping>> {
        if mapping.schema_id.trim().is_empty() {
            return Err(AdapterError::Schema(format!(
                "{} has an empty schemaId",
                mapping.table_name
            )));
        }
        let table = TableName::raw(&mapping.table_name)
            .map_err(|e| AdapterError::Schema(e.to_string()))?;
        Ok(self.mappings.insert(table, mapping))
    }

    #[must_use]
    pub fn get(&self, table: &TableName) -> Option<&SchemaMapping> {
        self.mappings.get(table)
    }

    #[must_use]
    pub fn contains(&self, table: &TableName) -> bool {
        self.mappings.contains_key(table)
    }

    /// Mapped tables, sorted.
    #[must_use]
    pub fn tables(&self) -> Vec<&TableName> {
        let mut tables: Vec<_> = self.mappings.keys().collect();
        tables.sort();
        tables
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }
}
