//! Entity registry.
//!
//! Raw table names are resolved once, at the observer boundary, into a typed
//! [`Resolved`] value. Everything downstream works with the resolved kind and
//! its policy (relations to load, consistency delay, forward filter) instead
//! of comparing strings.

use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use vaultsync_types::{Record, TableName};

/// Rule deciding whether a record of a kind is forwarded at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ForwardFilter {
    /// Forward only records whose string field contains `needle`.
    FieldContains { field: String, needle: String },
}

impl ForwardFilter {
    /// Whether `record` passes the filter.
    #[must_use]
    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Self::FieldContains { field, needle } => matches!(
                record.get(field),
                Some(Value::String(text)) if text.contains(needle.as_str())
            ),
        }
    }
}

/// Declaration of one synced entity kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityKindSpec {
    /// Kind name, e.g. `Message`.
    pub name: String,
    /// Table or collection name; pluralized on load.
    pub table: String,
    /// Relation paths loaded on reload (dotted paths allowed).
    #[serde(default)]
    pub relations: Vec<String>,
    /// Consistency delay before an update is reloaded (ms).
    #[serde(default)]
    pub consistency_delay_ms: Option<u64>,
    #[serde(default)]
    pub forward_filter: Option<ForwardFilter>,
}

/// Declaration of one many-to-many association table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JunctionSpec {
    /// Association table name as the source reports it.
    pub table: String,
    /// Name of the owning entity kind.
    pub parent: String,
    /// Column of the association row holding the parent id.
    pub parent_id_field: String,
}

/// Full registry declaration, usually read from a config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySpec {
    pub entities: Vec<EntityKindSpec>,
    pub junctions: Vec<JunctionSpec>,
    /// Tables never forwarded (raw or plural names).
    pub ignored: Vec<String>,
}

/// A resolved entity kind.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityKind {
    name: String,
    source_table: String,
    table: TableName,
    relations: Vec<String>,
    consistency_delay: Duration,
    forward_filter: Option<ForwardFilter>,
}

impl EntityKind {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Plural routing name.
    #[must_use]
    pub fn table(&self) -> &TableName {
        &self.table
    }

    /// Table name in the system of record, used for reloads.
    #[must_use]
    pub fn source_table(&self) -> &str {
        &self.source_table
    }

    /// Relation paths to load on reload.
    #[must_use]
    pub fn relations(&self) -> &[String] {
        &self.relations
    }

    /// First segment of every relation path, deduplicated: the keys under
    /// which relations are nested in a reloaded row.
    #[must_use]
    pub fn relation_heads(&self) -> Vec<&str> {
        let mut heads: Vec<&str> = Vec::new();
        for path in &self.relations {
            let head = path.split('.').next().unwrap_or(path);
            if !heads.contains(&head) {
                heads.push(head);
            }
        }
        heads
    }

    #[must_use]
    pub fn consistency_delay(&self) -> Duration {
        self.consistency_delay
    }

    #[must_use]
    pub fn forward_filter(&self) -> Option<&ForwardFilter> {
        self.forward_filter.as_ref()
    }

    /// Whether a record of this kind may be forwarded.
    #[must_use]
    pub fn forwards(&self, record: &Record) -> bool {
        self.forward_filter.as_ref().is_none_or(|f| f.matches(record))
    }
}

/// A resolved association table.
#[derive(Debug, Clone, PartialEq)]
pub struct Junction {
    table: String,
    parent: Arc<EntityKind>,
    parent_id_field: String,
}

impl Junction {
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    #[must_use]
    pub fn parent(&self) -> &Arc<EntityKind> {
        &self.parent
    }

    #[must_use]
    pub fn parent_id_field(&self) -> &str {
        &self.parent_id_field
    }
}

/// Outcome of resolving a raw table name.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved {
    Entity(Arc<EntityKind>),
    Junction(Arc<Junction>),
    /// Not synced: listed as ignored, or not declared at all.
    Ignored,
}

/// Lookup from raw table names to entity kinds and junctions.
#[derive(Debug, Clone, Default)]
pub struct EntityRegistry {
    by_table: HashMap<TableName, Arc<EntityKind>>,
    by_name: HashMap<String, Arc<EntityKind>>,
    junctions: HashMap<String, Arc<Junction>>,
    ignored: HashSet<String>,
}

impl EntityRegistry {
    /// Builds the registry. Kinds without their own consistency delay get
    /// `default_delay`.
    pub fn from_spec(spec: RegistrySpec, default_delay: Duration) -> SyncResult<Self> {
        let mut registry = Self::default();

        for kind in spec.entities {
            let table = TableName::pluralize(&kind.table)?;
            let entity = Arc::new(EntityKind {
                name: kind.name.clone(),
                source_table: normalize(&kind.table),
                table: table.clone(),
                relations: kind.relations,
                consistency_delay: kind
                    .consistency_delay_ms
                    .map_or(default_delay, Duration::from_millis),
                forward_filter: kind.forward_filter,
            });
            if registry.by_table.insert(table.clone(), Arc::clone(&entity)).is_some() {
                return Err(SyncError::Registry(format!("table {table} declared twice")));
            }
            if registry.by_name.insert(kind.name.clone(), entity).is_some() {
                return Err(SyncError::Registry(format!("kind {} declared twice", kind.name)));
            }
        }

        for junction in spec.junctions {
            let parent = registry.by_name.get(&junction.parent).cloned().ok_or_else(|| {
                SyncError::Registry(format!(
                    "junction {} names unknown parent {}",
                    junction.table, junction.parent
                ))
            })?;
            let table = normalize(&junction.table);
            registry.junctions.insert(
                table.clone(),
                Arc::new(Junction {
                    table,
                    parent,
                    parent_id_field: junction.parent_id_field,
                }),
            );
        }

        registry.ignored = spec.ignored.iter().map(|t| normalize(t)).collect();
        Ok(registry)
    }

    /// Resolves a table name as reported by a source.
    #[must_use]
    pub fn resolve(&self, raw: &str) -> Resolved {
        let name = normalize(raw);
        if self.ignored.contains(&name) {
            return Resolved::Ignored;
        }
        if let Some(junction) = self.junctions.get(&name) {
            return Resolved::Junction(Arc::clone(junction));
        }
        match TableName::pluralize(&name) {
            Ok(table) if self.ignored.contains(table.as_str()) => Resolved::Ignored,
            Ok(table) => self
                .by_table
                .get(&table)
                .map_or(Resolved::Ignored, |kind| Resolved::Entity(Arc::clone(kind))),
            Err(_) => Resolved::Ignored,
        }
    }

    /// Looks up a kind by name.
    #[must_use]
    pub fn kind(&self, name: &str) -> Option<&Arc<EntityKind>> {
        self.by_name.get(name)
    }

    /// Looks up a kind by its plural table name.
    #[must_use]
    pub fn by_table(&self, table: &TableName) -> Option<&Arc<EntityKind>> {
        self.by_table.get(table)
    }

    /// Number of declared entity kinds.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_table.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_table.is_empty()
    }
}

fn normalize(raw: &str) -> String {
    raw.trim().to_lowercase()
}
