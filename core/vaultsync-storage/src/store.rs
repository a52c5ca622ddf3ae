//! Read access to the system of record.

use crate::error::{StorageError, StorageResult};
use crate::relation::{split_paths, Relation, RelationMap};
use async_trait::async_trait;
use serde_json::Value;
use vaultsync_types::{EntityId, Record};

/// Read-only view of the system of record used by the engine.
///
/// `find_one` is the "reload from committed state" primitive: it returns the
/// row as it is now, with the requested relations nested under their names.
/// Relation paths may be dotted (`poll.group`) to load relations of related
/// rows.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Loads one row by id. `Ok(None)` when the row does not exist.
    async fn find_one(
        &self,
        table: &str,
        id: &EntityId,
        relations: &[String],
    ) -> StorageResult<Option<Record>>;

    /// Loads the first row whose columns equal every scalar in `fields`.
    ///
    /// Used when a change notification carries only the changed fields and
    /// no id. Non-scalar fields are ignored; an empty filter matches nothing.
    async fn find_matching(&self, table: &str, fields: &Record) -> StorageResult<Option<Record>>;

    /// Loads one raw row, without relations, by the key a change feed
    /// reported it under. Association tables often have no `id` column, so
    /// stores with a physical row key look it up by that key instead.
    async fn find_row(&self, table: &str, key: &EntityId) -> StorageResult<Option<Record>> {
        self.find_one(table, key, &[]).await
    }
}

/// Synchronous row access both stores implement; relation loading is
/// written once on top of it.
pub(crate) trait RowSource {
    fn row_by_id(&self, table: &str, id: &str) -> StorageResult<Option<Record>>;
    fn rows_where(&self, table: &str, column: &str, value: &str) -> StorageResult<Vec<Record>>;
    fn first_matching(&self, table: &str, fields: &[(String, Value)]) -> StorageResult<Option<Record>>;
}

/// String key of a scalar id or foreign-key value.
pub(crate) fn key_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// The scalar, non-null fields of a filter record.
pub(crate) fn scalar_filter(fields: &Record) -> Vec<(String, Value)> {
    fields
        .iter()
        .filter(|(_, v)| matches!(v, Value::String(_) | Value::Number(_) | Value::Bool(_)))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

pub(crate) fn find_with_relations<S: RowSource>(
    source: &S,
    relations: &RelationMap,
    table: &str,
    id: &str,
    paths: &[String],
) -> StorageResult<Option<Record>> {
    match source.row_by_id(table, id)? {
        Some(mut row) => {
            load_relations(source, relations, table, &mut row, paths)?;
            Ok(Some(row))
        }
        None => Ok(None),
    }
}

fn load_relations<S: RowSource>(
    source: &S,
    relations: &RelationMap,
    table: &str,
    row: &mut Record,
    paths: &[String],
) -> StorageResult<()> {
    let own_id = row.get("id").and_then(key_of);

    for (head, nested) in split_paths(paths) {
        let relation = relations
            .get(table, &head)
            .ok_or_else(|| StorageError::UnknownRelation {
                table: table.to_string(),
                relation: head.clone(),
            })?;
        let target = relation.target();

        let value = match relation {
            Relation::BelongsTo { foreign_key, .. } => {
                let related = match row.get(foreign_key).and_then(key_of) {
                    Some(fk) => source.row_by_id(target, &fk)?,
                    None => None,
                };
                match related {
                    Some(mut related) => {
                        load_relations(source, relations, target, &mut related, &nested)?;
                        Value::Object(related)
                    }
                    None => Value::Null,
                }
            }
            Relation::HasMany { foreign_key, .. } => {
                let mut items = Vec::new();
                if let Some(id) = &own_id {
                    for mut related in source.rows_where(target, foreign_key, id)? {
                        load_relations(source, relations, target, &mut related, &nested)?;
                        items.push(Value::Object(related));
                    }
                }
                Value::Array(items)
            }
            Relation::ManyToMany {
                junction,
                local_key,
                foreign_key,
                ..
            } => {
                let mut items = Vec::new();
                if let Some(id) = &own_id {
                    for link in source.rows_where(junction, local_key, id)? {
                        let Some(fk) = link.get(foreign_key).and_then(key_of) else {
                            continue;
                        };
                        if let Some(mut related) = source.row_by_id(target, &fk)? {
                            load_relations(source, relations, target, &mut related, &nested)?;
                            items.push(Value::Object(related));
                        }
                    }
                }
                Value::Array(items)
            }
        };
        row.insert(head, value);
    }
    Ok(())
}
