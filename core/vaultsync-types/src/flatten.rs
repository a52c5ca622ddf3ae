//! Payload flattening.
//!
//! The sink accepts plain JSON. Records coming out of a store or an ORM may
//! carry bookkeeping fields (by convention prefixed with `_`), nested related
//! records and date-times. Flattening strips the private fields at every
//! depth; date-times are already ISO-8601 strings once serialized through
//! serde (`chrono::DateTime<Utc>` serializes that way).

use crate::{EntityId, Error, Record};
use serde::Serialize;
use serde_json::Value;

/// Field names tried, in order, when looking for a record's id.
pub const ID_ALIASES: [&str; 4] = ["id", "Id", "ID", "_id"];

/// Returns `value` with every object key starting with `_` removed,
/// recursing through nested objects and arrays.
#[must_use]
pub fn flatten_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(key, _)| !key.starts_with('_'))
                .map(|(key, v)| (key.clone(), flatten_value(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(flatten_value).collect()),
        other => other.clone(),
    }
}

/// Serializes `record` and flattens the result into a JSON object.
pub fn flatten_record<T: Serialize>(record: &T) -> Result<Record, Error> {
    match flatten_value(&serde_json::to_value(record)?) {
        Value::Object(map) => Ok(map),
        _ => Err(Error::NotAnObject),
    }
}

/// Reads the record's id through [`ID_ALIASES`].
///
/// String and integer ids are accepted; empty strings are treated as absent.
/// The `_id` alias is checked on the raw record, before flattening strips it.
#[must_use]
pub fn extract_id(record: &Record) -> Option<EntityId> {
    ID_ALIASES.iter().find_map(|alias| match record.get(*alias)? {
        Value::String(s) => EntityId::parse(s).ok(),
        Value::Number(n) => n.as_i64().map(EntityId::from),
        _ => None,
    })
}
