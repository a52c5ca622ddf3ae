//! The normalized unit of work flowing through the engine.
//!
//! A `ChangeEvent` is built fresh for every notification and discarded once
//! it has been dispatched or dropped. Constructors enforce the shape rules:
//! created/updated events always carry a flattened payload whose id matches
//! the event's id, removed events never carry one.

use crate::flatten::{extract_id, flatten_value};
use crate::{EntityId, Error, TableName};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// A flattened JSON record.
pub type Record = Map<String, Value>;

/// The kind of mutation observed on a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Created,
    Updated,
    Removed,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => f.write_str("created"),
            Self::Updated => f.write_str("updated"),
            Self::Removed => f.write_str("removed"),
        }
    }
}

/// A change ready for the guard and the sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    /// Local id of the changed record.
    pub entity_id: EntityId,
    /// Plural routing name.
    pub table_name: TableName,
    /// What happened.
    pub operation: Operation,
    /// Current field values. `None` only for removals.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Record>,
    /// Associated records attached during enrichment.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub relations: Record,
}

impl ChangeEvent {
    /// Builds a `created` event from a raw record.
    pub fn created(table_name: TableName, record: &Record) -> Result<Self, Error> {
        Self::with_payload(Operation::Created, table_name, record)
    }

    /// Builds an `updated` event from a raw (fully reloaded) record.
    pub fn updated(table_name: TableName, record: &Record) -> Result<Self, Error> {
        Self::with_payload(Operation::Updated, table_name, record)
    }

    /// Builds a `removed` event. Only the id and table survive a removal.
    #[must_use]
    pub fn removed(table_name: TableName, entity_id: EntityId) -> Self {
        Self {
            entity_id,
            table_name,
            operation: Operation::Removed,
            payload: None,
            relations: Map::new(),
        }
    }

    fn with_payload(
        operation: Operation,
        table_name: TableName,
        record: &Record,
    ) -> Result<Self, Error> {
        let entity_id = extract_id(record).ok_or(Error::MissingId)?;
        let payload = match flatten_value(&Value::Object(record.clone())) {
            Value::Object(mut map) => {
                // `_id` is stripped by flattening; keep the resolved id visible.
                map.insert("id".to_string(), Value::String(entity_id.to_string()));
                map
            }
            _ => return Err(Error::NotAnObject),
        };
        Ok(Self {
            entity_id,
            table_name,
            operation,
            payload: Some(payload),
            relations: Map::new(),
        })
    }

    /// Attaches an enrichment fragment under `name`.
    #[must_use]
    pub fn with_relation(mut self, name: impl Into<String>, fragment: Value) -> Self {
        self.relations.insert(name.into(), flatten_value(&fragment));
        self
    }

    /// The JSON object sent to the sink: payload fields with relation
    /// fragments merged on top, so the sink sees related records nested in
    /// place. Removals yield an object holding only the id.
    #[must_use]
    pub fn sink_data(&self) -> Record {
        let mut data = self.payload.clone().unwrap_or_else(|| {
            let mut m = Map::new();
            m.insert("id".to_string(), Value::String(self.entity_id.to_string()));
            m
        });
        for (name, fragment) in &self.relations {
            data.insert(name.clone(), fragment.clone());
        }
        data
    }
}
