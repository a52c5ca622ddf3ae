//! Relation declarations shared by the record stores.
//!
//! Stores know nothing about an ORM. A table's associations are declared up
//! front and resolved by name when a caller asks for `relations`, the same
//! way `findOne({ where: { id }, relations: [...] })` would.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One association from a table to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Relation {
    /// `row[foreign_key]` holds the id of a single row in `table`.
    BelongsTo {
        name: String,
        table: String,
        foreign_key: String,
    },
    /// Rows in `table` whose `foreign_key` equals this row's id.
    HasMany {
        name: String,
        table: String,
        foreign_key: String,
    },
    /// Rows in `table` linked through `junction`: junction rows with
    /// `local_key` equal to this row's id point at targets via `foreign_key`.
    ManyToMany {
        name: String,
        table: String,
        junction: String,
        local_key: String,
        foreign_key: String,
    },
}

impl Relation {
    /// Name under which the related rows are nested.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::BelongsTo { name, .. }
            | Self::HasMany { name, .. }
            | Self::ManyToMany { name, .. } => name,
        }
    }

    /// Table holding the related rows.
    #[must_use]
    pub fn target(&self) -> &str {
        match self {
            Self::BelongsTo { table, .. }
            | Self::HasMany { table, .. }
            | Self::ManyToMany { table, .. } => table,
        }
    }
}

/// Declared relations per table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelationMap {
    tables: HashMap<String, Vec<Relation>>,
}

impl RelationMap {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a relation on `table`.
    pub fn declare(&mut self, table: impl Into<String>, relation: Relation) -> &mut Self {
        self.tables.entry(table.into()).or_default().push(relation);
        self
    }

    /// Looks up a relation by name.
    #[must_use]
    pub fn get(&self, table: &str, name: &str) -> Option<&Relation> {
        self.tables.get(table)?.iter().find(|r| r.name() == name)
    }
}

/// Groups dotted relation paths by their first segment.
///
/// `["group", "group.members", "sender"]` becomes
/// `[("group", ["members"]), ("sender", [])]`, preserving first-seen order.
pub(crate) fn split_paths<S: AsRef<str>>(paths: &[S]) -> Vec<(String, Vec<String>)> {
    let mut grouped: Vec<(String, Vec<String>)> = Vec::new();
    for path in paths {
        let path = path.as_ref();
        let (head, rest) = match path.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (path, None),
        };
        let idx = match grouped.iter().position(|(h, _)| h == head) {
            Some(idx) => idx,
            None => {
                grouped.push((head.to_string(), Vec::new()));
                grouped.len() - 1
            }
        };
        if let Some(rest) = rest {
            grouped[idx].1.push(rest.to_string());
        }
    }
    grouped
}
