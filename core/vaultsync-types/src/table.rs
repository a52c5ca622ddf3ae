//! Routing table names.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lowercase plural name of an entity table or document collection.
///
/// The sink routes on the plural form, so every name that enters the engine
/// goes through [`TableName::pluralize`] once.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TableName(String);

impl TableName {
    /// Lowercases `raw` and appends `s` unless it already ends in one.
    pub fn pluralize(raw: &str) -> Result<Self, crate::Error> {
        let name = raw.trim().to_lowercase();
        if name.is_empty() {
            return Err(crate::Error::InvalidTable(raw.to_string()));
        }
        if name.ends_with('s') {
            Ok(Self(name))
        } else {
            Ok(Self(format!("{name}s")))
        }
    }

    /// Wraps a name that is already in routing form, lowercased but not
    /// pluralized (sink-side mapping files name their tables this way).
    pub fn raw(name: &str) -> Result<Self, crate::Error> {
        let name = name.trim().to_lowercase();
        if name.is_empty() {
            return Err(crate::Error::InvalidTable(name));
        }
        Ok(Self(name))
    }

    /// Singular form: the plural name with one trailing `s` removed.
    #[must_use]
    pub fn singular(&self) -> &str {
        self.0.strip_suffix('s').unwrap_or(&self.0)
    }

    /// Returns the plural name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TableName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for TableName {
    type Error = crate::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::pluralize(&value)
    }
}

impl From<TableName> for String {
    fn from(value: TableName) -> Self {
        value.0
    }
}
