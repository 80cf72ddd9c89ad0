//! Database, store and index descriptions.
//!
//! A [`DatabaseSchema`] lists the object stores a back-end must provide.
//! Each [`StoreSchema`] names the in-line primary key path of its records
//! and the secondary indexes maintained over them.
//!
//! # Example
//!
//! ```
//! use cursordb_storage::{DatabaseSchema, IndexSchema, StoreSchema};
//!
//! let schema = DatabaseSchema::new(vec![
//!     StoreSchema::new("articles", "id")
//!         .with_index(IndexSchema::new("type", "type"))
//!         .with_index(IndexSchema::compound("type, created", ["type", "created"])),
//! ]);
//! assert!(schema.store("articles").is_some_and(|s| s.has_index("type")));
//! ```

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::{DbError, DbResult},
    key::Key,
};

/// Reads a dotted path (`"author.name"`) out of a JSON record.
#[must_use]
pub fn get_path<'a>(record: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(record, |value, segment| value.get(segment))
}

/// Writes `value` at a dotted path, creating intermediate objects.
///
/// # Errors
///
/// Returns [`DbError::Argument`] if an intermediate segment is not an object.
pub fn set_path(record: &mut Value, path: &str, value: Value) -> DbResult<()> {
    let mut segments = path.split('.').peekable();
    let mut current = record;
    while let Some(segment) = segments.next() {
        let object = current
            .as_object_mut()
            .ok_or_else(|| DbError::argument(format!("cannot set '{path}' on a non-object")))?;
        if segments.peek().is_none() {
            object.insert(segment.to_owned(), value);
            return Ok(());
        }
        current = object
            .entry(segment.to_owned())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
    }
    Ok(())
}

/// Description of a secondary index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSchema {
    /// Index name, used by queries to select the index.
    pub name: String,
    /// Field paths that make up the index key. More than one path forms a
    /// compound index whose keys are arrays.
    pub key_path: Vec<String>,
    /// Reject records whose index key is already present.
    #[serde(default)]
    pub unique: bool,
    /// Index every element of an array-valued field separately.
    #[serde(default)]
    pub multi_entry: bool,
}

impl IndexSchema {
    /// Single-field index.
    pub fn new(name: impl Into<String>, key_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key_path: vec![key_path.into()],
            unique: false,
            multi_entry: false,
        }
    }

    /// Compound index over several fields.
    pub fn compound<I, S>(name: impl Into<String>, key_path: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            key_path: key_path.into_iter().map(Into::into).collect(),
            unique: false,
            multi_entry: false,
        }
    }

    /// Marks the index unique.
    #[must_use]
    pub fn unique(mut self, unique: bool) -> Self {
        self.unique = unique;
        self
    }

    /// Marks the index multi-entry.
    #[must_use]
    pub fn multi_entry(mut self, multi_entry: bool) -> Self {
        self.multi_entry = multi_entry;
        self
    }

    /// Returns `true` for compound indexes.
    #[must_use]
    pub fn is_compound(&self) -> bool {
        self.key_path.len() > 1
    }

    /// Extracts the index keys for `record`.
    ///
    /// Records missing any component of the key path, or holding a value
    /// that is not a valid key, are not indexed and yield no keys. A
    /// multi-entry index yields one key per valid array element.
    #[must_use]
    pub fn extract_keys(&self, record: &Value) -> Vec<Key> {
        if self.is_compound() {
            let parts: Option<Vec<Key>> = self
                .key_path
                .iter()
                .map(|path| get_path(record, path).and_then(Key::from_json))
                .collect();
            return parts.map(Key::Array).into_iter().collect();
        }
        let Some(value) = self.key_path.first().and_then(|path| get_path(record, path)) else {
            return Vec::new();
        };
        match value {
            Value::Array(items) if self.multi_entry => {
                let mut keys: Vec<Key> = items.iter().filter_map(Key::from_json).collect();
                keys.sort();
                keys.dedup();
                keys
            },
            other => Key::from_json(other).into_iter().collect(),
        }
    }
}

/// Description of an object store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSchema {
    /// Store name.
    pub name: String,
    /// Dotted path of the in-line primary key.
    pub key_path: String,
    /// Secondary indexes.
    #[serde(default)]
    pub indexes: Vec<IndexSchema>,
}

impl StoreSchema {
    /// Store with an in-line primary key at `key_path`.
    pub fn new(name: impl Into<String>, key_path: impl Into<String>) -> Self {
        Self { name: name.into(), key_path: key_path.into(), indexes: Vec::new() }
    }

    /// Adds an index.
    #[must_use]
    pub fn with_index(mut self, index: IndexSchema) -> Self {
        self.indexes.push(index);
        self
    }

    /// Looks up an index by name.
    #[must_use]
    pub fn index(&self, name: &str) -> Option<&IndexSchema> {
        self.indexes.iter().find(|i| i.name == name)
    }

    /// Returns `true` if the store has an index called `name`.
    #[must_use]
    pub fn has_index(&self, name: &str) -> bool {
        self.index(name).is_some()
    }

    /// Finds the index whose key path is exactly `key_path`.
    #[must_use]
    pub fn index_by_key_path(&self, key_path: &[&str]) -> Option<&IndexSchema> {
        self.indexes
            .iter()
            .find(|i| i.key_path.iter().map(String::as_str).eq(key_path.iter().copied()))
    }

    /// Returns `true` if `field` names the primary key.
    #[must_use]
    pub fn is_primary_key(&self, field: &str) -> bool {
        self.key_path == field
    }

    /// Extracts the primary key of `record`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Argument`] if the record has no valid key at the
    /// store's key path.
    pub fn extract_primary_key(&self, record: &Value) -> DbResult<Key> {
        get_path(record, &self.key_path).and_then(Key::from_json).ok_or_else(|| {
            DbError::argument(format!(
                "record has no valid primary key at '{}' for store '{}'",
                self.key_path, self.name
            ))
        })
    }
}

/// The set of stores a database provides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseSchema {
    /// Object stores.
    pub stores: Vec<Arc<StoreSchema>>,
}

impl DatabaseSchema {
    /// Schema holding `stores`.
    pub fn new(stores: Vec<StoreSchema>) -> Self {
        Self { stores: stores.into_iter().map(Arc::new).collect() }
    }

    /// Looks up a store by name.
    #[must_use]
    pub fn store(&self, name: &str) -> Option<&Arc<StoreSchema>> {
        self.stores.iter().find(|s| s.name == name)
    }

    /// Looks up a store by name, failing with [`DbError::Argument`].
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Argument`] if no store is called `name`.
    pub fn require_store(&self, name: &str) -> DbResult<&Arc<StoreSchema>> {
        self.store(name).ok_or_else(|| DbError::argument(format!("store '{name}' not found")))
    }
}
