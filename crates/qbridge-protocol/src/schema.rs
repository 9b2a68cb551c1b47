//! Schema types shared by the client cache and the engine.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

/// Key path for object stores and indexes.
///
/// On the wire: `null`, a string, or an array of strings.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyPath {
    /// No key path (out-of-line keys).
    #[default]
    None,
    /// Single property path, dotted for nesting. `""` is the value itself.
    Single(String),
    /// Multiple properties (compound key).
    Multiple(Vec<String>),
}

impl KeyPath {
    /// Whether the store keeps keys inside its values.
    pub fn is_inline(&self) -> bool {
        !matches!(self, KeyPath::None)
    }

    /// Extract key from value.
    pub fn extract(&self, value: &JsonValue) -> Option<JsonValue> {
        match self {
            KeyPath::None => None,
            KeyPath::Single(path) => lookup(value, path).cloned(),
            KeyPath::Multiple(paths) => {
                let keys: Vec<JsonValue> = paths
                    .iter()
                    .filter_map(|p| lookup(value, p).cloned())
                    .collect();
                if keys.len() == paths.len() {
                    Some(JsonValue::Array(keys))
                } else {
                    None
                }
            }
        }
    }
}

impl From<&str> for KeyPath {
    fn from(path: &str) -> Self {
        KeyPath::Single(path.to_string())
    }
}

impl From<Vec<&str>> for KeyPath {
    fn from(paths: Vec<&str>) -> Self {
        KeyPath::Multiple(paths.into_iter().map(str::to_string).collect())
    }
}

fn lookup<'a>(value: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.').try_fold(value, |current, segment| current.get(segment))
}

/// Transaction mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
    VersionChange,
}

impl Default for TransactionMode {
    fn default() -> Self {
        Self::ReadOnly
    }
}

/// Cursor direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CursorDirection {
    Next,
    NextUnique,
    Prev,
    PrevUnique,
}

impl Default for CursorDirection {
    fn default() -> Self {
        Self::Next
    }
}

impl CursorDirection {
    pub fn is_reverse(self) -> bool {
        matches!(self, CursorDirection::Prev | CursorDirection::PrevUnique)
    }

    pub fn is_unique(self) -> bool {
        matches!(self, CursorDirection::NextUnique | CursorDirection::PrevUnique)
    }
}

/// Options for `createObjectStore`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ObjectStoreOptions {
    pub key_path: KeyPath,
    pub auto_increment: bool,
}

impl ObjectStoreOptions {
    /// In-line keys read from `path`.
    pub fn key_path(path: impl Into<KeyPath>) -> Self {
        Self {
            key_path: path.into(),
            auto_increment: false,
        }
    }

    /// Out-of-line keys generated by the engine.
    pub fn auto_increment() -> Self {
        Self {
            key_path: KeyPath::None,
            auto_increment: true,
        }
    }
}

/// Options for `createIndex`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IndexOptions {
    pub unique: bool,
    pub multi_entry: bool,
}

/// Cached description of an index.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IndexMetadata {
    pub key_path: KeyPath,
    pub unique: bool,
    pub multi_entry: bool,
}

/// Cached description of an object store.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreMetadata {
    pub key_path: KeyPath,
    pub auto_increment: bool,
    pub indexes: BTreeMap<String, IndexMetadata>,
}

impl StoreMetadata {
    pub fn from_options(options: &ObjectStoreOptions) -> Self {
        Self {
            key_path: options.key_path.clone(),
            auto_increment: options.auto_increment,
            indexes: BTreeMap::new(),
        }
    }

    /// Sorted index names.
    pub fn index_names(&self) -> Vec<String> {
        self.indexes.keys().cloned().collect()
    }
}

/// Cached description of a database.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DatabaseMetadata {
    pub name: String,
    pub version: u64,
    pub object_stores: BTreeMap<String, StoreMetadata>,
}

impl DatabaseMetadata {
    pub fn new(name: impl Into<String>, version: u64) -> Self {
        Self {
            name: name.into(),
            version,
            object_stores: BTreeMap::new(),
        }
    }

    /// Sorted object store names.
    pub fn store_names(&self) -> Vec<String> {
        self.object_stores.keys().cloned().collect()
    }
}

/// Database info for `databases()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseInfo {
    pub name: String,
    pub version: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_path_single() {
        let path = KeyPath::Single("id".to_string());
        let value = json!({"id": 42, "name": "test"});

        let key = path.extract(&value).unwrap();
        assert_eq!(key, json!(42));
    }

    #[test]
    fn test_key_path_nested() {
        let path = KeyPath::from("meta.id");
        assert_eq!(path.extract(&json!({"meta": {"id": "x"}})), Some(json!("x")));
        assert_eq!(path.extract(&json!({"meta": 1})), None);
    }

    #[test]
    fn test_key_path_empty_is_whole_value() {
        assert_eq!(KeyPath::from("").extract(&json!("k")), Some(json!("k")));
    }

    #[test]
    fn test_key_path_multiple() {
        let path = KeyPath::from(vec!["a", "b"]);
        let value = json!({"a": 1, "b": 2});

        let key = path.extract(&value).unwrap();
        assert_eq!(key, json!([1, 2]));
        assert_eq!(path.extract(&json!({"a": 1})), None);
    }

    #[test]
    fn test_key_path_wire() {
        assert_eq!(serde_json::to_value(KeyPath::None).unwrap(), json!(null));
        assert_eq!(serde_json::to_value(KeyPath::from("id")).unwrap(), json!("id"));
        let multi: KeyPath = serde_json::from_value(json!(["a", "b"])).unwrap();
        assert_eq!(multi, KeyPath::from(vec!["a", "b"]));
        let none: KeyPath = serde_json::from_value(json!(null)).unwrap();
        assert_eq!(none, KeyPath::None);
    }

    #[test]
    fn test_metadata_decodes_sparse_payload() {
        let meta: DatabaseMetadata = serde_json::from_value(json!({
            "name": "Notes",
            "version": 2,
            "objectStores": {
                "items": {"keyPath": "id", "indexes": {"by_text": {"keyPath": "text", "unique": true}}}
            }
        }))
        .unwrap();
        assert_eq!(meta.store_names(), vec!["items".to_string()]);
        let items = &meta.object_stores["items"];
        assert!(!items.auto_increment);
        assert!(items.indexes["by_text"].unique);
        assert!(!items.indexes["by_text"].multi_entry);
    }

    #[test]
    fn test_mode_and_direction_wire_names() {
        assert_eq!(serde_json::to_value(TransactionMode::ReadWrite).unwrap(), json!("readwrite"));
        assert_eq!(serde_json::to_value(CursorDirection::PrevUnique).unwrap(), json!("prevunique"));
        assert!(CursorDirection::Prev.is_reverse());
        assert!(!CursorDirection::Next.is_unique());
    }
}
