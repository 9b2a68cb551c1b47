//! Object stores and their indexes.

use qbridge_protocol::{
    compare, CursorDirection, CursorRecord, IndexMetadata, IndexOptions, KeyPath,
    ObjectStoreOptions, OrderedKey, Query, StoreMetadata,
};
use serde_json::Value as JsonValue;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use crate::EngineError;

/// Translate a `count` argument into an iterator limit. Zero means no limit.
fn limit(count: Option<u32>) -> usize {
    match count {
        None | Some(0) => usize::MAX,
        Some(n) => n as usize,
    }
}

fn check_query(query: Option<&Query>) -> Result<(), EngineError> {
    match query {
        Some(q) => q.validate().map_err(EngineError::from),
        None => Ok(()),
    }
}

fn matches(query: Option<&Query>, key: &OrderedKey) -> bool {
    query.map_or(true, |q| q.matches(key.as_json()))
}

// ==================== Index ====================

/// An index on an object store.
#[derive(Debug, Clone)]
pub struct Index {
    /// Key path.
    pub key_path: KeyPath,

    /// Whether keys must be unique.
    pub unique: bool,

    /// Multi-entry (for array values).
    pub multi_entry: bool,

    /// Entries (index key -> primary keys).
    entries: BTreeMap<OrderedKey, BTreeSet<OrderedKey>>,
}

impl Index {
    /// Create a new index.
    pub fn new(key_path: KeyPath, options: IndexOptions) -> Self {
        Self {
            key_path,
            unique: options.unique,
            multi_entry: options.multi_entry,
            entries: BTreeMap::new(),
        }
    }

    pub fn metadata(&self) -> IndexMetadata {
        IndexMetadata {
            key_path: self.key_path.clone(),
            unique: self.unique,
            multi_entry: self.multi_entry,
        }
    }

    /// Index keys contributed by `value`. Values without a valid key are skipped.
    fn keys_for(&self, value: &JsonValue) -> Vec<OrderedKey> {
        match self.key_path.extract(value) {
            None => Vec::new(),
            Some(JsonValue::Array(items)) if self.multi_entry => items
                .into_iter()
                .filter_map(|item| OrderedKey::new(item).ok())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect(),
            Some(key) => OrderedKey::new(key).ok().into_iter().collect(),
        }
    }

    fn check_unique(&self, keys: &[OrderedKey], primary: &OrderedKey) -> Result<(), EngineError> {
        if !self.unique {
            return Ok(());
        }
        for key in keys {
            if let Some(owners) = self.entries.get(key) {
                if owners.iter().any(|owner| owner != primary) {
                    return Err(EngineError::Constraint(format!(
                        "Duplicate key in unique index: {}",
                        key.as_json()
                    )));
                }
            }
        }
        Ok(())
    }

    fn add_entries(&mut self, keys: Vec<OrderedKey>, primary: &OrderedKey) {
        for key in keys {
            self.entries.entry(key).or_default().insert(primary.clone());
        }
    }

    fn delete_entries(&mut self, keys: Vec<OrderedKey>, primary: &OrderedKey) {
        for key in keys {
            if let Some(owners) = self.entries.get_mut(&key) {
                owners.remove(primary);
                if owners.is_empty() {
                    self.entries.remove(&key);
                }
            }
        }
    }

    /// `(index key, primary key)` pairs in index order.
    fn select<'a>(
        &'a self,
        query: Option<&'a Query>,
    ) -> impl Iterator<Item = (&'a OrderedKey, &'a OrderedKey)> + 'a {
        self.entries
            .iter()
            .filter(move |(key, _)| matches(query, key))
            .flat_map(|(key, owners)| owners.iter().map(move |primary| (key, primary)))
    }
}

// ==================== ObjectStore ====================

/// An object store.
#[derive(Debug, Clone)]
pub struct ObjectStore {
    /// Key path.
    pub key_path: KeyPath,

    /// Auto-increment.
    pub auto_increment: bool,

    /// Records in key order.
    records: BTreeMap<OrderedKey, JsonValue>,

    /// Indexes.
    indexes: BTreeMap<String, Index>,

    /// Next auto-increment key.
    next_key: u64,
}

impl ObjectStore {
    /// Create a new object store.
    pub fn new(options: &ObjectStoreOptions) -> Self {
        Self {
            key_path: options.key_path.clone(),
            auto_increment: options.auto_increment,
            records: BTreeMap::new(),
            indexes: BTreeMap::new(),
            next_key: 1,
        }
    }

    pub fn metadata(&self) -> StoreMetadata {
        StoreMetadata {
            key_path: self.key_path.clone(),
            auto_increment: self.auto_increment,
            indexes: self
                .indexes
                .iter()
                .map(|(name, index)| (name.clone(), index.metadata()))
                .collect(),
        }
    }

    /// Add a record (fails if key exists). Returns the primary key.
    pub fn add(&mut self, value: JsonValue, key: Option<JsonValue>) -> Result<JsonValue, EngineError> {
        self.write(value, key, false)
    }

    /// Put a record (overwrites if exists). Returns the primary key.
    pub fn put(&mut self, value: JsonValue, key: Option<JsonValue>) -> Result<JsonValue, EngineError> {
        self.write(value, key, true)
    }

    fn write(
        &mut self,
        mut value: JsonValue,
        key: Option<JsonValue>,
        overwrite: bool,
    ) -> Result<JsonValue, EngineError> {
        let primary = self.resolve_key(&mut value, key)?;

        if !overwrite && self.records.contains_key(&primary) {
            return Err(EngineError::Constraint(format!(
                "Key already exists: {}",
                primary.as_json()
            )));
        }

        let mut new_entries = Vec::with_capacity(self.indexes.len());
        for (name, index) in &self.indexes {
            let keys = index.keys_for(&value);
            index.check_unique(&keys, &primary)?;
            new_entries.push((name.clone(), keys));
        }

        if let Some(old) = self.records.get(&primary) {
            for index in self.indexes.values_mut() {
                let keys = index.keys_for(old);
                index.delete_entries(keys, &primary);
            }
        }
        for (name, keys) in new_entries {
            if let Some(index) = self.indexes.get_mut(&name) {
                index.add_entries(keys, &primary);
            }
        }

        self.bump_generator(primary.as_json());
        let key = primary.as_json().clone();
        self.records.insert(primary, value);
        Ok(key)
    }

    /// Resolve the primary key from an explicit key, the key path, or the generator.
    fn resolve_key(
        &mut self,
        value: &mut JsonValue,
        key: Option<JsonValue>,
    ) -> Result<OrderedKey, EngineError> {
        let key = match (key, self.key_path.is_inline()) {
            (Some(k), false) => k,
            (Some(k), true) => match self.key_path.extract(value) {
                Some(found) if compare(&found, &k).ok() == Some(Ordering::Equal) => k,
                Some(_) => {
                    return Err(EngineError::Data(
                        "Key does not match the value at the key path".to_string(),
                    ))
                }
                None if self.auto_increment => {
                    self.inject(value, k.clone())?;
                    k
                }
                None => {
                    return Err(EngineError::Data(
                        "Could not extract key from value".to_string(),
                    ))
                }
            },
            (None, true) => match self.key_path.extract(value) {
                Some(found) => found,
                None if self.auto_increment => {
                    let generated = self.generate();
                    self.inject(value, generated.clone())?;
                    generated
                }
                None => {
                    return Err(EngineError::Data(
                        "Could not extract key from value".to_string(),
                    ))
                }
            },
            (None, false) if self.auto_increment => self.generate(),
            (None, false) => {
                return Err(EngineError::Data(
                    "No key provided and no auto-increment".to_string(),
                ))
            }
        };
        OrderedKey::new(key).map_err(EngineError::from)
    }

    fn generate(&mut self) -> JsonValue {
        let key = self.next_key;
        self.next_key += 1;
        JsonValue::from(key)
    }

    fn bump_generator(&mut self, key: &JsonValue) {
        if !self.auto_increment {
            return;
        }
        if let Some(n) = key.as_f64() {
            if n >= self.next_key as f64 {
                self.next_key = n.floor() as u64 + 1;
            }
        }
    }

    /// Write a generated key into the value at a single key path.
    fn inject(&self, value: &mut JsonValue, key: JsonValue) -> Result<(), EngineError> {
        let path = match &self.key_path {
            KeyPath::Single(path) if !path.is_empty() => path,
            _ => {
                return Err(EngineError::Data(
                    "Generated keys need a single key path".to_string(),
                ))
            }
        };
        let mut segments = path.split('.').peekable();
        let mut current = value;
        while let Some(segment) = segments.next() {
            let obj = match current {
                JsonValue::Object(obj) => obj,
                _ => {
                    return Err(EngineError::Data(format!(
                        "Cannot inject key at {}: not an object",
                        path
                    )))
                }
            };
            if segments.peek().is_none() {
                obj.insert(segment.to_string(), key);
                return Ok(());
            }
            current = obj
                .entry(segment.to_string())
                .or_insert_with(|| JsonValue::Object(Default::default()));
        }
        Ok(())
    }

    fn select<'a>(
        &'a self,
        query: Option<&'a Query>,
    ) -> impl Iterator<Item = (&'a OrderedKey, &'a JsonValue)> + 'a {
        self.records.iter().filter(move |(key, _)| matches(query, key))
    }

    /// Get the first record matching a query.
    pub fn get(&self, query: &Query) -> Result<Option<JsonValue>, EngineError> {
        check_query(Some(query))?;
        Ok(self.select(Some(query)).next().map(|(_, v)| v.clone()))
    }

    /// Get all matching values.
    pub fn get_all(&self, query: Option<&Query>, count: Option<u32>) -> Result<Vec<JsonValue>, EngineError> {
        check_query(query)?;
        Ok(self
            .select(query)
            .take(limit(count))
            .map(|(_, v)| v.clone())
            .collect())
    }

    /// Get all matching primary keys.
    pub fn get_all_keys(
        &self,
        query: Option<&Query>,
        count: Option<u32>,
    ) -> Result<Vec<JsonValue>, EngineError> {
        check_query(query)?;
        Ok(self
            .select(query)
            .take(limit(count))
            .map(|(k, _)| k.as_json().clone())
            .collect())
    }

    /// Delete every record matching a query. Returns how many were removed.
    pub fn delete(&mut self, query: &Query) -> Result<usize, EngineError> {
        check_query(Some(query))?;
        let doomed: Vec<OrderedKey> = self.select(Some(query)).map(|(k, _)| k.clone()).collect();
        for primary in &doomed {
            if let Some(old) = self.records.remove(primary) {
                for index in self.indexes.values_mut() {
                    let keys = index.keys_for(&old);
                    index.delete_entries(keys, primary);
                }
            }
        }
        Ok(doomed.len())
    }

    /// Clear all records.
    pub fn clear(&mut self) {
        self.records.clear();
        for index in self.indexes.values_mut() {
            index.entries.clear();
        }
    }

    /// Count matching records.
    pub fn count(&self, query: Option<&Query>) -> Result<u64, EngineError> {
        check_query(query)?;
        Ok(self.select(query).count() as u64)
    }

    /// Create an index and populate it from existing records.
    pub fn create_index(
        &mut self,
        name: &str,
        key_path: KeyPath,
        options: IndexOptions,
    ) -> Result<(), EngineError> {
        if self.indexes.contains_key(name) {
            return Err(EngineError::Constraint(format!(
                "Index already exists: {}",
                name
            )));
        }

        let mut index = Index::new(key_path, options);
        for (primary, value) in &self.records {
            let keys = index.keys_for(value);
            index.check_unique(&keys, primary)?;
            index.add_entries(keys, primary);
        }

        self.indexes.insert(name.to_string(), index);
        Ok(())
    }

    /// Delete an index.
    pub fn delete_index(&mut self, name: &str) -> Result<(), EngineError> {
        self.indexes
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| EngineError::NotFound(format!("Index not found: {}", name)))
    }

    /// Get an index.
    pub fn index(&self, name: &str) -> Result<&Index, EngineError> {
        self.indexes
            .get(name)
            .ok_or_else(|| EngineError::NotFound(format!("Index not found: {}", name)))
    }

    /// Index names.
    pub fn index_names(&self) -> Vec<&str> {
        self.indexes.keys().map(|s| s.as_str()).collect()
    }

    /// First record whose index key matches.
    pub fn index_get(&self, index: &str, query: &Query) -> Result<Option<JsonValue>, EngineError> {
        check_query(Some(query))?;
        let index = self.index(index)?;
        Ok(index
            .select(Some(query))
            .next()
            .and_then(|(_, primary)| self.records.get(primary).cloned()))
    }

    /// All records whose index key matches, in index order.
    pub fn index_get_all(
        &self,
        index: &str,
        query: Option<&Query>,
        count: Option<u32>,
    ) -> Result<Vec<JsonValue>, EngineError> {
        check_query(query)?;
        let index = self.index(index)?;
        Ok(index
            .select(query)
            .filter_map(|(_, primary)| self.records.get(primary).cloned())
            .take(limit(count))
            .collect())
    }

    /// Count index entries matching a query.
    pub fn index_count(&self, index: &str, query: Option<&Query>) -> Result<u64, EngineError> {
        check_query(query)?;
        let index = self.index(index)?;
        Ok(index.select(query).count() as u64)
    }

    /// Materialize the records a cursor walks over, in walk order.
    pub fn cursor_records(
        &self,
        index: Option<&str>,
        query: Option<&Query>,
        direction: CursorDirection,
        key_only: bool,
    ) -> Result<Vec<CursorRecord>, EngineError> {
        check_query(query)?;
        let value_of = |primary: &OrderedKey| {
            if key_only {
                None
            } else {
                self.records.get(primary).cloned()
            }
        };

        let mut records = match index {
            None => self
                .select(query)
                .map(|(primary, _)| CursorRecord {
                    key: primary.as_json().clone(),
                    primary_key: None,
                    value: value_of(primary),
                })
                .collect::<Vec<_>>(),
            Some(name) => {
                let index = self.index(name)?;
                let mut out = Vec::new();
                let mut last: Option<&OrderedKey> = None;
                for (key, primary) in index.select(query) {
                    if direction.is_unique() && last == Some(key) {
                        continue;
                    }
                    last = Some(key);
                    out.push(CursorRecord {
                        key: key.as_json().clone(),
                        primary_key: Some(primary.as_json().clone()),
                        value: value_of(primary),
                    });
                }
                out
            }
        };

        if direction.is_reverse() {
            records.reverse();
        }
        Ok(records)
    }
}
