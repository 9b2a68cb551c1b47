//! Engine-side databases.

use qbridge_protocol::{DatabaseInfo, DatabaseMetadata, ObjectStoreOptions};
use std::collections::BTreeMap;

use crate::store::ObjectStore;
use crate::EngineError;

/// State captured when a version change begins, restored if it aborts.
#[derive(Debug, Clone)]
struct UpgradeSnapshot {
    version: u64,
    stores: BTreeMap<String, ObjectStore>,
    /// Transaction allowed to end the change. `None` lets the first one to end claim it.
    owner: Option<u64>,
}

/// A database.
#[derive(Debug)]
pub struct Database {
    /// Database name.
    pub name: String,

    /// Version.
    pub version: u64,

    /// Object stores.
    stores: BTreeMap<String, ObjectStore>,

    /// Present while a version change is uncommitted.
    upgrade: Option<UpgradeSnapshot>,
}

impl Database {
    /// Create a new database.
    pub fn new(name: &str, version: u64) -> Self {
        Self {
            name: name.to_string(),
            version,
            stores: BTreeMap::new(),
            upgrade: None,
        }
    }

    pub fn info(&self) -> DatabaseInfo {
        DatabaseInfo {
            name: self.name.clone(),
            version: self.version,
        }
    }

    pub fn metadata(&self) -> DatabaseMetadata {
        DatabaseMetadata {
            name: self.name.clone(),
            version: self.version,
            object_stores: self
                .stores
                .iter()
                .map(|(name, store)| (name.clone(), store.metadata()))
                .collect(),
        }
    }

    /// Get object store names.
    pub fn object_store_names(&self) -> Vec<&str> {
        self.stores.keys().map(|s| s.as_str()).collect()
    }

    pub fn in_upgrade(&self) -> bool {
        self.upgrade.is_some()
    }

    /// Move to `version`, remembering the current state until `owner` ends the change.
    pub fn begin_upgrade(&mut self, version: u64, owner: Option<u64>) {
        if self.upgrade.is_none() {
            self.upgrade = Some(UpgradeSnapshot {
                version: self.version,
                stores: self.stores.clone(),
                owner,
            });
        }
        self.version = version;
    }

    /// Transaction that owns the version change in progress.
    pub fn upgrade_owner(&self) -> Option<u64> {
        self.upgrade.as_ref().and_then(|snapshot| snapshot.owner)
    }

    fn take_upgrade(&mut self, transaction: u64) -> Option<UpgradeSnapshot> {
        match &self.upgrade {
            Some(snapshot) if snapshot.owner.map_or(true, |owner| owner == transaction) => {
                self.upgrade.take()
            }
            _ => None,
        }
    }

    /// Keep the upgraded state if `transaction` owns it. Returns whether it did.
    pub fn commit_upgrade(&mut self, transaction: u64) -> bool {
        self.take_upgrade(transaction).is_some()
    }

    /// Restore the state from before the upgrade if `transaction` owns it.
    /// Returns whether it did.
    pub fn rollback_upgrade(&mut self, transaction: u64) -> bool {
        match self.take_upgrade(transaction) {
            Some(snapshot) => {
                self.version = snapshot.version;
                self.stores = snapshot.stores;
                true
            }
            None => false,
        }
    }

    fn require_upgrade(&self) -> Result<(), EngineError> {
        if self.in_upgrade() {
            Ok(())
        } else {
            Err(EngineError::InvalidState(format!(
                "Database {} is not in a version change",
                self.name
            )))
        }
    }

    /// Create object store (only during a version change).
    pub fn create_object_store(
        &mut self,
        name: &str,
        options: &ObjectStoreOptions,
    ) -> Result<(), EngineError> {
        self.require_upgrade()?;
        if self.stores.contains_key(name) {
            return Err(EngineError::Constraint(format!(
                "Object store already exists: {}",
                name
            )));
        }

        self.stores.insert(name.to_string(), ObjectStore::new(options));
        Ok(())
    }

    /// Delete object store (only during a version change).
    pub fn delete_object_store(&mut self, name: &str) -> Result<(), EngineError> {
        self.require_upgrade()?;
        self.stores
            .remove(name)
            .ok_or_else(|| EngineError::NotFound(format!("Object store not found: {}", name)))?;
        Ok(())
    }

    /// Get object store.
    pub fn object_store(&self, name: &str) -> Result<&ObjectStore, EngineError> {
        self.stores
            .get(name)
            .ok_or_else(|| EngineError::NotFound(format!("Object store not found: {}", name)))
    }

    /// Get object store mutably.
    pub fn object_store_mut(&mut self, name: &str) -> Result<&mut ObjectStore, EngineError> {
        self.stores
            .get_mut(name)
            .ok_or_else(|| EngineError::NotFound(format!("Object store not found: {}", name)))
    }

    /// Get object store mutably for a schema change (only during a version change).
    pub fn object_store_for_schema(&mut self, name: &str) -> Result<&mut ObjectStore, EngineError> {
        self.require_upgrade()?;
        self.object_store_mut(name)
    }
}
