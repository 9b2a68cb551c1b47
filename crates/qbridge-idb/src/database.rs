//! Open database connections and their schema cache.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::bridge::Bridge;
use crate::error::IdbError;
use crate::factory::IdbEvent;
use crate::request::{Request, RequestSource};
use crate::store::ObjectStore;
use crate::transaction::Transaction;
use qbridge_protocol::{
    Command, DatabaseMetadata, IndexMetadata, IndexOptions, KeyPath, ObjectStoreOptions,
    StoreMetadata, TransactionMode,
};

struct DatabaseState {
    /// Schema confirmed by the engine.
    metadata: DatabaseMetadata,
    /// Stores whose creation is in flight.
    pending_stores: BTreeMap<String, StoreMetadata>,
    /// Indexes whose creation is in flight, keyed by (store, index).
    pending_indexes: BTreeMap<(String, String), IndexMetadata>,
    upgrade: Option<Transaction>,
    open_transactions: usize,
    close_pending: bool,
    closed: bool,
}

/// Connection to an opened database.
#[derive(Clone)]
pub struct Database {
    state: Rc<RefCell<DatabaseState>>,
    bridge: Arc<Bridge>,
    events: mpsc::UnboundedSender<IdbEvent>,
}

impl Database {
    pub(crate) fn new(
        bridge: Arc<Bridge>,
        events: mpsc::UnboundedSender<IdbEvent>,
        metadata: DatabaseMetadata,
    ) -> Self {
        Self {
            state: Rc::new(RefCell::new(DatabaseState {
                metadata,
                pending_stores: BTreeMap::new(),
                pending_indexes: BTreeMap::new(),
                upgrade: None,
                open_transactions: 0,
                close_pending: false,
                closed: false,
            })),
            bridge,
            events,
        }
    }

    pub fn name(&self) -> String {
        self.state.borrow().metadata.name.clone()
    }

    pub fn version(&self) -> u64 {
        self.state.borrow().metadata.version
    }

    /// Sorted store names, including stores being created.
    pub fn object_store_names(&self) -> Vec<String> {
        let state = self.state.borrow();
        let names: BTreeSet<String> = state
            .metadata
            .object_stores
            .keys()
            .chain(state.pending_stores.keys())
            .cloned()
            .collect();
        names.into_iter().collect()
    }

    /// Snapshot of the cached schema.
    pub fn metadata(&self) -> DatabaseMetadata {
        self.state.borrow().metadata.clone()
    }

    /// The version change transaction, while one runs.
    pub fn upgrade_transaction(&self) -> Option<Transaction> {
        self.state.borrow().upgrade.clone()
    }

    pub fn is_closed(&self) -> bool {
        let state = self.state.borrow();
        state.closed || state.close_pending
    }

    /// Start a transaction over `stores`.
    pub fn transaction<I, S>(&self, stores: I, mode: TransactionMode) -> Result<Transaction, IdbError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if mode == TransactionMode::VersionChange {
            return Err(IdbError::InvalidAccess(
                "version change transactions are started by open".into(),
            ));
        }
        {
            let state = self.state.borrow();
            if state.closed || state.close_pending {
                return Err(IdbError::InvalidState("database connection is closing".into()));
            }
            if state.upgrade.is_some() {
                return Err(IdbError::InvalidState(
                    "a version change transaction is running".into(),
                ));
            }
        }

        let mut scope: Vec<String> = Vec::new();
        for name in stores {
            let name = name.into();
            if !scope.contains(&name) {
                scope.push(name);
            }
        }
        if scope.is_empty() {
            return Err(IdbError::InvalidAccess("transaction scope is empty".into()));
        }
        if let Some(missing) = scope.iter().find(|name| self.store_metadata(name).is_none()) {
            return Err(IdbError::NotFound(format!("object store not found: {}", missing)));
        }

        self.state.borrow_mut().open_transactions += 1;
        let tx = Transaction::new(self.clone(), mode, scope);
        let db = self.clone();
        tx.on_final(move |_| db.transaction_finished());
        Ok(tx)
    }

    /// Create an object store. Only inside the version change transaction.
    pub fn create_object_store(
        &self,
        name: &str,
        options: ObjectStoreOptions,
    ) -> Result<ObjectStore, IdbError> {
        let tx = self.running_upgrade()?;
        if self.store_metadata(name).is_some() {
            return Err(IdbError::Constraint(format!("object store already exists: {}", name)));
        }
        let unusable_path = match &options.key_path {
            KeyPath::None => false,
            KeyPath::Single(path) => path.is_empty(),
            KeyPath::Multiple(_) => true,
        };
        if options.auto_increment && unusable_path {
            return Err(IdbError::InvalidAccess(
                "key generators need a single non-empty key path".into(),
            ));
        }

        self.state
            .borrow_mut()
            .pending_stores
            .insert(name.to_string(), StoreMetadata::from_options(&options));

        let db = self.clone();
        let store = name.to_string();
        let created = options.clone();
        tx.dispatch(
            RequestSource::ObjectStore { store: store.clone() },
            Command::CreateObjectStore {
                db: self.name(),
                store: store.clone(),
                options,
            },
            move |outcome| match outcome {
                Ok(_) => {
                    db.store_created(&store, &created);
                    Ok(())
                }
                Err(e) => {
                    db.store_creation_failed(&store);
                    Err(e)
                }
            },
        )?;
        Ok(ObjectStore::new(tx, name))
    }

    /// Delete an object store. Only inside the version change transaction.
    pub fn delete_object_store(&self, name: &str) -> Result<Request<()>, IdbError> {
        let tx = self.running_upgrade()?;
        if self.store_metadata(name).is_none() {
            return Err(IdbError::NotFound(format!("object store not found: {}", name)));
        }
        let db = self.clone();
        let store = name.to_string();
        tx.dispatch(
            RequestSource::ObjectStore { store: store.clone() },
            Command::DeleteObjectStore {
                db: self.name(),
                store: store.clone(),
            },
            move |outcome| {
                outcome?;
                db.store_deleted(&store);
                Ok(())
            },
        )
    }

    /// Close once every transaction has finished. Calling again does nothing.
    pub fn close(&self) {
        let ready = {
            let mut state = self.state.borrow_mut();
            if state.close_pending || state.closed {
                return;
            }
            state.close_pending = true;
            state.open_transactions == 0 && state.upgrade.is_none()
        };
        if ready {
            self.forward_close();
        } else {
            debug!(db = %self.name(), "Close deferred until transactions finish");
        }
    }

    pub(crate) fn bridge(&self) -> &Arc<Bridge> {
        &self.bridge
    }

    pub(crate) fn emit(&self, event: IdbEvent) {
        let _ = self.events.send(event);
    }

    /// Cached store description, falling back to creations in flight.
    pub(crate) fn store_metadata(&self, name: &str) -> Option<StoreMetadata> {
        let state = self.state.borrow();
        state
            .metadata
            .object_stores
            .get(name)
            .or_else(|| state.pending_stores.get(name))
            .cloned()
    }

    pub(crate) fn index_metadata(&self, store: &str, index: &str) -> Option<IndexMetadata> {
        let state = self.state.borrow();
        state
            .metadata
            .object_stores
            .get(store)
            .and_then(|s| s.indexes.get(index))
            .or_else(|| state.pending_indexes.get(&(store.to_string(), index.to_string())))
            .cloned()
    }

    pub(crate) fn index_names(&self, store: &str) -> Vec<String> {
        let state = self.state.borrow();
        let mut names: BTreeSet<String> = state
            .metadata
            .object_stores
            .get(store)
            .map(|s| s.indexes.keys().cloned().collect())
            .unwrap_or_default();
        names.extend(
            state
                .pending_indexes
                .keys()
                .filter(|(s, _)| s == store)
                .map(|(_, index)| index.clone()),
        );
        names.into_iter().collect()
    }

    /// Create an index on `store` under the version change transaction `tx`.
    pub(crate) fn create_index(
        &self,
        tx: &Transaction,
        store: &str,
        name: &str,
        key_path: KeyPath,
        options: IndexOptions,
    ) -> Result<(), IdbError> {
        let upgrade = self.running_upgrade()?;
        if upgrade.id() != tx.id() {
            return Err(IdbError::InvalidState(
                "indexes change only inside the version change transaction".into(),
            ));
        }
        if self.store_metadata(store).is_none() {
            return Err(IdbError::NotFound(format!("object store not found: {}", store)));
        }
        if self.index_metadata(store, name).is_some() {
            return Err(IdbError::Constraint(format!("index already exists: {}", name)));
        }
        if !key_path.is_inline() {
            return Err(IdbError::InvalidAccess("an index needs a key path".into()));
        }
        if options.multi_entry && matches!(key_path, KeyPath::Multiple(_)) {
            return Err(IdbError::InvalidAccess(
                "multi-entry indexes need a single key path".into(),
            ));
        }

        let metadata = IndexMetadata {
            key_path: key_path.clone(),
            unique: options.unique,
            multi_entry: options.multi_entry,
        };
        let slot = (store.to_string(), name.to_string());
        self.state
            .borrow_mut()
            .pending_indexes
            .insert(slot.clone(), metadata.clone());

        let db = self.clone();
        upgrade.dispatch(
            RequestSource::Index {
                store: store.to_string(),
                index: name.to_string(),
            },
            Command::CreateIndex {
                db: self.name(),
                store: store.to_string(),
                index: name.to_string(),
                key_path,
                options,
            },
            move |outcome| match outcome {
                Ok(_) => {
                    db.index_created(slot, metadata);
                    Ok(())
                }
                Err(e) => {
                    db.state.borrow_mut().pending_indexes.remove(&slot);
                    Err(e)
                }
            },
        )?;
        Ok(())
    }

    pub(crate) fn delete_index(
        &self,
        tx: &Transaction,
        store: &str,
        name: &str,
    ) -> Result<Request<()>, IdbError> {
        let upgrade = self.running_upgrade()?;
        if upgrade.id() != tx.id() {
            return Err(IdbError::InvalidState(
                "indexes change only inside the version change transaction".into(),
            ));
        }
        if self.index_metadata(store, name).is_none() {
            return Err(IdbError::NotFound(format!("index not found: {}", name)));
        }
        let db = self.clone();
        let (store, index) = (store.to_string(), name.to_string());
        upgrade.dispatch(
            RequestSource::Index {
                store: store.clone(),
                index: index.clone(),
            },
            Command::DeleteIndex {
                db: self.name(),
                store: store.clone(),
                index: index.clone(),
            },
            move |outcome| {
                outcome?;
                let mut state = db.state.borrow_mut();
                if let Some(meta) = state.metadata.object_stores.get_mut(&store) {
                    meta.indexes.remove(&index);
                }
                Ok(())
            },
        )
    }

    /// Start the version change transaction for an open, under the id sent with it.
    pub(crate) fn begin_upgrade(&self, id: u64) -> Transaction {
        let scope = self.object_store_names();
        let tx = Transaction::with_id(id, self.clone(), TransactionMode::VersionChange, scope);
        self.state.borrow_mut().upgrade = Some(tx.clone());
        tx
    }

    /// Drop the version change transaction. Returns whether a close was requested meanwhile.
    pub(crate) fn end_upgrade(&self) -> bool {
        let mut state = self.state.borrow_mut();
        state.upgrade = None;
        state.pending_stores.clear();
        state.pending_indexes.clear();
        state.close_pending
    }

    /// Close regardless of outstanding work.
    pub(crate) fn force_close(&self) {
        self.state.borrow_mut().close_pending = true;
        self.forward_close();
    }

    fn running_upgrade(&self) -> Result<Transaction, IdbError> {
        let tx = self.upgrade_transaction().ok_or_else(|| {
            IdbError::InvalidState("not inside a version change transaction".into())
        })?;
        tx.ensure_active()?;
        Ok(tx)
    }

    fn store_created(&self, name: &str, options: &ObjectStoreOptions) {
        let mut state = self.state.borrow_mut();
        let pending = state.pending_stores.remove(name);
        let entry = state
            .metadata
            .object_stores
            .entry(name.to_string())
            .or_insert_with(|| pending.unwrap_or_default());
        entry.key_path = options.key_path.clone();
        entry.auto_increment = options.auto_increment;
    }

    fn store_creation_failed(&self, name: &str) {
        let mut state = self.state.borrow_mut();
        state.pending_stores.remove(name);
        state.pending_indexes.retain(|(store, _), _| store != name);
    }

    fn store_deleted(&self, name: &str) {
        let mut state = self.state.borrow_mut();
        state.metadata.object_stores.remove(name);
        state.pending_stores.remove(name);
        state.pending_indexes.retain(|(store, _), _| store != name);
    }

    fn index_created(&self, slot: (String, String), metadata: IndexMetadata) {
        let mut state = self.state.borrow_mut();
        state.pending_indexes.remove(&slot);
        let (store, index) = slot;
        let base = state.pending_stores.get(&store).cloned();
        state
            .metadata
            .object_stores
            .entry(store)
            .or_insert_with(|| base.unwrap_or_default())
            .indexes
            .insert(index, metadata);
    }

    fn transaction_finished(&self) {
        let ready = {
            let mut state = self.state.borrow_mut();
            state.open_transactions = state.open_transactions.saturating_sub(1);
            state.close_pending
                && !state.closed
                && state.open_transactions == 0
                && state.upgrade.is_none()
        };
        if ready {
            self.forward_close();
        }
    }

    fn forward_close(&self) {
        {
            let mut state = self.state.borrow_mut();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        let db_name = self.name();
        info!(db = %db_name, "Closing database");
        let call = self.bridge.call(&Command::Close {
            name: db_name.clone(),
        });
        let events = self.events.clone();
        tokio::task::spawn_local(async move {
            match call.await {
                Ok(_) => {
                    let _ = events.send(IdbEvent::Closed { db_name });
                }
                Err(e) => warn!(db = %db_name, error = %e, "Close failed"),
            }
        });
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.state.try_borrow() {
            Ok(state) => f
                .debug_struct("Database")
                .field("name", &state.metadata.name)
                .field("version", &state.metadata.version)
                .field("closed", &state.closed)
                .finish(),
            Err(_) => f.debug_struct("Database").finish_non_exhaustive(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{flush, open_notes, ScriptedChannel};
    use serde_json::json;
    use tokio::task::LocalSet;

    #[tokio::test]
    async fn test_transaction_scope_rules() {
        LocalSet::new()
            .run_until(async {
                let channel = ScriptedChannel::new();
                let db = open_notes(&channel).await;
                assert_eq!(db.object_store_names(), vec!["counters", "items", "notes"]);

                let empty: [&str; 0] = [];
                assert!(matches!(
                    db.transaction(empty, TransactionMode::ReadOnly),
                    Err(IdbError::InvalidAccess(_))
                ));
                assert!(matches!(
                    db.transaction(["ghosts"], TransactionMode::ReadOnly),
                    Err(IdbError::NotFound(_))
                ));
                assert!(matches!(
                    db.transaction(["items"], TransactionMode::VersionChange),
                    Err(IdbError::InvalidAccess(_))
                ));

                let tx = db.transaction(["items"], TransactionMode::ReadOnly).unwrap();
                assert!(matches!(tx.object_store("notes"), Err(IdbError::NotFound(_))));
            })
            .await;
    }

    #[tokio::test]
    async fn test_schema_changes_outside_upgrade_fail_before_dispatch() {
        LocalSet::new()
            .run_until(async {
                let channel = ScriptedChannel::new();
                let db = open_notes(&channel).await;
                let posted = channel.count();

                assert!(matches!(
                    db.create_object_store("extra", ObjectStoreOptions::default()),
                    Err(IdbError::InvalidState(_))
                ));
                assert!(matches!(db.delete_object_store("items"), Err(IdbError::InvalidState(_))));

                let tx = db.transaction(["notes"], TransactionMode::ReadWrite).unwrap();
                let notes = tx.object_store("notes").unwrap();
                assert!(matches!(
                    notes.create_index("by_title", "title", IndexOptions::default()),
                    Err(IdbError::InvalidState(_))
                ));
                assert!(matches!(notes.delete_index("by_tag"), Err(IdbError::InvalidState(_))));
                assert_eq!(channel.count(), posted);
            })
            .await;
    }

    #[tokio::test]
    async fn test_close_waits_for_transactions() {
        LocalSet::new()
            .run_until(async {
                let channel = ScriptedChannel::new();
                let db = open_notes(&channel).await;
                let tx = db.transaction(["items"], TransactionMode::ReadOnly).unwrap();

                db.close();
                db.close();
                assert!(db.is_closed());
                assert!(matches!(
                    db.transaction(["items"], TransactionMode::ReadOnly),
                    Err(IdbError::InvalidState(_))
                ));
                assert!(!channel.operations().contains(&"close".to_string()));

                flush().await;
                channel.reply(channel.last("commitTransaction"), json!("OK"));
                tx.done().await.unwrap();

                let close = channel.last("close");
                assert_eq!(channel.envelope(close).arguments, vec![json!("Notes")]);
                assert_eq!(
                    channel.operations().iter().filter(|op| *op == "close").count(),
                    1
                );
            })
            .await;
    }

    #[tokio::test]
    async fn test_close_without_transactions_is_immediate() {
        LocalSet::new()
            .run_until(async {
                let channel = ScriptedChannel::new();
                let db = open_notes(&channel).await;
                db.close();
                assert_eq!(channel.operations().last().map(String::as_str), Some("close"));
            })
            .await;
    }
}
