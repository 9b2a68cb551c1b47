//! The in-process engine: a worker task answering envelopes from a queue.

use hashbrown::HashMap;
use qbridge_common::BridgeError;
use qbridge_protocol::{
    Command, CursorOpened, DatabaseInfo, DatabaseMetadata, Envelope, MessageChannel, OpenReply,
    Reply, ReplySink, SERVICE_NAME,
};
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cursor::CursorTable;
use crate::database::Database;
use crate::EngineError;

const OK: &str = "OK";

/// Envelopes kept in the operation log; older ones are dropped first.
pub const LOG_CAPACITY: usize = 1024;

fn encode<T: Serialize>(value: &T) -> Result<JsonValue, EngineError> {
    serde_json::to_value(value).map_err(|e| EngineError::Internal(e.to_string()))
}

/// Everything the engine knows, guarded by one lock.
#[derive(Debug, Default)]
struct EngineState {
    databases: BTreeMap<String, Database>,
    cursors: CursorTable,
    log: VecDeque<Envelope>,
    faults: HashMap<String, String>,
}

impl EngineState {
    fn database(&self, name: &str) -> Result<&Database, EngineError> {
        self.databases
            .get(name)
            .ok_or_else(|| EngineError::NotFound(format!("Database not found: {}", name)))
    }

    fn database_mut(&mut self, name: &str) -> Result<&mut Database, EngineError> {
        self.databases
            .get_mut(name)
            .ok_or_else(|| EngineError::NotFound(format!("Database not found: {}", name)))
    }

    fn process(&mut self, service: &str, envelope: Envelope) -> Reply {
        let id = envelope.correlation_id;
        if self.log.len() == LOG_CAPACITY {
            self.log.pop_front();
        }
        self.log.push_back(envelope.clone());

        if envelope.target != service {
            warn!(target_service = %envelope.target, "Envelope for unknown service");
            return Reply::failure(id, EngineError::Routing(format!("Unknown service {}", envelope.target)).to_string());
        }
        if !Command::is_operation(&envelope.operation) {
            return Reply::failure(
                id,
                format!("Unknown action {}.{}", envelope.target, envelope.operation),
            );
        }
        if let Some(message) = self.faults.remove(&envelope.operation) {
            debug!(operation = %envelope.operation, "Injected failure");
            return Reply::failure(id, message);
        }

        let command = match Command::decode(&envelope.operation, &envelope.arguments) {
            Ok(command) => command,
            Err(BridgeError::Codec(message)) => return Reply::failure(id, message),
            Err(e) => return Reply::failure(id, e.to_string()),
        };

        debug!(operation = command.operation(), correlation_id = %id, "Executing");
        match self.execute(command) {
            Ok(result) => Reply::success(id, result),
            Err(e) => {
                debug!(correlation_id = %id, error = %e, "Operation failed");
                Reply::failure(id, e.to_string())
            }
        }
    }

    fn execute(&mut self, command: Command) -> Result<JsonValue, EngineError> {
        match command {
            Command::Open {
                name,
                version,
                transaction,
            } => self.open(&name, version, transaction),
            Command::DeleteDatabase { name } => {
                self.cursors.release_database(&name);
                if self.databases.remove(&name).is_some() {
                    info!(db_name = %name, "Database deleted");
                }
                Ok(json!(OK))
            }
            Command::Close { name } => {
                self.cursors.release_database(&name);
                Ok(json!(OK))
            }
            Command::Databases => {
                let infos: Vec<DatabaseInfo> =
                    self.databases.values().map(Database::info).collect();
                encode(&infos)
            }
            Command::DeleteAllDatabases => {
                self.cursors.clear();
                self.databases.clear();
                Ok(json!(OK))
            }
            Command::CreateObjectStore { db, store, options } => {
                self.database_mut(&db)?
                    .create_object_store(&store, &options)?;
                Ok(json!({ "storeCreated": store }))
            }
            Command::DeleteObjectStore { db, store } => {
                self.database_mut(&db)?.delete_object_store(&store)?;
                Ok(json!(OK))
            }
            Command::CreateIndex {
                db,
                store,
                index,
                key_path,
                options,
            } => {
                self.database_mut(&db)?
                    .object_store_for_schema(&store)?
                    .create_index(&index, key_path, options)?;
                Ok(json!({ "indexCreated": index }))
            }
            Command::DeleteIndex { db, store, index } => {
                self.database_mut(&db)?
                    .object_store_for_schema(&store)?
                    .delete_index(&index)?;
                Ok(json!(OK))
            }
            Command::Add {
                db,
                store,
                value,
                key,
            } => {
                self.database_mut(&db)?
                    .object_store_mut(&store)?
                    .add(value, key)?;
                Ok(json!(OK))
            }
            Command::Put {
                db,
                store,
                value,
                key,
            } => {
                self.database_mut(&db)?
                    .object_store_mut(&store)?
                    .put(value, key)?;
                Ok(json!(OK))
            }
            Command::Delete { db, store, query } => {
                self.database_mut(&db)?
                    .object_store_mut(&store)?
                    .delete(&query)?;
                Ok(json!(OK))
            }
            Command::Get { db, store, query } => {
                let found = self.database(&db)?.object_store(&store)?.get(&query)?;
                Ok(found.unwrap_or(JsonValue::Null))
            }
            Command::GetAll {
                db,
                store,
                query,
                count,
            } => {
                let values = self
                    .database(&db)?
                    .object_store(&store)?
                    .get_all(query.as_ref(), count)?;
                Ok(JsonValue::Array(values))
            }
            Command::GetAllKeys {
                db,
                store,
                query,
                count,
            } => {
                let keys = self
                    .database(&db)?
                    .object_store(&store)?
                    .get_all_keys(query.as_ref(), count)?;
                Ok(JsonValue::Array(keys))
            }
            Command::Clear { db, store } => {
                self.database_mut(&db)?.object_store_mut(&store)?.clear();
                Ok(json!(OK))
            }
            Command::Count { db, store, query } => {
                let n = self
                    .database(&db)?
                    .object_store(&store)?
                    .count(query.as_ref())?;
                Ok(json!(n))
            }
            Command::IndexGet {
                db,
                store,
                index,
                query,
            } => {
                let found = self
                    .database(&db)?
                    .object_store(&store)?
                    .index_get(&index, &query)?;
                Ok(found.unwrap_or(JsonValue::Null))
            }
            Command::IndexGetAll {
                db,
                store,
                index,
                query,
                count,
            } => {
                let values = self
                    .database(&db)?
                    .object_store(&store)?
                    .index_get_all(&index, query.as_ref(), count)?;
                Ok(JsonValue::Array(values))
            }
            Command::IndexCount {
                db,
                store,
                index,
                query,
            } => {
                let n = self
                    .database(&db)?
                    .object_store(&store)?
                    .index_count(&index, query.as_ref())?;
                Ok(json!(n))
            }
            Command::OpenCursor {
                db,
                store,
                index,
                query,
                direction,
                key_only,
                transaction,
            } => {
                let records = self.database(&db)?.object_store(&store)?.cursor_records(
                    index.as_deref(),
                    query.as_ref(),
                    direction,
                    key_only,
                )?;
                let opened = self.cursors.open(&db, &store, transaction, records);
                if let CursorOpened::Positioned { cursor_id, .. } = &opened {
                    debug!(cursor_id = %cursor_id, "Cursor opened");
                }
                Ok(opened.to_json())
            }
            Command::CursorContinue { cursor_id, count } => {
                let step = self.cursors.advance(&cursor_id, count)?;
                Ok(step.to_json())
            }
            Command::CommitTransaction { db, transaction } => {
                self.cursors.release_transaction(&db, transaction);
                if let Some(database) = self.databases.get_mut(&db) {
                    if database.commit_upgrade(transaction) {
                        info!(db_name = %db, version = database.version, "Version change committed");
                    }
                }
                debug!(db_name = %db, transaction, "Transaction committed");
                Ok(json!(OK))
            }
            Command::AbortTransaction { db, transaction } => {
                self.cursors.release_transaction(&db, transaction);
                let mut discard = false;
                if let Some(database) = self.databases.get_mut(&db) {
                    if database.rollback_upgrade(transaction) {
                        info!(db_name = %db, version = database.version, "Version change rolled back");
                        discard = database.version == 0;
                    }
                }
                if discard {
                    self.cursors.release_database(&db);
                    self.databases.remove(&db);
                }
                debug!(db_name = %db, transaction, "Transaction aborted");
                Ok(json!(OK))
            }
            Command::ImportChunk {
                db,
                store,
                rows,
                options,
            } => {
                let target = self.database_mut(&db)?.object_store_mut(&store)?;
                if options.clear {
                    target.clear();
                }
                let imported = rows.len();
                for row in rows {
                    target.put(row.value, row.key)?;
                }
                debug!(db_name = %db, store = %store, imported, "Chunk imported");
                Ok(json!(OK))
            }
        }
    }

    fn open(
        &mut self,
        name: &str,
        version: Option<u64>,
        transaction: Option<u64>,
    ) -> Result<JsonValue, EngineError> {
        let old_version = self.databases.get(name).map(|db| db.version).unwrap_or(0);
        let requested = version.unwrap_or_else(|| old_version.max(1));

        if requested == 0 {
            return Err(EngineError::Version(
                "Version must be a positive integer".to_string(),
            ));
        }
        if requested < old_version {
            return Err(EngineError::Version(format!(
                "Requested version {} is less than current version {}",
                requested, old_version
            )));
        }

        let db = self
            .databases
            .entry(name.to_string())
            .or_insert_with(|| Database::new(name, 0));
        let upgrade = requested > old_version;
        if upgrade {
            db.begin_upgrade(requested, transaction);
        }
        info!(db_name = %name, old_version, new_version = requested, upgrade, "Database opened");

        encode(&OpenReply {
            old_version,
            new_version: requested,
            upgrade,
            metadata: Some(db.metadata()),
        })
    }
}

/// In-memory engine reachable through [`MessageChannel`].
///
/// Calls are queued and executed one at a time by a worker task; replies go
/// back through the [`ReplySink`] that came with each envelope.
pub struct MemoryEngine {
    service: String,
    state: Arc<Mutex<EngineState>>,
    queue: mpsc::UnboundedSender<(Envelope, ReplySink)>,
}

impl MemoryEngine {
    /// Start an engine registered under the default service name.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start() -> Arc<Self> {
        Self::with_service(SERVICE_NAME)
    }

    /// Start an engine registered under `service`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn with_service(service: impl Into<String>) -> Arc<Self> {
        let service = service.into();
        let state = Arc::new(Mutex::new(EngineState::default()));
        let (queue, mut rx) = mpsc::unbounded_channel::<(Envelope, ReplySink)>();

        let worker_state = Arc::clone(&state);
        let worker_service = service.clone();
        tokio::spawn(async move {
            while let Some((envelope, replies)) = rx.recv().await {
                let reply = lock(&worker_state).process(&worker_service, envelope);
                replies.deliver(reply);
            }
            debug!("Engine worker stopped");
        });

        info!(service = %service, "Memory engine started");
        Arc::new(Self {
            service,
            state,
            queue,
        })
    }

    /// Service name the engine answers to.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Execute one envelope synchronously, bypassing the queue.
    pub fn handle(&self, envelope: Envelope) -> Reply {
        lock(&self.state).process(&self.service, envelope)
    }

    /// Make the next call to `operation` fail with `message`.
    pub fn fail_next(&self, operation: impl Into<String>, message: impl Into<String>) {
        lock(&self.state)
            .faults
            .insert(operation.into(), message.into());
    }

    /// The most recent envelopes, in arrival order, up to [`LOG_CAPACITY`].
    pub fn calls(&self) -> Vec<Envelope> {
        lock(&self.state).log.iter().cloned().collect()
    }

    /// Operation names of [`calls`](Self::calls).
    pub fn operations(&self) -> Vec<String> {
        lock(&self.state)
            .log
            .iter()
            .map(|e| e.operation.clone())
            .collect()
    }

    /// Current schema of a database.
    pub fn metadata(&self, name: &str) -> Option<DatabaseMetadata> {
        lock(&self.state).databases.get(name).map(Database::metadata)
    }

    /// Known databases.
    pub fn databases(&self) -> Vec<DatabaseInfo> {
        lock(&self.state)
            .databases
            .values()
            .map(Database::info)
            .collect()
    }

    /// Number of cursors still held server-side.
    pub fn open_cursors(&self) -> usize {
        lock(&self.state).cursors.len()
    }
}

fn lock(state: &Mutex<EngineState>) -> MutexGuard<'_, EngineState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MessageChannel for MemoryEngine {
    fn post(&self, envelope: Envelope, replies: ReplySink) -> Result<(), BridgeError> {
        self.queue
            .send((envelope, replies))
            .map_err(|_| BridgeError::channel("engine worker stopped"))
    }
}

impl std::fmt::Debug for MemoryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryEngine")
            .field("service", &self.service)
            .finish()
    }
}
