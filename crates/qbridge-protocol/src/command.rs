//! Typed command table for the remote engine.
//!
//! Each variant maps to one operation name and a fixed positional argument
//! layout. [`Command::arguments`] produces the layout, [`Command::decode`]
//! reads it back on the engine side.

use qbridge_common::BridgeError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::payload::ImportRow;
use crate::range::Query;
use crate::schema::{CursorDirection, IndexOptions, KeyPath, ObjectStoreOptions};

/// Options for `importChunk`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImportOptions {
    /// Empty the store before writing the chunk.
    pub clear: bool,
}

/// Every operation name the command table knows.
pub const OPERATIONS: &[&str] = &[
    "open",
    "deleteDatabase",
    "close",
    "databases",
    "deleteAllDatabases",
    "createObjectStore",
    "deleteObjectStore",
    "createIndex",
    "deleteIndex",
    "add",
    "put",
    "delete",
    "get",
    "getAll",
    "getAllKeys",
    "clear",
    "count",
    "indexGet",
    "indexGetAll",
    "indexCount",
    "openCursor",
    "openKeyCursor",
    "openIndexCursor",
    "openIndexKeyCursor",
    "cursorContinue",
    "commitTransaction",
    "abortTransaction",
    "importChunk",
];

/// A remote engine operation with its arguments.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Open {
        name: String,
        version: Option<u64>,
        /// Id the client gives its version change transaction, should one start.
        transaction: Option<u64>,
    },
    DeleteDatabase {
        name: String,
    },
    Close {
        name: String,
    },
    Databases,
    DeleteAllDatabases,
    CreateObjectStore {
        db: String,
        store: String,
        options: ObjectStoreOptions,
    },
    DeleteObjectStore {
        db: String,
        store: String,
    },
    CreateIndex {
        db: String,
        store: String,
        index: String,
        key_path: KeyPath,
        options: IndexOptions,
    },
    DeleteIndex {
        db: String,
        store: String,
        index: String,
    },
    Add {
        db: String,
        store: String,
        value: JsonValue,
        key: Option<JsonValue>,
    },
    Put {
        db: String,
        store: String,
        value: JsonValue,
        key: Option<JsonValue>,
    },
    Delete {
        db: String,
        store: String,
        query: Query,
    },
    Get {
        db: String,
        store: String,
        query: Query,
    },
    GetAll {
        db: String,
        store: String,
        query: Option<Query>,
        count: Option<u32>,
    },
    GetAllKeys {
        db: String,
        store: String,
        query: Option<Query>,
        count: Option<u32>,
    },
    Clear {
        db: String,
        store: String,
    },
    Count {
        db: String,
        store: String,
        query: Option<Query>,
    },
    IndexGet {
        db: String,
        store: String,
        index: String,
        query: Query,
    },
    IndexGetAll {
        db: String,
        store: String,
        index: String,
        query: Option<Query>,
        count: Option<u32>,
    },
    IndexCount {
        db: String,
        store: String,
        index: String,
        query: Option<Query>,
    },
    OpenCursor {
        db: String,
        store: String,
        index: Option<String>,
        query: Option<Query>,
        direction: CursorDirection,
        key_only: bool,
        /// Transaction the cursor belongs to; it is dropped when that transaction ends.
        transaction: Option<u64>,
    },
    CursorContinue {
        cursor_id: String,
        count: u32,
    },
    CommitTransaction {
        db: String,
        transaction: u64,
    },
    AbortTransaction {
        db: String,
        transaction: u64,
    },
    ImportChunk {
        db: String,
        store: String,
        rows: Vec<ImportRow>,
        options: ImportOptions,
    },
}

impl Command {
    /// Check whether `operation` names a known command.
    pub fn is_operation(operation: &str) -> bool {
        OPERATIONS.contains(&operation)
    }

    /// Operation name on the wire.
    pub fn operation(&self) -> &'static str {
        match self {
            Command::Open { .. } => "open",
            Command::DeleteDatabase { .. } => "deleteDatabase",
            Command::Close { .. } => "close",
            Command::Databases => "databases",
            Command::DeleteAllDatabases => "deleteAllDatabases",
            Command::CreateObjectStore { .. } => "createObjectStore",
            Command::DeleteObjectStore { .. } => "deleteObjectStore",
            Command::CreateIndex { .. } => "createIndex",
            Command::DeleteIndex { .. } => "deleteIndex",
            Command::Add { .. } => "add",
            Command::Put { .. } => "put",
            Command::Delete { .. } => "delete",
            Command::Get { .. } => "get",
            Command::GetAll { .. } => "getAll",
            Command::GetAllKeys { .. } => "getAllKeys",
            Command::Clear { .. } => "clear",
            Command::Count { .. } => "count",
            Command::IndexGet { .. } => "indexGet",
            Command::IndexGetAll { .. } => "indexGetAll",
            Command::IndexCount { .. } => "indexCount",
            Command::OpenCursor {
                index: None,
                key_only: false,
                ..
            } => "openCursor",
            Command::OpenCursor {
                index: None,
                key_only: true,
                ..
            } => "openKeyCursor",
            Command::OpenCursor {
                index: Some(_),
                key_only: false,
                ..
            } => "openIndexCursor",
            Command::OpenCursor {
                index: Some(_),
                key_only: true,
                ..
            } => "openIndexKeyCursor",
            Command::CursorContinue { .. } => "cursorContinue",
            Command::CommitTransaction { .. } => "commitTransaction",
            Command::AbortTransaction { .. } => "abortTransaction",
            Command::ImportChunk { .. } => "importChunk",
        }
    }

    /// Database the command addresses, if any.
    pub fn database(&self) -> Option<&str> {
        match self {
            Command::Open { name, .. }
            | Command::DeleteDatabase { name }
            | Command::Close { name } => Some(name),
            Command::Databases | Command::DeleteAllDatabases | Command::CursorContinue { .. } => {
                None
            }
            Command::CreateObjectStore { db, .. }
            | Command::DeleteObjectStore { db, .. }
            | Command::CreateIndex { db, .. }
            | Command::DeleteIndex { db, .. }
            | Command::Add { db, .. }
            | Command::Put { db, .. }
            | Command::Delete { db, .. }
            | Command::Get { db, .. }
            | Command::GetAll { db, .. }
            | Command::GetAllKeys { db, .. }
            | Command::Clear { db, .. }
            | Command::Count { db, .. }
            | Command::IndexGet { db, .. }
            | Command::IndexGetAll { db, .. }
            | Command::IndexCount { db, .. }
            | Command::OpenCursor { db, .. }
            | Command::CommitTransaction { db, .. }
            | Command::AbortTransaction { db, .. }
            | Command::ImportChunk { db, .. } => Some(db),
        }
    }

    /// Positional arguments on the wire.
    pub fn arguments(&self) -> Vec<JsonValue> {
        match self {
            Command::Open {
                name,
                version,
                transaction,
            } => {
                let mut args = vec![name.as_str().into(), opt(version)];
                if let Some(transaction) = transaction {
                    args.push((*transaction).into());
                }
                args
            }
            Command::DeleteDatabase { name } | Command::Close { name } => {
                vec![name.as_str().into()]
            }
            Command::Databases | Command::DeleteAllDatabases => Vec::new(),
            Command::CreateObjectStore { db, store, options } => {
                vec![db.as_str().into(), store.as_str().into(), json(options)]
            }
            Command::DeleteObjectStore { db, store } | Command::Clear { db, store } => {
                vec![db.as_str().into(), store.as_str().into()]
            }
            Command::CreateIndex {
                db,
                store,
                index,
                key_path,
                options,
            } => vec![
                db.as_str().into(),
                store.as_str().into(),
                index.as_str().into(),
                json(key_path),
                json(options),
            ],
            Command::DeleteIndex { db, store, index } => vec![
                db.as_str().into(),
                store.as_str().into(),
                index.as_str().into(),
            ],
            Command::Add {
                db,
                store,
                value,
                key,
            }
            | Command::Put {
                db,
                store,
                value,
                key,
            } => vec![
                db.as_str().into(),
                store.as_str().into(),
                value.clone(),
                opt(key),
            ],
            Command::Delete { db, store, query } | Command::Get { db, store, query } => {
                vec![db.as_str().into(), store.as_str().into(), json(query)]
            }
            Command::GetAll {
                db,
                store,
                query,
                count,
            }
            | Command::GetAllKeys {
                db,
                store,
                query,
                count,
            } => vec![
                db.as_str().into(),
                store.as_str().into(),
                opt(query),
                opt(count),
            ],
            Command::Count { db, store, query } => {
                vec![db.as_str().into(), store.as_str().into(), opt(query)]
            }
            Command::IndexGet {
                db,
                store,
                index,
                query,
            } => vec![
                db.as_str().into(),
                store.as_str().into(),
                index.as_str().into(),
                json(query),
            ],
            Command::IndexGetAll {
                db,
                store,
                index,
                query,
                count,
            } => vec![
                db.as_str().into(),
                store.as_str().into(),
                index.as_str().into(),
                opt(query),
                opt(count),
            ],
            Command::IndexCount {
                db,
                store,
                index,
                query,
            } => vec![
                db.as_str().into(),
                store.as_str().into(),
                index.as_str().into(),
                opt(query),
            ],
            Command::OpenCursor {
                db,
                store,
                index,
                query,
                direction,
                transaction,
                ..
            } => {
                let mut args = vec![db.as_str().into(), store.as_str().into()];
                if let Some(index) = index {
                    args.push(index.as_str().into());
                }
                args.push(opt(query));
                args.push(json(direction));
                if let Some(transaction) = transaction {
                    args.push((*transaction).into());
                }
                args
            }
            Command::CursorContinue { cursor_id, count } => {
                vec![cursor_id.as_str().into(), (*count).into()]
            }
            Command::CommitTransaction { db, transaction }
            | Command::AbortTransaction { db, transaction } => {
                vec![db.as_str().into(), (*transaction).into()]
            }
            Command::ImportChunk {
                db,
                store,
                rows,
                options,
            } => vec![
                db.as_str().into(),
                store.as_str().into(),
                json(rows),
                json(options),
            ],
        }
    }

    /// Rebuild a command from its operation name and positional arguments.
    pub fn decode(operation: &str, arguments: &[JsonValue]) -> Result<Self, BridgeError> {
        let args = Args {
            operation,
            items: arguments,
        };
        let command = match operation {
            "open" => Command::Open {
                name: args.req(0)?,
                version: args.opt(1)?,
                transaction: args.opt(2)?,
            },
            "deleteDatabase" => Command::DeleteDatabase { name: args.req(0)? },
            "close" => Command::Close { name: args.req(0)? },
            "databases" => Command::Databases,
            "deleteAllDatabases" => Command::DeleteAllDatabases,
            "createObjectStore" => Command::CreateObjectStore {
                db: args.req(0)?,
                store: args.req(1)?,
                options: args.opt(2)?.unwrap_or_default(),
            },
            "deleteObjectStore" => Command::DeleteObjectStore {
                db: args.req(0)?,
                store: args.req(1)?,
            },
            "createIndex" => Command::CreateIndex {
                db: args.req(0)?,
                store: args.req(1)?,
                index: args.req(2)?,
                key_path: args.req(3)?,
                options: args.opt(4)?.unwrap_or_default(),
            },
            "deleteIndex" => Command::DeleteIndex {
                db: args.req(0)?,
                store: args.req(1)?,
                index: args.req(2)?,
            },
            "add" => Command::Add {
                db: args.req(0)?,
                store: args.req(1)?,
                value: args.value(2)?,
                key: args.opt(3)?,
            },
            "put" => Command::Put {
                db: args.req(0)?,
                store: args.req(1)?,
                value: args.value(2)?,
                key: args.opt(3)?,
            },
            "delete" => Command::Delete {
                db: args.req(0)?,
                store: args.req(1)?,
                query: args.req(2)?,
            },
            "get" => Command::Get {
                db: args.req(0)?,
                store: args.req(1)?,
                query: args.req(2)?,
            },
            "getAll" => Command::GetAll {
                db: args.req(0)?,
                store: args.req(1)?,
                query: args.opt(2)?,
                count: args.opt(3)?,
            },
            "getAllKeys" => Command::GetAllKeys {
                db: args.req(0)?,
                store: args.req(1)?,
                query: args.opt(2)?,
                count: args.opt(3)?,
            },
            "clear" => Command::Clear {
                db: args.req(0)?,
                store: args.req(1)?,
            },
            "count" => Command::Count {
                db: args.req(0)?,
                store: args.req(1)?,
                query: args.opt(2)?,
            },
            "indexGet" => Command::IndexGet {
                db: args.req(0)?,
                store: args.req(1)?,
                index: args.req(2)?,
                query: args.req(3)?,
            },
            "indexGetAll" => Command::IndexGetAll {
                db: args.req(0)?,
                store: args.req(1)?,
                index: args.req(2)?,
                query: args.opt(3)?,
                count: args.opt(4)?,
            },
            "indexCount" => Command::IndexCount {
                db: args.req(0)?,
                store: args.req(1)?,
                index: args.req(2)?,
                query: args.opt(3)?,
            },
            "openCursor" | "openKeyCursor" => Command::OpenCursor {
                db: args.req(0)?,
                store: args.req(1)?,
                index: None,
                query: args.opt(2)?,
                direction: args.opt(3)?.unwrap_or_default(),
                key_only: operation == "openKeyCursor",
                transaction: args.opt(4)?,
            },
            "openIndexCursor" | "openIndexKeyCursor" => Command::OpenCursor {
                db: args.req(0)?,
                store: args.req(1)?,
                index: Some(args.req(2)?),
                query: args.opt(3)?,
                direction: args.opt(4)?.unwrap_or_default(),
                key_only: operation == "openIndexKeyCursor",
                transaction: args.opt(5)?,
            },
            "cursorContinue" => Command::CursorContinue {
                cursor_id: args.req(0)?,
                count: args.opt(1)?.unwrap_or(1),
            },
            "commitTransaction" => Command::CommitTransaction {
                db: args.req(0)?,
                transaction: args.req(1)?,
            },
            "abortTransaction" => Command::AbortTransaction {
                db: args.req(0)?,
                transaction: args.req(1)?,
            },
            "importChunk" => Command::ImportChunk {
                db: args.req(0)?,
                store: args.req(1)?,
                rows: args.req(2)?,
                options: args.opt(3)?.unwrap_or_default(),
            },
            _ => return Err(BridgeError::codec(format!("Unknown operation {}", operation))),
        };
        Ok(command)
    }
}

fn json<T: Serialize>(value: &T) -> JsonValue {
    serde_json::to_value(value).unwrap_or(JsonValue::Null)
}

fn opt<T: Serialize>(value: &Option<T>) -> JsonValue {
    value.as_ref().map(json).unwrap_or(JsonValue::Null)
}

/// Positional argument reader.
struct Args<'a> {
    operation: &'a str,
    items: &'a [JsonValue],
}

impl Args<'_> {
    fn invalid(&self) -> BridgeError {
        BridgeError::codec(format!("Invalid arguments for {}", self.operation))
    }

    /// Raw value at `index`; must be present.
    fn value(&self, index: usize) -> Result<JsonValue, BridgeError> {
        self.items.get(index).cloned().ok_or_else(|| self.invalid())
    }

    /// Typed value at `index`; must be present and decode.
    fn req<T: DeserializeOwned>(&self, index: usize) -> Result<T, BridgeError> {
        let value = self.value(index)?;
        serde_json::from_value(value).map_err(|_| self.invalid())
    }

    /// Typed value at `index`; missing or `null` reads as `None`.
    fn opt<T: DeserializeOwned>(&self, index: usize) -> Result<Option<T>, BridgeError> {
        match self.items.get(index) {
            None | Some(JsonValue::Null) => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|_| self.invalid()),
        }
    }
}
