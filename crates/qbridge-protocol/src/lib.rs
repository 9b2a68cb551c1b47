//! # QBridge Protocol
//!
//! Wire-level vocabulary shared by the database client and any engine that
//! answers it.
//!
//! ## Features
//!
//! - `Envelope` / `Reply` with correlation ids
//! - Typed command table (`Command`) with positional argument encoding
//! - Key validation, ordering, key ranges, and key paths
//! - Schema metadata and structured reply payloads
//! - The `MessageChannel` trait and `ReplySink` correlation table

pub mod channel;
pub mod command;
pub mod envelope;
pub mod key;
pub mod payload;
pub mod range;
pub mod schema;

pub use channel::{CallOutcome, MessageChannel, ReplySink};
pub use command::{Command, ImportOptions, OPERATIONS};
pub use envelope::{CorrelationId, Envelope, Reply};
pub use key::{compare, is_valid_key, validate_key, KeyError, OrderedKey};
pub use payload::{CursorOpened, CursorRecord, CursorStep, ImportRow, OpenReply};
pub use range::{KeyRange, Query};
pub use schema::{
    CursorDirection, DatabaseInfo, DatabaseMetadata, IndexMetadata, IndexOptions, KeyPath,
    ObjectStoreOptions, StoreMetadata, TransactionMode,
};

/// Service name the database engine registers under.
pub const SERVICE_NAME: &str = qbridge_common::config::DEFAULT_TARGET;
