//! # QBridge IndexedDB
//!
//! An IndexedDB-style client whose storage lives on the far side of a
//! one-way message channel.
//!
//! ## Features
//!
//! - Promise-like [`Request`]s with persistent listeners, awaitable
//! - Transactions that count in-flight operations and commit on their own
//! - Version change transactions driven by [`Factory::open`]
//! - Object stores, indexes, and cursors paged from the engine
//! - Schema cache kept in step with engine replies
//!
//! ## Architecture
//!
//! ```text
//! Factory ──► OpenRequest ──► Database
//!                               │
//!                               └── Transaction ──► ObjectStore ──► Index
//!                                       │                │
//!                                       │                └── Cursor
//!                                       │
//!                                     Request ◄── Bridge ◄── MessageChannel
//! ```
//!
//! Handles are single-threaded; drive them from a `tokio::task::LocalSet`.

pub mod bridge;
pub mod cursor;
pub mod database;
pub mod error;
pub mod factory;
pub mod index;
pub mod request;
pub mod store;
pub mod transaction;

#[cfg(test)]
pub(crate) mod testing;

pub use bridge::Bridge;
pub use cursor::Cursor;
pub use database::Database;
pub use error::IdbError;
pub use factory::{Factory, IdbEvent, OpenRequest, UpgradeEvent};
pub use index::Index;
pub use request::{ListenerId, ReadyState, Request, RequestSource};
pub use store::ObjectStore;
pub use transaction::{Transaction, TransactionState};

pub use qbridge_protocol::{
    CursorDirection, DatabaseInfo, ImportOptions, ImportRow, IndexOptions, KeyPath, KeyRange,
    ObjectStoreOptions, Query, TransactionMode,
};
