//! # QBridge Engine
//!
//! In-process database engine that answers the QBridge database channel.
//!
//! ## Features
//!
//! - Databases, object stores, and indexes over ordered in-memory maps
//! - Unique and multi-entry indexes, key generators, key paths
//! - Server-side cursors paged by cursor id, dropped when their transaction ends
//! - Version changes that roll back when aborted
//! - Bounded operation log and fault injection for tests
//!
//! ## Architecture
//!
//! ```text
//! MessageChannel::post
//!     │
//!     └── queue ──► worker task
//!                     │
//!                     ├── Database
//!                     │       └── ObjectStore
//!                     │               └── Index
//!                     │
//!                     └── CursorTable
//! ```

use qbridge_protocol::KeyError;
use thiserror::Error;

pub mod cursor;
pub mod database;
pub mod engine;
pub mod store;

pub use cursor::CursorTable;
pub use database::Database;
pub use engine::{MemoryEngine, LOG_CAPACITY};
pub use store::{Index, ObjectStore};

/// Engine errors. The display form is what travels back in a reply.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("NotFoundError: {0}")]
    NotFound(String),

    #[error("ConstraintError: {0}")]
    Constraint(String),

    #[error("DataError: {0}")]
    Data(String),

    #[error("InvalidStateError: {0}")]
    InvalidState(String),

    #[error("VersionError: {0}")]
    Version(String),

    /// Envelope could not be routed to an operation.
    #[error("{0}")]
    Routing(String),

    #[error("UnknownError: {0}")]
    Internal(String),
}

impl From<KeyError> for EngineError {
    fn from(err: KeyError) -> Self {
        EngineError::Data(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_wire_form() {
        assert_eq!(
            EngineError::Constraint("Key already exists: 1".into()).to_string(),
            "ConstraintError: Key already exists: 1"
        );
        assert_eq!(
            EngineError::from(KeyError::InvalidKey("true".into())).to_string(),
            "DataError: Invalid key: true"
        );
        assert_eq!(EngineError::Routing("Unknown service X".into()).to_string(), "Unknown service X");
    }
}
