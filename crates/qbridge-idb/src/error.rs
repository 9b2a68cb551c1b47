//! Database client errors.

use qbridge_common::BridgeError;
use qbridge_protocol::KeyError;
use thiserror::Error;

/// IndexedDB errors.
///
/// Usage errors are returned synchronously before anything is dispatched.
/// Everything the engine reports arrives through request settlement.
#[derive(Error, Debug, Clone)]
pub enum IdbError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Constraint error: {0}")]
    Constraint(String),

    #[error("Data error: {0}")]
    Data(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Transaction inactive")]
    TransactionInactive,

    #[error("Read only")]
    ReadOnly,

    #[error("Version error: {0}")]
    Version(String),

    #[error("Abort error: {0}")]
    Abort(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Invalid access: {0}")]
    InvalidAccess(String),

    #[error("Type error: {0}")]
    Type(String),

    #[error(transparent)]
    Transport(#[from] BridgeError),
}

impl IdbError {
    /// Classify an error reported by the engine.
    ///
    /// Engines prefix messages with a DOM-style name (`ConstraintError: ...`);
    /// anything unrecognized stays a transport error.
    pub fn from_remote(err: BridgeError) -> Self {
        let message = match err {
            BridgeError::Remote(message) => message,
            other => return IdbError::Transport(other),
        };
        let Some((name, detail)) = message.split_once(": ") else {
            return IdbError::Transport(BridgeError::Remote(message));
        };
        let detail = detail.to_string();
        match name {
            "NotFoundError" => IdbError::NotFound(detail),
            "ConstraintError" => IdbError::Constraint(detail),
            "DataError" => IdbError::Data(detail),
            "InvalidStateError" => IdbError::InvalidState(detail),
            "VersionError" => IdbError::Version(detail),
            "AbortError" => IdbError::Abort(detail),
            "ReadOnlyError" => IdbError::ReadOnly,
            "TransactionInactiveError" => IdbError::TransactionInactive,
            _ => IdbError::Transport(BridgeError::Remote(message)),
        }
    }

    /// DOM-style error name.
    pub fn name(&self) -> &'static str {
        match self {
            IdbError::NotFound(_) => "NotFoundError",
            IdbError::Constraint(_) => "ConstraintError",
            IdbError::Data(_) => "DataError",
            IdbError::InvalidState(_) => "InvalidStateError",
            IdbError::TransactionInactive => "TransactionInactiveError",
            IdbError::ReadOnly => "ReadOnlyError",
            IdbError::Version(_) => "VersionError",
            IdbError::Abort(_) => "AbortError",
            IdbError::NotSupported(_) => "NotSupportedError",
            IdbError::InvalidAccess(_) => "InvalidAccessError",
            IdbError::Type(_) => "TypeError",
            IdbError::Transport(_) => "UnknownError",
        }
    }
}

impl From<KeyError> for IdbError {
    fn from(err: KeyError) -> Self {
        IdbError::Data(err.to_string())
    }
}
