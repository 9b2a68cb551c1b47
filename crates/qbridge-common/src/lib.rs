//! # QBridge Common
//!
//! Shared error type, configuration, and logging setup for the QBridge crates.
//!
//! ## Features
//!
//! - Cloneable transport error type with categories and backtraces
//! - Bridge configuration (service target, call timeout)
//! - Logging configuration and setup
//! - Timeout helper for outstanding calls

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub mod config;
pub mod logging;
pub mod timeout;

pub use config::BridgeConfig;
pub use logging::{init_logging, LogConfig, LogFormat};
pub use timeout::with_timeout;

/// Errors raised while carrying a call to the remote engine and back.
///
/// Cloneable because one error is handed to every listener of the request it settles.
#[derive(Error, Debug, Clone)]
pub enum BridgeError {
    /// The message channel refused or lost the envelope.
    #[error("Channel error: {message}")]
    Channel { message: String },

    /// The remote engine answered with an error.
    #[error("Remote error: {0}")]
    Remote(String),

    /// An envelope or reply payload could not be encoded or decoded.
    #[error("Codec error: {0}")]
    Codec(String),

    /// No reply arrived in time.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// The reply slot was dropped before a reply arrived.
    #[error("Operation cancelled")]
    Cancelled,

    /// Configuration errors.
    #[error("Config error: {0}")]
    Config(String),

    /// Internal error (unexpected).
    #[error("Internal error: {message}")]
    Internal {
        message: String,
        backtrace: Option<Arc<backtrace::Backtrace>>,
    },
}

impl BridgeError {
    /// Create a channel error.
    pub fn channel(message: impl Into<String>) -> Self {
        Self::Channel {
            message: message.into(),
        }
    }

    /// Create a remote error.
    pub fn remote(message: impl Into<String>) -> Self {
        Self::Remote(message.into())
    }

    /// Create a codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec(message.into())
    }

    /// Create an internal error with backtrace.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            backtrace: Some(Arc::new(backtrace::Backtrace::new())),
        }
    }

    /// Check if a caller could reasonably retry the call.
    ///
    /// Nothing in QBridge retries on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BridgeError::Channel { .. } | BridgeError::Timeout(_))
    }

    /// Get the error category for logging.
    pub fn category(&self) -> &'static str {
        match self {
            BridgeError::Channel { .. } => "channel",
            BridgeError::Remote(_) => "remote",
            BridgeError::Codec(_) => "codec",
            BridgeError::Timeout(_) => "timeout",
            BridgeError::Cancelled => "cancelled",
            BridgeError::Config(_) => "config",
            BridgeError::Internal { .. } => "internal",
        }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Codec(err.to_string())
    }
}

/// Result type alias for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Extension trait for attaching codec context to decode failures.
pub trait ResultExt<T> {
    /// Convert the error into a codec error prefixed with `context`.
    fn codec_context(self, context: impl Into<String>) -> Result<T>;
}

impl<T, E: std::error::Error> ResultExt<T> for std::result::Result<T, E> {
    fn codec_context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| BridgeError::Codec(format!("{}: {}", context.into(), e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        assert_eq!(BridgeError::channel("test").category(), "channel");
        assert_eq!(BridgeError::remote("boom").category(), "remote");
        assert_eq!(
            BridgeError::Timeout(Duration::from_secs(1)).category(),
            "timeout"
        );
        assert_eq!(BridgeError::internal("oops").category(), "internal");
    }

    #[test]
    fn test_retryable() {
        assert!(BridgeError::channel("closed").is_retryable());
        assert!(BridgeError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!BridgeError::remote("constraint").is_retryable());
        assert!(!BridgeError::Cancelled.is_retryable());
    }

    #[test]
    fn test_codec_context() {
        let parsed: std::result::Result<u64, _> = "abc".parse::<u64>();
        let err = parsed.codec_context("version").unwrap_err();
        match err {
            BridgeError::Codec(msg) => assert!(msg.starts_with("version: ")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_internal_error_is_cloneable() {
        let err = BridgeError::internal("lost correlation table");
        let copy = err.clone();
        assert_eq!(copy.to_string(), "Internal error: lost correlation table");
    }
}
