//! Timeout utilities.

use std::future::Future;
use std::time::Duration;

use crate::BridgeError;

/// Run an operation with a timeout.
pub async fn with_timeout<T, F, Fut>(timeout: Duration, operation: F) -> Result<T, BridgeError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, operation())
        .await
        .map_err(|_| BridgeError::Timeout(timeout))
}
