//! The message channel seam and the correlation table behind it.

use hashbrown::HashMap;
use qbridge_common::BridgeError;
use serde_json::Value as JsonValue;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tracing::{trace, warn};

use crate::envelope::{CorrelationId, Envelope, Reply};

/// Outcome delivered to one waiting call.
pub type CallOutcome = Result<JsonValue, BridgeError>;

/// One-way asynchronous message channel to a remote engine.
///
/// `post` hands the envelope over and returns without waiting. The remote
/// side answers exactly once per envelope through the [`ReplySink`], from any
/// thread and in any order.
pub trait MessageChannel: Send + Sync {
    fn post(&self, envelope: Envelope, replies: ReplySink) -> Result<(), BridgeError>;
}

/// Table of outstanding calls keyed by correlation id.
#[derive(Clone, Default)]
pub struct ReplySink {
    pending: Arc<Mutex<HashMap<CorrelationId, oneshot::Sender<CallOutcome>>>>,
}

impl ReplySink {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<CorrelationId, oneshot::Sender<CallOutcome>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a call and get the receiver its outcome will arrive on.
    pub fn register(&self, id: CorrelationId) -> oneshot::Receiver<CallOutcome> {
        let (tx, rx) = oneshot::channel();
        if self.table().insert(id, tx).is_some() {
            warn!(correlation_id = %id, "Correlation id reused; previous call dropped");
        }
        rx
    }

    /// Drop a call without settling it. Returns whether it was outstanding.
    pub fn forget(&self, id: CorrelationId) -> bool {
        self.table().remove(&id).is_some()
    }

    /// Route a reply to its call. Returns false for unknown or late replies.
    pub fn deliver(&self, reply: Reply) -> bool {
        let id = reply.correlation_id;
        self.settle(id, reply.into_outcome())
    }

    /// Settle a call with a local failure.
    pub fn fail(&self, id: CorrelationId, error: BridgeError) -> bool {
        self.settle(id, Err(error))
    }

    fn settle(&self, id: CorrelationId, outcome: CallOutcome) -> bool {
        let slot = self.table().remove(&id);
        match slot {
            Some(tx) => {
                trace!(correlation_id = %id, "Reply delivered");
                if tx.send(outcome).is_err() {
                    trace!(correlation_id = %id, "Caller stopped waiting");
                }
                true
            }
            None => {
                warn!(correlation_id = %id, "Reply for unknown or expired call");
                false
            }
        }
    }

    /// Number of calls still waiting for a reply.
    pub fn pending(&self) -> usize {
        self.table().len()
    }
}

impl std::fmt::Debug for ReplySink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplySink")
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_deliver_routes_by_correlation_id() {
        let sink = ReplySink::new();
        let first = sink.register(CorrelationId::new(1));
        let second = sink.register(CorrelationId::new(2));
        assert_eq!(sink.pending(), 2);

        assert!(sink.deliver(Reply::success(CorrelationId::new(2), json!("two"))));
        assert!(sink.deliver(Reply::failure(CorrelationId::new(1), "nope")));

        assert_eq!(second.await.unwrap().unwrap(), json!("two"));
        assert!(matches!(first.await.unwrap(), Err(BridgeError::Remote(m)) if m == "nope"));
        assert_eq!(sink.pending(), 0);
    }

    #[test]
    fn test_unknown_reply_is_rejected() {
        let sink = ReplySink::new();
        assert!(!sink.deliver(Reply::success(CorrelationId::new(9), json!(null))));
    }

    #[test]
    fn test_second_reply_is_rejected() {
        let sink = ReplySink::new();
        let _rx = sink.register(CorrelationId::new(3));
        assert!(sink.deliver(Reply::success(CorrelationId::new(3), json!(1))));
        assert!(!sink.deliver(Reply::success(CorrelationId::new(3), json!(2))));
    }

    #[tokio::test]
    async fn test_forget_and_fail() {
        let sink = ReplySink::new();
        let _dropped = sink.register(CorrelationId::new(4));
        assert!(sink.forget(CorrelationId::new(4)));
        assert!(!sink.forget(CorrelationId::new(4)));

        let rx = sink.register(CorrelationId::new(5));
        assert!(sink.fail(CorrelationId::new(5), BridgeError::channel("closed")));
        assert!(matches!(rx.await.unwrap(), Err(BridgeError::Channel { .. })));
    }
}
