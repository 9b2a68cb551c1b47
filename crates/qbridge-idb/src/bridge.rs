//! Transport adapter: turns one-way message posting into awaitable calls.

use qbridge_common::{with_timeout, BridgeConfig, BridgeError};
use qbridge_protocol::{Command, CorrelationId, Envelope, MessageChannel, ReplySink};
use serde_json::Value as JsonValue;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Uniform `call(command) -> deferred result` over a [`MessageChannel`].
pub struct Bridge {
    config: BridgeConfig,
    channel: Arc<dyn MessageChannel>,
    replies: ReplySink,
    next_id: AtomicU64,
}

impl Bridge {
    pub fn new(config: BridgeConfig, channel: Arc<dyn MessageChannel>) -> Arc<Self> {
        Arc::new(Self {
            config,
            channel,
            replies: ReplySink::new(),
            next_id: AtomicU64::new(1),
        })
    }

    /// Service every envelope is addressed to.
    pub fn target(&self) -> &str {
        &self.config.target
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Post `command` now and return a future for its reply.
    ///
    /// The envelope leaves before this returns, so calls reach the channel in
    /// call order. Nothing is retried.
    pub fn call(
        &self,
        command: &Command,
    ) -> impl Future<Output = Result<JsonValue, BridgeError>> + 'static {
        let id = CorrelationId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let operation = command.operation();
        let envelope = Envelope {
            target: self.config.target.clone(),
            operation: operation.to_string(),
            arguments: command.arguments(),
            correlation_id: id,
        };

        debug!(operation, correlation_id = %id, "Dispatching");
        let rx = self.replies.register(id);
        let posted = self.channel.post(envelope, self.replies.clone());
        let replies = self.replies.clone();
        let timeout = self.config.call_timeout();

        async move {
            if let Err(e) = posted {
                replies.forget(id);
                warn!(operation, correlation_id = %id, error = %e, "Channel refused envelope");
                return Err(e);
            }
            let received = match timeout {
                Some(limit) => match with_timeout(limit, || rx).await {
                    Ok(received) => received,
                    Err(e) => {
                        replies.forget(id);
                        warn!(operation, correlation_id = %id, "Call timed out");
                        return Err(e);
                    }
                },
                None => rx.await,
            };
            received.unwrap_or(Err(BridgeError::Cancelled))
        }
    }

    /// Calls still waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        self.replies.pending()
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("target", &self.config.target)
            .field("pending_calls", &self.pending_calls())
            .finish()
    }
}
