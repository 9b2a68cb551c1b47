//! A message channel that holds every envelope until the test answers it.

use qbridge_common::{BridgeConfig, BridgeError};
use qbridge_protocol::{Envelope, MessageChannel, Reply, ReplySink};
use serde_json::{json, Value as JsonValue};

use crate::bridge::Bridge;
use crate::database::Database;
use crate::factory::Factory;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
pub(crate) struct ScriptedChannel {
    posted: Mutex<Vec<(Envelope, ReplySink)>>,
    refuse: AtomicBool,
}

impl ScriptedChannel {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every later post fail.
    pub(crate) fn refuse_posts(&self) {
        self.refuse.store(true, Ordering::SeqCst);
    }

    pub(crate) fn count(&self) -> usize {
        self.posted.lock().unwrap().len()
    }

    pub(crate) fn operations(&self) -> Vec<String> {
        self.posted
            .lock()
            .unwrap()
            .iter()
            .map(|(envelope, _)| envelope.operation.clone())
            .collect()
    }

    pub(crate) fn envelope(&self, index: usize) -> Envelope {
        self.posted.lock().unwrap()[index].0.clone()
    }

    /// Index of the last envelope for `operation`.
    pub(crate) fn last(&self, operation: &str) -> usize {
        self.operations()
            .iter()
            .rposition(|op| op == operation)
            .unwrap_or_else(|| panic!("no {} was posted", operation))
    }

    /// Answer envelope `index` with a result.
    pub(crate) fn reply(&self, index: usize, result: JsonValue) -> bool {
        let (envelope, sink) = self.posted.lock().unwrap()[index].clone();
        sink.deliver(Reply::success(envelope.correlation_id, result))
    }

    /// Answer envelope `index` with an error message.
    pub(crate) fn fail(&self, index: usize, message: &str) -> bool {
        let (envelope, sink) = self.posted.lock().unwrap()[index].clone();
        sink.deliver(Reply::failure(envelope.correlation_id, message))
    }
}

impl MessageChannel for ScriptedChannel {
    fn post(&self, envelope: Envelope, replies: ReplySink) -> Result<(), BridgeError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(BridgeError::channel("channel closed"));
        }
        self.posted.lock().unwrap().push((envelope, replies));
        Ok(())
    }
}

/// Schema with an out-of-line `items` store and an in-line `notes` store
/// indexed by `tag`.
pub(crate) fn notes_metadata() -> JsonValue {
    json!({
        "name": "Notes",
        "version": 1,
        "objectStores": {
            "items": {},
            "notes": {
                "keyPath": "id",
                "indexes": {"by_tag": {"keyPath": "tag"}}
            },
            "counters": {"autoIncrement": true}
        }
    })
}

/// Open `Notes` at version 1 without an upgrade.
pub(crate) async fn open_notes(channel: &Arc<ScriptedChannel>) -> Database {
    let (factory, _events) = Factory::new(Bridge::new(BridgeConfig::default(), channel.clone()));
    let open = factory.open("Notes", Some(1)).unwrap();
    channel.reply(
        channel.last("open"),
        json!({"oldVersion": 1, "newVersion": 1, "upgrade": false, "metadata": notes_metadata()}),
    );
    open.await.unwrap()
}

/// Let spawned local tasks and deferred commit checks run.
pub(crate) async fn flush() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}
