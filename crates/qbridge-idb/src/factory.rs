//! The database factory: open, delete, and list databases.

use serde_json::Value as JsonValue;
use std::cell::RefCell;
use std::cmp::Ordering;
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::bridge::Bridge;
use crate::database::Database;
use crate::error::IdbError;
use crate::request::{dispatch_detached, ListenerId, Listeners, Request, RequestSource};
use crate::store::parse_reply;
use crate::transaction::{Transaction, TransactionState};
use qbridge_common::BridgeConfig;
use qbridge_protocol::{compare, Command, DatabaseInfo, DatabaseMetadata, MessageChannel, OpenReply};

/// Factory events.
#[derive(Debug, Clone)]
pub enum IdbEvent {
    /// Database opened.
    Opened { db_name: String, version: u64 },
    /// Upgrade needed.
    UpgradeNeeded {
        db_name: String,
        old_version: u64,
        new_version: u64,
    },
    /// Open failed.
    OpenFailed { db_name: String, error: IdbError },
    /// Database deleted.
    Deleted { db_name: String },
    /// Connection closed.
    Closed { db_name: String },
    TransactionComplete { db_name: String, transaction: u64 },
    TransactionAborted {
        db_name: String,
        transaction: u64,
        error: IdbError,
    },
}

/// Passed to upgrade listeners.
#[derive(Debug, Clone)]
pub struct UpgradeEvent {
    pub old_version: u64,
    pub new_version: u64,
    pub database: Database,
    pub transaction: Transaction,
}

/// Request returned by [`Factory::open`].
///
/// Settles with the database once any upgrade has completed.
#[derive(Clone)]
pub struct OpenRequest {
    request: Request<Database>,
    upgrade_listeners: Rc<RefCell<Listeners<dyn FnMut(&UpgradeEvent)>>>,
}

impl OpenRequest {
    /// Run `listener` when the open needs an upgrade.
    ///
    /// Schema changes made inside the listener belong to the upgrade
    /// transaction, which commits once they have all settled.
    pub fn on_upgrade_needed(&self, listener: impl FnMut(&UpgradeEvent) + 'static) -> ListenerId {
        self.upgrade_listeners.borrow_mut().add(Box::new(listener))
    }

    pub fn on_success(&self, listener: impl FnMut(&Database) + 'static) -> ListenerId {
        self.request.on_success(listener)
    }

    pub fn on_error(&self, listener: impl FnMut(&IdbError) + 'static) -> ListenerId {
        self.request.on_error(listener)
    }

    /// Remove an upgrade, success or error listener.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.upgrade_listeners.borrow_mut().remove(id) || self.request.remove_listener(id)
    }

    pub fn request(&self) -> &Request<Database> {
        &self.request
    }

    pub async fn outcome(&self) -> Result<Database, IdbError> {
        self.request.outcome().await
    }

    fn fire_upgrade(&self, event: &UpgradeEvent) {
        let mut listeners = self.upgrade_listeners.borrow_mut().take();
        listeners.iter_mut().for_each(|(_, listener)| listener(event));
        self.upgrade_listeners.borrow_mut().restore(listeners);
    }
}

impl IntoFuture for OpenRequest {
    type Output = Result<Database, IdbError>;
    type IntoFuture = Pin<Box<dyn Future<Output = Result<Database, IdbError>>>>;

    fn into_future(self) -> Self::IntoFuture {
        self.request.into_future()
    }
}

impl std::fmt::Debug for OpenRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenRequest")
            .field("request", &self.request)
            .finish()
    }
}

/// Entry point of the client (`indexedDB`).
///
/// Every handle it produces is single-threaded and continues its work on
/// `tokio::task::spawn_local`, so use it from inside a `LocalSet`.
#[derive(Clone)]
pub struct Factory {
    bridge: Arc<Bridge>,
    events: mpsc::UnboundedSender<IdbEvent>,
}

impl Factory {
    /// Create a factory and the stream of its events.
    pub fn new(bridge: Arc<Bridge>) -> (Self, mpsc::UnboundedReceiver<IdbEvent>) {
        let (events, event_rx) = mpsc::unbounded_channel();
        (Self { bridge, events }, event_rx)
    }

    /// Create a factory talking over `channel`.
    pub fn with_channel(
        config: BridgeConfig,
        channel: Arc<dyn MessageChannel>,
    ) -> (Self, mpsc::UnboundedReceiver<IdbEvent>) {
        Self::new(Bridge::new(config, channel))
    }

    pub fn bridge(&self) -> &Arc<Bridge> {
        &self.bridge
    }

    /// Open a database, upgrading it when `version` is above the stored one.
    ///
    /// `None` opens the current version, or 1 for a new database.
    pub fn open(&self, name: &str, version: Option<u64>) -> Result<OpenRequest, IdbError> {
        if version == Some(0) {
            return Err(IdbError::Type("version must be positive".into()));
        }

        let open = OpenRequest {
            request: Request::new(RequestSource::Factory, None),
            upgrade_listeners: Rc::new(RefCell::new(Listeners::default())),
        };
        // The engine ties the version change to this id.
        let upgrade_id = Transaction::reserve_id();
        let call = self.bridge.call(&Command::Open {
            name: name.to_string(),
            version,
            transaction: Some(upgrade_id),
        });
        let factory = self.clone();
        let pending = open.clone();
        let name = name.to_string();
        tokio::task::spawn_local(async move {
            let outcome = call
                .await
                .map_err(IdbError::from_remote)
                .and_then(|reply| OpenReply::parse(reply).map_err(IdbError::from));
            match outcome {
                Ok(reply) => factory.opened(&name, version, upgrade_id, reply, pending),
                Err(err) => factory.open_failed(&name, err, &pending.request),
            }
        });
        Ok(open)
    }

    /// Delete a database and everything in it.
    pub fn delete_database(&self, name: &str) -> Request<()> {
        let events = self.events.clone();
        let db_name = name.to_string();
        dispatch_detached(
            &self.bridge,
            Command::DeleteDatabase {
                name: name.to_string(),
            },
            move |outcome| {
                outcome?;
                info!(db = %db_name, "Database deleted");
                let _ = events.send(IdbEvent::Deleted { db_name });
                Ok(())
            },
        )
    }

    /// Names and versions of every database.
    pub fn databases(&self) -> Request<Vec<DatabaseInfo>> {
        dispatch_detached(&self.bridge, Command::Databases, |outcome| {
            outcome.and_then(parse_reply)
        })
    }

    /// Delete every database.
    pub fn delete_all_databases(&self) -> Request<()> {
        dispatch_detached(&self.bridge, Command::DeleteAllDatabases, |outcome| {
            outcome.map(|_: JsonValue| ())
        })
    }

    /// Compare two keys.
    pub fn cmp(&self, a: &JsonValue, b: &JsonValue) -> Result<Ordering, IdbError> {
        Ok(compare(a, b)?)
    }

    fn opened(
        &self,
        name: &str,
        requested: Option<u64>,
        upgrade_id: u64,
        reply: OpenReply,
        open: OpenRequest,
    ) {
        if reply.new_version < reply.old_version {
            let err = IdbError::Version(format!(
                "version {} is below the stored version {}",
                reply.new_version, reply.old_version
            ));
            self.open_failed(name, err, &open.request);
            return;
        }

        let mut metadata = reply
            .metadata
            .clone()
            .unwrap_or_else(|| DatabaseMetadata::new(name, reply.new_version));
        metadata.name = name.to_string();
        metadata.version = reply.new_version;
        let db = Database::new(self.bridge.clone(), self.events.clone(), metadata);

        let requested = requested.unwrap_or(reply.new_version);
        if !(reply.upgrade || requested > reply.old_version) {
            info!(db = %name, version = reply.new_version, "Database opened");
            self.emit(IdbEvent::Opened {
                db_name: name.to_string(),
                version: reply.new_version,
            });
            open.request.settle(Ok(db));
            return;
        }

        info!(
            db = %name,
            old_version = reply.old_version,
            new_version = reply.new_version,
            "Upgrade needed"
        );
        let tx = db.begin_upgrade(upgrade_id);
        let factory = self.clone();
        let upgraded = db.clone();
        let request = open.request.clone();
        let db_name = name.to_string();
        let version = reply.new_version;
        tx.on_final(move |state| {
            let close_requested = upgraded.end_upgrade();
            match state {
                TransactionState::Complete if !close_requested => {
                    info!(db = %db_name, version, "Database opened");
                    factory.emit(IdbEvent::Opened {
                        db_name,
                        version,
                    });
                    request.settle(Ok(upgraded));
                }
                _ => {
                    upgraded.force_close();
                    let err = IdbError::Abort("the version change transaction was aborted".into());
                    factory.open_failed(&db_name, err, &request);
                }
            }
        });

        self.emit(IdbEvent::UpgradeNeeded {
            db_name: name.to_string(),
            old_version: reply.old_version,
            new_version: reply.new_version,
        });
        open.fire_upgrade(&UpgradeEvent {
            old_version: reply.old_version,
            new_version: reply.new_version,
            database: db,
            transaction: tx,
        });
    }

    fn open_failed(&self, name: &str, err: IdbError, request: &Request<Database>) {
        warn!(db = %name, error = %err, "Open failed");
        self.emit(IdbEvent::OpenFailed {
            db_name: name.to_string(),
            error: err.clone(),
        });
        request.settle(Err(err));
    }

    fn emit(&self, event: IdbEvent) {
        let _ = self.events.send(event);
    }
}

impl std::fmt::Debug for Factory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Factory").field("bridge", &self.bridge).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{flush, ScriptedChannel};
    use qbridge_protocol::{ObjectStoreOptions, TransactionMode};
    use serde_json::json;
    use tokio::task::LocalSet;

    fn factory(channel: &Arc<ScriptedChannel>) -> (Factory, mpsc::UnboundedReceiver<IdbEvent>) {
        Factory::with_channel(BridgeConfig::default(), channel.clone())
    }

    fn drain(events: &mut mpsc::UnboundedReceiver<IdbEvent>) -> Vec<IdbEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn test_upgrade_creates_store_then_opens() {
        LocalSet::new()
            .run_until(async {
                let channel = ScriptedChannel::new();
                let (factory, mut events) = factory(&channel);
                let open = factory.open("Notes", Some(1)).unwrap();
                let arguments = channel.envelope(0).arguments;
                assert_eq!(arguments[..2], [json!("Notes"), json!(1)]);
                let upgrade_id = arguments[2].as_u64().unwrap();

                let versions = Rc::new(RefCell::new(None));
                let seen = versions.clone();
                open.on_upgrade_needed(move |event| {
                    *seen.borrow_mut() = Some((event.old_version, event.new_version));
                    assert_eq!(event.transaction.id(), upgrade_id);
                    assert_eq!(event.transaction.mode(), TransactionMode::VersionChange);
                    let store = event
                        .database
                        .create_object_store("items", ObjectStoreOptions::default())
                        .unwrap();
                    assert_eq!(store.name(), "items");
                });

                channel.reply(0, json!({"oldVersion": 0, "newVersion": 1, "upgrade": true}));
                flush().await;
                assert_eq!(*versions.borrow(), Some((0, 1)));
                let create = channel.last("createObjectStore");
                assert_eq!(
                    channel.envelope(create).arguments,
                    vec![json!("Notes"), json!("items"), json!({"keyPath": null, "autoIncrement": false})]
                );
                assert!(!channel.operations().contains(&"commitTransaction".to_string()));

                channel.reply(create, json!({"storeCreated": "items"}));
                flush().await;
                let commit = channel.last("commitTransaction");
                assert_eq!(channel.envelope(commit).arguments, vec![json!("Notes"), json!(upgrade_id)]);
                channel.reply(commit, json!("OK"));

                let db = open.await.unwrap();
                assert_eq!(db.version(), 1);
                assert_eq!(db.object_store_names(), vec!["items"]);
                assert!(db.upgrade_transaction().is_none());

                let events = drain(&mut events);
                assert!(matches!(events[0], IdbEvent::UpgradeNeeded { old_version: 0, new_version: 1, .. }));
                assert!(matches!(events[1], IdbEvent::TransactionComplete { .. }));
                assert!(matches!(events[2], IdbEvent::Opened { version: 1, .. }));
            })
            .await;
    }

    #[tokio::test]
    async fn test_failed_upgrade_fails_open_and_closes() {
        LocalSet::new()
            .run_until(async {
                let channel = ScriptedChannel::new();
                let (factory, _events) = factory(&channel);
                let open = factory.open("Notes", Some(2)).unwrap();
                open.on_upgrade_needed(|event| {
                    event
                        .database
                        .create_object_store("items", ObjectStoreOptions::default())
                        .unwrap();
                });

                channel.reply(0, json!({"oldVersion": 1, "newVersion": 2, "upgrade": true}));
                flush().await;
                channel.fail(
                    channel.last("createObjectStore"),
                    "ConstraintError: Object store already exists: items",
                );

                let err = open.await.unwrap_err();
                assert!(matches!(err, IdbError::Abort(_)));
                let ops = channel.operations();
                let abort = ops.iter().position(|op| op == "abortTransaction").unwrap();
                let close = ops.iter().position(|op| op == "close").unwrap();
                assert!(abort < close);
            })
            .await;
    }

    #[tokio::test]
    async fn test_open_without_upgrade() {
        LocalSet::new()
            .run_until(async {
                let channel = ScriptedChannel::new();
                let (factory, _events) = factory(&channel);
                let open = factory.open("Notes", None).unwrap();
                let arguments = channel.envelope(0).arguments;
                assert_eq!(arguments[..2], [json!("Notes"), json!(null)]);
                assert!(arguments[2].is_u64());

                let upgraded = Rc::new(RefCell::new(false));
                let flag = upgraded.clone();
                open.on_upgrade_needed(move |_| *flag.borrow_mut() = true);

                channel.reply(
                    0,
                    json!({
                        "oldVersion": 3,
                        "newVersion": 3,
                        "upgrade": false,
                        "metadata": {"name": "Notes", "version": 3, "objectStores": {"items": {}}}
                    }),
                );
                let db = open.await.unwrap();
                assert!(!*upgraded.borrow());
                assert_eq!(db.version(), 3);
                assert_eq!(db.object_store_names(), vec!["items"]);
            })
            .await;
    }

    #[tokio::test]
    async fn test_removed_upgrade_listener_is_skipped() {
        LocalSet::new()
            .run_until(async {
                let channel = ScriptedChannel::new();
                let (factory, _events) = factory(&channel);
                let open = factory.open("Notes", Some(1)).unwrap();

                let calls = Rc::new(RefCell::new(Vec::new()));
                let first = calls.clone();
                let kept = open.on_upgrade_needed(move |_| first.borrow_mut().push("kept"));
                let second = calls.clone();
                let removed = open.on_upgrade_needed(move |_| second.borrow_mut().push("removed"));
                assert!(open.remove_listener(removed));
                assert!(!open.remove_listener(removed));
                assert_ne!(kept, removed);

                channel.reply(0, json!({"oldVersion": 0, "newVersion": 1, "upgrade": true}));
                flush().await;
                channel.reply(channel.last("commitTransaction"), json!("OK"));
                open.await.unwrap();
                assert_eq!(*calls.borrow(), vec!["kept"]);
            })
            .await;
    }

    #[tokio::test]
    async fn test_version_errors() {
        LocalSet::new()
            .run_until(async {
                let channel = ScriptedChannel::new();
                let (factory, mut events) = factory(&channel);

                assert!(matches!(factory.open("Notes", Some(0)), Err(IdbError::Type(_))));
                assert_eq!(channel.count(), 0);

                let lower = factory.open("Notes", Some(1)).unwrap();
                channel.fail(0, "VersionError: Requested version 1 is less than current version 2");
                assert!(matches!(lower.await, Err(IdbError::Version(_))));

                let backwards = factory.open("Notes", None).unwrap();
                channel.reply(1, json!({"oldVersion": 3, "newVersion": 2}));
                assert!(matches!(backwards.await, Err(IdbError::Version(_))));

                let garbage = factory.open("Notes", None).unwrap();
                channel.reply(2, json!("OK"));
                assert!(matches!(garbage.await, Err(IdbError::Transport(_))));

                let failures = drain(&mut events)
                    .into_iter()
                    .filter(|e| matches!(e, IdbEvent::OpenFailed { .. }))
                    .count();
                assert_eq!(failures, 3);
            })
            .await;
    }

    #[tokio::test]
    async fn test_delete_and_list() {
        LocalSet::new()
            .run_until(async {
                let channel = ScriptedChannel::new();
                let (factory, mut events) = factory(&channel);

                let listed = factory.databases();
                channel.reply(0, json!([{"name": "Notes", "version": 2}]));
                assert_eq!(
                    listed.await.unwrap(),
                    vec![DatabaseInfo {
                        name: "Notes".into(),
                        version: 2
                    }]
                );

                let deleted = factory.delete_database("Notes");
                channel.reply(1, json!("OK"));
                deleted.await.unwrap();
                assert!(matches!(
                    drain(&mut events).as_slice(),
                    [IdbEvent::Deleted { db_name }] if db_name == "Notes"
                ));

                let wiped = factory.delete_all_databases();
                channel.fail(2, "UnknownError: busy");
                assert!(wiped.await.is_err());
            })
            .await;
    }

    #[test]
    fn test_cmp() {
        let channel = ScriptedChannel::new();
        let (factory, _events) = factory(&channel);
        assert_eq!(factory.cmp(&json!(1), &json!("a")).unwrap(), Ordering::Less);
        assert_eq!(factory.cmp(&json!([1, 2]), &json!([1, 2])).unwrap(), Ordering::Equal);
        assert!(matches!(factory.cmp(&json!(true), &json!(1)), Err(IdbError::Data(_))));
    }
}
