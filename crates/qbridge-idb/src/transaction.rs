//! Transactions.
//!
//! A transaction counts its in-flight operations. When the count drops to
//! zero, every task awaiting a settled request has resumed, and no new
//! operation arrives before control returns to the scheduler, it commits on
//! its own.

use serde_json::Value as JsonValue;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::database::Database;
use crate::error::IdbError;
use crate::factory::IdbEvent;
use crate::request::{ListenerId, Listeners, Request, RequestSource};
use crate::store::ObjectStore;
use qbridge_protocol::{Command, TransactionMode};

static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(1);

/// Transaction state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Accepting operations.
    Active,
    /// Commit requested; no new operations.
    Committing,
    Complete,
    Aborted,
}

impl TransactionState {
    pub fn is_finished(self) -> bool {
        matches!(self, TransactionState::Complete | TransactionState::Aborted)
    }
}

type FinalHook = Box<dyn FnOnce(TransactionState)>;

struct TransactionInner {
    id: u64,
    mode: TransactionMode,
    scope: Vec<String>,
    state: TransactionState,
    pending: usize,
    /// Settled requests whose awaiting tasks have not resumed yet.
    holds: usize,
    commit_check_scheduled: bool,
    commit_forwarded: bool,
    error: Option<IdbError>,
    on_complete: Listeners<dyn FnMut()>,
    on_abort: Listeners<dyn FnMut(&IdbError)>,
    on_final: Vec<FinalHook>,
}

/// A database transaction.
#[derive(Clone)]
pub struct Transaction {
    inner: Rc<RefCell<TransactionInner>>,
    db: Database,
    notify: Rc<Notify>,
}

impl Transaction {
    pub(crate) fn new(db: Database, mode: TransactionMode, scope: Vec<String>) -> Self {
        Self::with_id(Self::reserve_id(), db, mode, scope)
    }

    /// Allocate an id ahead of the transaction that will carry it.
    pub(crate) fn reserve_id() -> u64 {
        NEXT_TRANSACTION_ID.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn with_id(id: u64, db: Database, mode: TransactionMode, scope: Vec<String>) -> Self {
        debug!(db = %db.name(), transaction = id, ?mode, ?scope, "Transaction created");
        let tx = Self {
            inner: Rc::new(RefCell::new(TransactionInner {
                id,
                mode,
                scope,
                state: TransactionState::Active,
                pending: 0,
                holds: 0,
                commit_check_scheduled: false,
                commit_forwarded: false,
                error: None,
                on_complete: Listeners::default(),
                on_abort: Listeners::default(),
                on_final: Vec::new(),
            })),
            db,
            notify: Rc::new(Notify::new()),
        };
        // A transaction nobody uses still has to finish.
        tx.schedule_commit_check();
        tx
    }

    pub fn id(&self) -> u64 {
        self.inner.borrow().id
    }

    pub fn mode(&self) -> TransactionMode {
        self.inner.borrow().mode
    }

    pub fn state(&self) -> TransactionState {
        self.inner.borrow().state
    }

    pub fn db(&self) -> Database {
        self.db.clone()
    }

    /// Why the transaction aborted.
    pub fn error(&self) -> Option<IdbError> {
        self.inner.borrow().error.clone()
    }

    /// Operations dispatched and not yet settled.
    pub fn pending_operations(&self) -> usize {
        self.inner.borrow().pending
    }

    /// Stores this transaction may touch.
    pub fn object_store_names(&self) -> Vec<String> {
        let inner = self.inner.borrow();
        if inner.mode == TransactionMode::VersionChange {
            self.db.object_store_names()
        } else {
            inner.scope.clone()
        }
    }

    /// Handle to a store in scope.
    pub fn object_store(&self, name: &str) -> Result<ObjectStore, IdbError> {
        if self.state().is_finished() {
            return Err(IdbError::InvalidState("transaction has finished".into()));
        }
        if !self.has_store(name) {
            return Err(IdbError::NotFound(format!(
                "object store not in transaction scope: {}",
                name
            )));
        }
        Ok(ObjectStore::new(self.clone(), name))
    }

    pub fn on_complete(&self, listener: impl FnMut() + 'static) -> ListenerId {
        self.inner.borrow_mut().on_complete.add(Box::new(listener))
    }

    pub fn on_abort(&self, listener: impl FnMut(&IdbError) + 'static) -> ListenerId {
        self.inner.borrow_mut().on_abort.add(Box::new(listener))
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut inner = self.inner.borrow_mut();
        let mut found = inner.on_complete.remove(id);
        found |= inner.on_abort.remove(id);
        found
    }

    /// Wait until the transaction completes or aborts.
    pub async fn done(&self) -> Result<(), IdbError> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let inner = self.inner.borrow();
                match inner.state {
                    TransactionState::Complete => return Ok(()),
                    TransactionState::Aborted => {
                        return Err(inner
                            .error
                            .clone()
                            .unwrap_or_else(|| IdbError::Abort("transaction was aborted".into())))
                    }
                    _ => {}
                }
            }
            notified.await;
        }
    }

    /// Commit once every in-flight operation has settled.
    pub fn commit(&self) -> Result<(), IdbError> {
        let pending = {
            let mut inner = self.inner.borrow_mut();
            if inner.state != TransactionState::Active {
                return Err(IdbError::InvalidState("transaction is not active".into()));
            }
            inner.state = TransactionState::Committing;
            inner.pending
        };
        if pending == 0 {
            self.forward_commit();
        }
        Ok(())
    }

    /// Abort. Results of operations still in flight are discarded by the engine.
    pub fn abort(&self) -> Result<(), IdbError> {
        {
            let inner = self.inner.borrow();
            if inner.state.is_finished() || inner.commit_forwarded {
                return Err(IdbError::InvalidState(
                    "transaction has already committed or aborted".into(),
                ));
            }
        }
        self.abort_internal(IdbError::Abort("transaction was aborted".into()));
        Ok(())
    }

    pub(crate) fn has_store(&self, name: &str) -> bool {
        let inner = self.inner.borrow();
        if inner.mode == TransactionMode::VersionChange {
            self.db.store_metadata(name).is_some()
        } else {
            inner.scope.iter().any(|s| s == name)
        }
    }

    pub(crate) fn ensure_active(&self) -> Result<(), IdbError> {
        match self.state() {
            TransactionState::Active => Ok(()),
            _ => Err(IdbError::TransactionInactive),
        }
    }

    pub(crate) fn ensure_writable(&self) -> Result<(), IdbError> {
        self.ensure_active()?;
        if self.mode() == TransactionMode::ReadOnly {
            return Err(IdbError::ReadOnly);
        }
        Ok(())
    }

    /// Dispatch `command` under this transaction and return its request.
    pub(crate) fn dispatch<T, H>(
        &self,
        source: RequestSource,
        command: Command,
        handler: H,
    ) -> Result<Request<T>, IdbError>
    where
        T: Clone + 'static,
        H: FnOnce(Result<JsonValue, IdbError>) -> Result<T, IdbError> + 'static,
    {
        let request = Request::new(source, Some(self.clone()));
        self.dispatch_on(&request, command, handler)?;
        Ok(request)
    }

    /// Dispatch `command` and settle `request` with the handled reply.
    ///
    /// The pending count goes up before the envelope leaves; the request's
    /// settlement brings it back down.
    pub(crate) fn dispatch_on<T, H>(
        &self,
        request: &Request<T>,
        command: Command,
        handler: H,
    ) -> Result<(), IdbError>
    where
        T: Clone + 'static,
        H: FnOnce(Result<JsonValue, IdbError>) -> Result<T, IdbError> + 'static,
    {
        self.ensure_active()?;
        request.arm(true);
        self.inner.borrow_mut().pending += 1;

        let call = self.db.bridge().call(&command);
        let request = request.clone();
        tokio::task::spawn_local(async move {
            let outcome = call.await.map_err(IdbError::from_remote);
            request.settle(handler(outcome));
        });
        Ok(())
    }

    /// One counted operation settled.
    pub(crate) fn operation_settled(&self) {
        let drained = {
            let mut inner = self.inner.borrow_mut();
            inner.pending = inner.pending.saturating_sub(1);
            (inner.pending == 0).then_some(inner.state)
        };
        match drained {
            Some(TransactionState::Active) => self.schedule_commit_check(),
            Some(TransactionState::Committing) => self.forward_commit(),
            _ => {}
        }
    }

    /// Abort after a failed operation, unless already past the point of no return.
    pub(crate) fn abort_with(&self, err: IdbError) {
        {
            let inner = self.inner.borrow();
            if inner.state.is_finished() || inner.commit_forwarded {
                return;
            }
        }
        warn!(transaction = self.id(), error = %err, "Operation failed; aborting transaction");
        self.abort_internal(err);
    }

    /// Keep the transaction from auto-committing until `count` awaiting tasks resume.
    pub(crate) fn hold(&self, count: usize) {
        if count > 0 {
            self.inner.borrow_mut().holds += count;
        }
    }

    /// One awaiting task resumed.
    pub(crate) fn release_hold(&self) {
        let idle = {
            let mut inner = self.inner.borrow_mut();
            inner.holds = inner.holds.saturating_sub(1);
            inner.holds == 0 && inner.pending == 0 && inner.state == TransactionState::Active
        };
        if idle {
            self.schedule_commit_check();
        }
    }

    /// Run `hook` when the transaction finishes, or now if it already has.
    pub(crate) fn on_final(&self, hook: impl FnOnce(TransactionState) + 'static) {
        let state = self.state();
        if state.is_finished() {
            hook(state);
        } else {
            self.inner.borrow_mut().on_final.push(Box::new(hook));
        }
    }

    fn schedule_commit_check(&self) {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.commit_check_scheduled || inner.state != TransactionState::Active {
                return;
            }
            inner.commit_check_scheduled = true;
        }
        let tx = self.clone();
        tokio::task::spawn_local(async move {
            tokio::task::yield_now().await;
            tx.run_commit_check();
        });
    }

    fn run_commit_check(&self) {
        let ready = {
            let mut inner = self.inner.borrow_mut();
            inner.commit_check_scheduled = false;
            if inner.state == TransactionState::Active && inner.pending == 0 && inner.holds == 0 {
                inner.state = TransactionState::Committing;
                true
            } else {
                false
            }
        };
        if ready {
            debug!(transaction = self.id(), "Auto-committing");
            self.forward_commit();
        }
    }

    fn forward_commit(&self) {
        let id = {
            let mut inner = self.inner.borrow_mut();
            if inner.commit_forwarded || inner.state != TransactionState::Committing {
                return;
            }
            inner.commit_forwarded = true;
            inner.id
        };
        let call = self.db.bridge().call(&Command::CommitTransaction {
            db: self.db.name(),
            transaction: id,
        });
        let tx = self.clone();
        tokio::task::spawn_local(async move {
            match call.await {
                Ok(_) => tx.finish(TransactionState::Complete, None),
                Err(e) => {
                    let err = IdbError::from_remote(e);
                    warn!(transaction = id, error = %err, "Commit failed");
                    tx.finish(TransactionState::Aborted, Some(err));
                }
            }
        });
    }

    fn abort_internal(&self, err: IdbError) {
        let id = self.id();
        let call = self.db.bridge().call(&Command::AbortTransaction {
            db: self.db.name(),
            transaction: id,
        });
        tokio::task::spawn_local(async move {
            if let Err(e) = call.await {
                warn!(transaction = id, error = %e, "Abort instruction failed");
            }
        });
        self.finish(TransactionState::Aborted, Some(err));
    }

    fn finish(&self, state: TransactionState, error: Option<IdbError>) {
        let (id, mut on_complete, mut on_abort, hooks, error) = {
            let mut inner = self.inner.borrow_mut();
            if inner.state.is_finished() {
                return;
            }
            inner.state = state;
            if error.is_some() {
                inner.error = error;
            }
            (
                inner.id,
                inner.on_complete.take(),
                inner.on_abort.take(),
                std::mem::take(&mut inner.on_final),
                inner.error.clone(),
            )
        };

        let db_name = self.db.name();
        match state {
            TransactionState::Complete => {
                debug!(db = %db_name, transaction = id, "Transaction complete");
                on_complete.iter_mut().for_each(|(_, listener)| listener());
                self.db.emit(IdbEvent::TransactionComplete {
                    db_name,
                    transaction: id,
                });
            }
            _ => {
                let err = error.unwrap_or_else(|| IdbError::Abort("transaction was aborted".into()));
                debug!(db = %db_name, transaction = id, error = %err, "Transaction aborted");
                on_abort.iter_mut().for_each(|(_, listener)| listener(&err));
                self.db.emit(IdbEvent::TransactionAborted {
                    db_name,
                    transaction: id,
                    error: err,
                });
            }
        }

        for hook in hooks {
            hook(state);
        }
        self.notify.notify_waiters();
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.inner.try_borrow() {
            Ok(inner) => f
                .debug_struct("Transaction")
                .field("id", &inner.id)
                .field("mode", &inner.mode)
                .field("state", &inner.state)
                .field("pending", &inner.pending)
                .finish(),
            Err(_) => f.debug_struct("Transaction").finish_non_exhaustive(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{flush, open_notes, ScriptedChannel};
    use serde_json::json;
    use std::cell::Cell;
    use tokio::task::LocalSet;

    fn counter() -> (Rc<Cell<u32>>, Rc<Cell<u32>>) {
        let count = Rc::new(Cell::new(0));
        (count.clone(), count)
    }

    #[tokio::test]
    async fn test_complete_fires_once_after_out_of_order_settlement() {
        LocalSet::new()
            .run_until(async {
                let channel = ScriptedChannel::new();
                let db = open_notes(&channel).await;
                let tx = db.transaction(["items"], TransactionMode::ReadOnly).unwrap();
                let store = tx.object_store("items").unwrap();
                let first = store.get("a").unwrap();
                let second = store.get("b").unwrap();

                let (completions, seen) = counter();
                tx.on_complete(move || seen.set(seen.get() + 1));

                flush().await;
                assert_eq!(tx.pending_operations(), 2);
                let last_get = channel.last("get");

                channel.reply(last_get, json!("B"));
                flush().await;
                assert_eq!(second.result(), Some(Some(json!("B"))));
                assert_eq!(tx.state(), TransactionState::Active);
                assert!(!channel.operations().contains(&"commitTransaction".to_string()));

                channel.reply(last_get - 1, json!(null));
                flush().await;
                assert_eq!(first.result(), Some(None));
                let commit = channel.last("commitTransaction");
                assert_eq!(channel.envelope(commit).arguments, vec![json!("Notes"), json!(tx.id())]);
                assert_eq!(completions.get(), 0);

                channel.reply(commit, json!("OK"));
                flush().await;
                assert_eq!(completions.get(), 1);
                assert_eq!(tx.state(), TransactionState::Complete);
                tx.done().await.unwrap();
            })
            .await;
    }

    #[tokio::test]
    async fn test_operation_error_aborts_transaction() {
        LocalSet::new()
            .run_until(async {
                let channel = ScriptedChannel::new();
                let db = open_notes(&channel).await;
                let tx = db.transaction(["items"], TransactionMode::ReadWrite).unwrap();
                let store = tx.object_store("items").unwrap();
                let failing = store.add(json!("x"), Some(json!(1))).unwrap();
                let other = store.put(json!("y"), Some(json!(2))).unwrap();

                let (aborts, seen) = counter();
                tx.on_abort(move |_| seen.set(seen.get() + 1));

                channel.fail(channel.last("add"), "ConstraintError: Key already exists: 1");
                flush().await;

                assert!(matches!(failing.error(), Some(IdbError::Constraint(_))));
                assert_eq!(tx.state(), TransactionState::Aborted);
                assert!(matches!(tx.error(), Some(IdbError::Constraint(_))));
                assert_eq!(aborts.get(), 1);
                let abort = channel.last("abortTransaction");
                assert_eq!(channel.envelope(abort).arguments[1], json!(tx.id()));

                // The straggler still settles and still counts down.
                channel.reply(channel.last("put"), json!("OK"));
                flush().await;
                assert_eq!(other.result(), Some(()));
                assert_eq!(tx.pending_operations(), 0);
                assert_eq!(aborts.get(), 1);
                assert!(!channel.operations().contains(&"commitTransaction".to_string()));
                assert!(matches!(tx.done().await, Err(IdbError::Constraint(_))));
            })
            .await;
    }

    #[tokio::test]
    async fn test_finished_transaction_rejects_operations_without_dispatch() {
        LocalSet::new()
            .run_until(async {
                let channel = ScriptedChannel::new();
                let db = open_notes(&channel).await;
                let tx = db.transaction(["items"], TransactionMode::ReadWrite).unwrap();
                let store = tx.object_store("items").unwrap();
                tx.abort().unwrap();

                let posted = channel.count();
                assert!(matches!(store.get("a"), Err(IdbError::TransactionInactive)));
                assert!(matches!(
                    store.put(json!(1), Some(json!("a"))),
                    Err(IdbError::TransactionInactive)
                ));
                assert!(matches!(tx.object_store("items"), Err(IdbError::InvalidState(_))));
                assert!(matches!(tx.abort(), Err(IdbError::InvalidState(_))));
                assert!(matches!(tx.commit(), Err(IdbError::InvalidState(_))));
                assert_eq!(channel.count(), posted);
                assert!(matches!(tx.done().await, Err(IdbError::Abort(_))));
            })
            .await;
    }

    #[tokio::test]
    async fn test_read_only_rejects_writes() {
        LocalSet::new()
            .run_until(async {
                let channel = ScriptedChannel::new();
                let db = open_notes(&channel).await;
                let tx = db.transaction(["items"], TransactionMode::ReadOnly).unwrap();
                let store = tx.object_store("items").unwrap();
                let posted = channel.count();

                assert!(matches!(store.put(json!(1), Some(json!("a"))), Err(IdbError::ReadOnly)));
                assert!(matches!(store.add(json!(1), Some(json!("a"))), Err(IdbError::ReadOnly)));
                assert!(matches!(store.delete("a"), Err(IdbError::ReadOnly)));
                assert!(matches!(store.clear(), Err(IdbError::ReadOnly)));
                assert!(matches!(
                    store.import_chunk(Vec::new(), Default::default()),
                    Err(IdbError::ReadOnly)
                ));
                assert_eq!(channel.count(), posted);
            })
            .await;
    }

    #[tokio::test]
    async fn test_explicit_commit_waits_for_pending_operations() {
        LocalSet::new()
            .run_until(async {
                let channel = ScriptedChannel::new();
                let db = open_notes(&channel).await;
                let tx = db.transaction(["items"], TransactionMode::ReadOnly).unwrap();
                let store = tx.object_store("items").unwrap();
                let get = store.get("a").unwrap();

                tx.commit().unwrap();
                assert_eq!(tx.state(), TransactionState::Committing);
                assert!(matches!(store.count(None), Err(IdbError::TransactionInactive)));
                flush().await;
                assert!(!channel.operations().contains(&"commitTransaction".to_string()));

                channel.reply(channel.last("get"), json!({"v": 1}));
                flush().await;
                assert_eq!(get.result(), Some(Some(json!({"v": 1}))));
                channel.reply(channel.last("commitTransaction"), json!("OK"));
                tx.done().await.unwrap();
            })
            .await;
    }

    #[tokio::test]
    async fn test_empty_transaction_commits_on_its_own() {
        LocalSet::new()
            .run_until(async {
                let channel = ScriptedChannel::new();
                let db = open_notes(&channel).await;
                let tx = db.transaction(["items", "items"], TransactionMode::ReadOnly).unwrap();
                assert_eq!(tx.object_store_names(), vec!["items".to_string()]);

                flush().await;
                assert_eq!(tx.state(), TransactionState::Committing);
                channel.reply(channel.last("commitTransaction"), json!("OK"));
                tx.done().await.unwrap();
            })
            .await;
    }

    #[tokio::test]
    async fn test_operation_issued_from_listener_keeps_transaction_open() {
        LocalSet::new()
            .run_until(async {
                let channel = ScriptedChannel::new();
                let db = open_notes(&channel).await;
                let tx = db.transaction(["items"], TransactionMode::ReadOnly).unwrap();
                let store = tx.object_store("items").unwrap();
                let first = store.get("a").unwrap();

                let follow_up = Rc::new(RefCell::new(None));
                let slot = follow_up.clone();
                first.on_success(move |_| {
                    *slot.borrow_mut() = Some(store.get("b").unwrap());
                });

                channel.reply(channel.last("get"), json!(null));
                flush().await;
                assert!(follow_up.borrow().is_some());
                assert_eq!(tx.pending_operations(), 1);
                assert_eq!(tx.state(), TransactionState::Active);
                assert!(!channel.operations().contains(&"commitTransaction".to_string()));

                channel.reply(channel.last("get"), json!("b"));
                flush().await;
                channel.reply(channel.last("commitTransaction"), json!("OK"));
                tx.done().await.unwrap();
            })
            .await;
    }

    #[tokio::test]
    async fn test_failed_commit_aborts() {
        LocalSet::new()
            .run_until(async {
                let channel = ScriptedChannel::new();
                let db = open_notes(&channel).await;
                let tx = db.transaction(["items"], TransactionMode::ReadWrite).unwrap();
                tx.commit().unwrap();
                channel.fail(channel.last("commitTransaction"), "disk full");
                let err = tx.done().await.unwrap_err();
                assert!(matches!(err, IdbError::Transport(_)));
                assert_eq!(tx.state(), TransactionState::Aborted);
            })
            .await;
    }

    #[tokio::test]
    async fn test_awaited_write_leaves_room_for_next_operation() {
        LocalSet::new()
            .run_until(async {
                let channel = ScriptedChannel::new();
                let db = open_notes(&channel).await;
                let tx = db.transaction(["items"], TransactionMode::ReadWrite).unwrap();
                let store = tx.object_store("items").unwrap();

                let put = store.put(json!("hi"), Some(json!("a"))).unwrap();
                channel.reply(channel.last("put"), json!("OK"));
                put.await.unwrap();

                // No flush: the read goes out right after the write resumes.
                let get = store.get("a").unwrap();
                assert_eq!(tx.state(), TransactionState::Active);
                channel.reply(channel.last("get"), json!("hi"));
                assert_eq!(get.await.unwrap(), Some(json!("hi")));

                flush().await;
                assert_eq!(tx.state(), TransactionState::Committing);
                channel.reply(channel.last("commitTransaction"), json!("OK"));
                tx.done().await.unwrap();
            })
            .await;
    }

    #[tokio::test]
    async fn test_removed_listener_is_not_called() {
        LocalSet::new()
            .run_until(async {
                let channel = ScriptedChannel::new();
                let db = open_notes(&channel).await;
                let tx = db.transaction(["items"], TransactionMode::ReadOnly).unwrap();
                let (completions, seen) = counter();
                let id = tx.on_complete(move || seen.set(seen.get() + 1));
                assert!(tx.remove_listener(id));
                assert!(!tx.remove_listener(id));

                flush().await;
                channel.reply(channel.last("commitTransaction"), json!("OK"));
                tx.done().await.unwrap();
                assert_eq!(completions.get(), 0);
            })
            .await;
    }
}
