//! Requests: single-shot handles for asynchronous operation results.

use serde_json::Value as JsonValue;
use std::cell::RefCell;
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Notify;
use tracing::warn;

use crate::bridge::Bridge;
use crate::error::IdbError;
use crate::transaction::Transaction;
use qbridge_protocol::Command;

/// Request ready state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Pending,
    Done,
}

/// What a request was issued against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestSource {
    /// Factory-level operation (open, delete, list).
    Factory,
    ObjectStore { store: String },
    Index { store: String, index: String },
}

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Handle returned when a listener is added; pass it back to remove the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    pub(crate) fn next() -> Self {
        Self(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Listeners tagged with the id that removes them.
pub(crate) struct Listeners<F: ?Sized> {
    entries: Vec<(ListenerId, Box<F>)>,
    /// Ids of the entries taken out for dispatch.
    dispatching: Vec<ListenerId>,
    /// Ids removed while their entries were out.
    removed: Vec<ListenerId>,
}

impl<F: ?Sized> Default for Listeners<F> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            dispatching: Vec::new(),
            removed: Vec::new(),
        }
    }
}

impl<F: ?Sized> Listeners<F> {
    pub(crate) fn add(&mut self, listener: Box<F>) -> ListenerId {
        let id = ListenerId::next();
        self.entries.push((id, listener));
        id
    }

    pub(crate) fn remove(&mut self, id: ListenerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry, _)| *entry != id);
        if self.entries.len() != before {
            return true;
        }
        if self.dispatching.contains(&id) && !self.removed.contains(&id) {
            self.removed.push(id);
            return true;
        }
        false
    }

    /// Take the entries out so they can run without a borrow held.
    pub(crate) fn take(&mut self) -> Vec<(ListenerId, Box<F>)> {
        let entries = std::mem::take(&mut self.entries);
        self.dispatching = entries.iter().map(|(id, _)| *id).collect();
        entries
    }

    /// Put dispatched entries back ahead of any added meanwhile, minus removed ones.
    pub(crate) fn restore(&mut self, mut dispatched: Vec<(ListenerId, Box<F>)>) {
        let removed = std::mem::take(&mut self.removed);
        self.dispatching.clear();
        dispatched.retain(|(id, _)| !removed.contains(id));
        dispatched.append(&mut self.entries);
        self.entries = dispatched;
    }
}

struct RequestState<T> {
    ready: ReadyState,
    outcome: Option<Result<T, IdbError>>,
    on_success: Listeners<dyn FnMut(&T)>,
    on_error: Listeners<dyn FnMut(&IdbError)>,
    transaction: Option<Transaction>,
    /// Counted in the owning transaction's pending operations.
    counted: bool,
    /// Tasks blocked in `outcome()` since the last settlement.
    waiters: usize,
    /// Bumped on every settlement.
    epoch: u64,
}

/// Handle for the result of one asynchronous operation.
///
/// Listeners persist: a cursor request settles again after every
/// `continue`, and each settlement reaches every listener. Awaiting a request
/// yields its current outcome, or the next one while it is pending.
pub struct Request<T> {
    state: Rc<RefCell<RequestState<T>>>,
    notify: Rc<Notify>,
    source: Rc<RequestSource>,
}

impl<T> Clone for Request<T> {
    fn clone(&self) -> Self {
        Self {
            state: Rc::clone(&self.state),
            notify: Rc::clone(&self.notify),
            source: Rc::clone(&self.source),
        }
    }
}

impl<T: Clone + 'static> Request<T> {
    pub(crate) fn new(source: RequestSource, transaction: Option<Transaction>) -> Self {
        Self {
            state: Rc::new(RefCell::new(RequestState {
                ready: ReadyState::Pending,
                outcome: None,
                on_success: Listeners::default(),
                on_error: Listeners::default(),
                transaction,
                counted: false,
                waiters: 0,
                epoch: 0,
            })),
            notify: Rc::new(Notify::new()),
            source: Rc::new(source),
        }
    }

    pub fn ready_state(&self) -> ReadyState {
        self.state.borrow().ready
    }

    pub fn source(&self) -> &RequestSource {
        &self.source
    }

    pub fn transaction(&self) -> Option<Transaction> {
        self.state.borrow().transaction.clone()
    }

    /// Successful result, once done.
    pub fn result(&self) -> Option<T> {
        let state = self.state.borrow();
        match (&state.ready, &state.outcome) {
            (ReadyState::Done, Some(Ok(value))) => Some(value.clone()),
            _ => None,
        }
    }

    /// Failure, once done.
    pub fn error(&self) -> Option<IdbError> {
        let state = self.state.borrow();
        match (&state.ready, &state.outcome) {
            (ReadyState::Done, Some(Err(err))) => Some(err.clone()),
            _ => None,
        }
    }

    pub fn on_success(&self, listener: impl FnMut(&T) + 'static) -> ListenerId {
        self.state.borrow_mut().on_success.add(Box::new(listener))
    }

    pub fn on_error(&self, listener: impl FnMut(&IdbError) + 'static) -> ListenerId {
        self.state.borrow_mut().on_error.add(Box::new(listener))
    }

    /// Remove a success or error listener. Safe to call from inside a listener.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut state = self.state.borrow_mut();
        let mut found = state.on_success.remove(id);
        found |= state.on_error.remove(id);
        found
    }

    /// Wait for the outcome.
    ///
    /// While a task waits here, settling the request keeps the transaction
    /// from auto-committing until that task has resumed, so the code after
    /// the `.await` can still issue operations.
    pub async fn outcome(&self) -> Result<T, IdbError> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.state.borrow();
                if state.ready == ReadyState::Done {
                    return match &state.outcome {
                        Some(outcome) => outcome.clone(),
                        None => Err(IdbError::InvalidState(
                            "request result is no longer available".into(),
                        )),
                    };
                }
            }
            let _waiter = Waiter::register(&self.state);
            notified.await;
        }
    }

    /// Put the request back to pending for another dispatch.
    pub(crate) fn arm(&self, counted: bool) {
        let mut state = self.state.borrow_mut();
        state.ready = ReadyState::Pending;
        state.counted = counted;
    }

    /// Record the outcome and notify listeners, waiters, then the transaction.
    ///
    /// A second settlement for the same dispatch is ignored.
    pub(crate) fn settle(&self, outcome: Result<T, IdbError>) {
        let (mut on_success, mut on_error, transaction, counted, waiters) = {
            let mut state = self.state.borrow_mut();
            if state.ready == ReadyState::Done {
                warn!(source = ?self.source, "Request settled twice; ignoring");
                return;
            }
            state.ready = ReadyState::Done;
            state.outcome = Some(outcome.clone());
            state.epoch += 1;
            let counted = std::mem::replace(&mut state.counted, false);
            (
                state.on_success.take(),
                state.on_error.take(),
                state.transaction.clone(),
                counted,
                std::mem::take(&mut state.waiters),
            )
        };

        // Listeners may add or remove listeners, or re-arm the request.
        match &outcome {
            Ok(value) => on_success.iter_mut().for_each(|(_, listener)| listener(value)),
            Err(err) => on_error.iter_mut().for_each(|(_, listener)| listener(err)),
        }
        {
            let mut state = self.state.borrow_mut();
            state.on_success.restore(on_success);
            state.on_error.restore(on_error);
        }

        self.notify.notify_waiters();

        if let Some(transaction) = transaction {
            // Each woken waiter releases its hold once it has resumed.
            transaction.hold(waiters);
            if let Err(err) = &outcome {
                transaction.abort_with(err.clone());
            }
            if counted {
                transaction.operation_settled();
            }
        }
    }

    /// Drop the stored outcome.
    pub(crate) fn release(&self) {
        self.state.borrow_mut().outcome = None;
    }

    pub(crate) fn downgrade(&self) -> WeakRequest<T> {
        WeakRequest {
            state: Rc::downgrade(&self.state),
            notify: Rc::downgrade(&self.notify),
            source: Rc::downgrade(&self.source),
        }
    }
}

impl<T: Clone + 'static> IntoFuture for Request<T> {
    type Output = Result<T, IdbError>;
    type IntoFuture = Pin<Box<dyn Future<Output = Result<T, IdbError>>>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.outcome().await })
    }
}

impl<T> std::fmt::Debug for Request<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ready = self.state.try_borrow().map(|s| s.ready).ok();
        f.debug_struct("Request")
            .field("source", &self.source)
            .field("ready", &ready)
            .finish()
    }
}

/// A task blocked in [`Request::outcome`].
///
/// Dropped once the task resumes. If a settlement happened meanwhile, that
/// settlement placed a hold on the transaction for this task; dropping
/// releases it.
struct Waiter<T> {
    state: Rc<RefCell<RequestState<T>>>,
    epoch: u64,
}

impl<T> Waiter<T> {
    fn register(state: &Rc<RefCell<RequestState<T>>>) -> Self {
        let epoch = {
            let mut inner = state.borrow_mut();
            inner.waiters += 1;
            inner.epoch
        };
        Self {
            state: Rc::clone(state),
            epoch,
        }
    }
}

impl<T> Drop for Waiter<T> {
    fn drop(&mut self) {
        let held = {
            let mut state = self.state.borrow_mut();
            if state.epoch == self.epoch {
                state.waiters = state.waiters.saturating_sub(1);
                None
            } else {
                state.transaction.clone()
            }
        };
        if let Some(transaction) = held {
            transaction.release_hold();
        }
    }
}

/// Non-owning request handle.
pub(crate) struct WeakRequest<T> {
    state: Weak<RefCell<RequestState<T>>>,
    notify: Weak<Notify>,
    source: Weak<RequestSource>,
}

impl<T> WeakRequest<T> {
    pub(crate) fn upgrade(&self) -> Option<Request<T>> {
        Some(Request {
            state: self.state.upgrade()?,
            notify: self.notify.upgrade()?,
            source: self.source.upgrade()?,
        })
    }
}

/// Dispatch a command outside any transaction.
pub(crate) fn dispatch_detached<T, H>(bridge: &Bridge, command: Command, handler: H) -> Request<T>
where
    T: Clone + 'static,
    H: FnOnce(Result<JsonValue, IdbError>) -> Result<T, IdbError> + 'static,
{
    let request = Request::new(RequestSource::Factory, None);
    let call = bridge.call(&command);
    let settling = request.clone();
    tokio::task::spawn_local(async move {
        let outcome = call.await.map_err(IdbError::from_remote);
        settling.settle(handler(outcome));
    });
    request
}
