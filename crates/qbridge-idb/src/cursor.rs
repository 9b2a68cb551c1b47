//! Cursors over engine-side result sets.

use serde_json::Value as JsonValue;
use std::cell::RefCell;
use std::rc::Rc;

use crate::error::IdbError;
use crate::request::Request;
use crate::store::ObjectStore;
use qbridge_protocol::{compare, Command, CursorDirection, CursorRecord, CursorStep, Query};

struct CursorState {
    cursor_id: String,
    key: JsonValue,
    primary_key: JsonValue,
    value: Option<JsonValue>,
    done: bool,
    advancing: bool,
}

/// A cursor. Each advance settles the request that opened it again.
#[derive(Clone)]
pub struct Cursor {
    state: Rc<RefCell<CursorState>>,
    store: ObjectStore,
    index: Option<String>,
    request: Request<Option<Cursor>>,
    direction: CursorDirection,
    key_only: bool,
}

impl Cursor {
    pub(crate) fn new(
        store: ObjectStore,
        index: Option<String>,
        request: Request<Option<Cursor>>,
        cursor_id: String,
        record: CursorRecord,
        direction: CursorDirection,
        key_only: bool,
    ) -> Self {
        let primary_key = record.effective_primary_key();
        let cursor = Self {
            state: Rc::new(RefCell::new(CursorState {
                cursor_id,
                key: record.key,
                primary_key,
                value: record.value,
                done: false,
                advancing: false,
            })),
            store,
            index,
            request,
            direction,
            key_only,
        };

        // The request holds this cursor and the cursor holds the request;
        // the transaction's end breaks the cycle.
        let state = Rc::downgrade(&cursor.state);
        let request = cursor.request.downgrade();
        cursor.store.transaction().on_final(move |_| {
            if let Some(state) = state.upgrade() {
                state.borrow_mut().done = true;
            }
            if let Some(request) = request.upgrade() {
                request.release();
            }
        });
        cursor
    }

    pub fn key(&self) -> JsonValue {
        self.state.borrow().key.clone()
    }

    pub fn primary_key(&self) -> JsonValue {
        self.state.borrow().primary_key.clone()
    }

    /// Current value; `None` for key cursors.
    pub fn value(&self) -> Option<JsonValue> {
        self.state.borrow().value.clone()
    }

    pub fn direction(&self) -> CursorDirection {
        self.direction
    }

    pub fn key_only(&self) -> bool {
        self.key_only
    }

    /// Store the cursor walks, directly or through an index.
    pub fn object_store(&self) -> &ObjectStore {
        &self.store
    }

    pub fn index_name(&self) -> Option<&str> {
        self.index.as_deref()
    }

    pub fn is_done(&self) -> bool {
        self.state.borrow().done
    }

    /// The request every advance settles.
    pub fn request(&self) -> Request<Option<Cursor>> {
        self.request.clone()
    }

    /// Move to the next record. Continuing to a given key is not supported.
    pub fn continue_(&self, key: Option<JsonValue>) -> Result<(), IdbError> {
        if key.is_some() {
            return Err(IdbError::NotSupported(
                "continuing to a specific key is not supported".into(),
            ));
        }
        self.step(1)
    }

    /// Skip `count` records.
    pub fn advance(&self, count: u32) -> Result<(), IdbError> {
        if count == 0 {
            return Err(IdbError::Type("advance count must be positive".into()));
        }
        self.step(count)
    }

    /// Continue and wait for the next position.
    pub async fn next(&self) -> Result<Option<Cursor>, IdbError> {
        self.continue_(None)?;
        self.request.outcome().await
    }

    /// Replace the current record's value.
    pub fn update(&self, value: JsonValue) -> Result<Request<()>, IdbError> {
        self.ensure_positioned()?;
        self.store.transaction().ensure_writable()?;

        let primary_key = self.primary_key();
        let inline_path = self
            .store
            .metadata()
            .map(|m| m.key_path)
            .filter(|path| path.is_inline());
        let key = match inline_path {
            Some(path) => {
                let matches = path
                    .extract(&value)
                    .map(|k| compare(&k, &primary_key) == Ok(std::cmp::Ordering::Equal))
                    .unwrap_or(false);
                if !matches {
                    return Err(IdbError::Data(
                        "the new value's key differs from the cursor's primary key".into(),
                    ));
                }
                None
            }
            None => Some(primary_key),
        };
        self.store.put_resolved(value, key)
    }

    /// Delete the current record.
    pub fn delete(&self) -> Result<Request<()>, IdbError> {
        self.ensure_positioned()?;
        self.store.delete(Query::Key(self.primary_key()))
    }

    fn ensure_positioned(&self) -> Result<(), IdbError> {
        if self.key_only {
            return Err(IdbError::InvalidState("key cursors have no values".into()));
        }
        let state = self.state.borrow();
        if state.done {
            return Err(IdbError::InvalidState("cursor is exhausted".into()));
        }
        if state.advancing {
            return Err(IdbError::InvalidState("cursor is advancing".into()));
        }
        Ok(())
    }

    fn step(&self, count: u32) -> Result<(), IdbError> {
        let cursor_id = {
            let state = self.state.borrow();
            if state.done {
                return Err(IdbError::InvalidState("cursor is exhausted".into()));
            }
            if state.advancing {
                return Err(IdbError::InvalidState("cursor is already advancing".into()));
            }
            state.cursor_id.clone()
        };

        let cursor = self.clone();
        self.store.transaction().dispatch_on(
            &self.request,
            Command::CursorContinue { cursor_id, count },
            move |outcome| cursor.moved(outcome),
        )?;
        self.state.borrow_mut().advancing = true;
        Ok(())
    }

    fn moved(self, outcome: Result<JsonValue, IdbError>) -> Result<Option<Cursor>, IdbError> {
        self.state.borrow_mut().advancing = false;
        let step = CursorStep::parse(outcome?)?;
        let mut state = self.state.borrow_mut();
        match step {
            CursorStep::Done => {
                state.done = true;
                drop(state);
                Ok(None)
            }
            CursorStep::Record(record) => {
                state.primary_key = record.effective_primary_key();
                state.key = record.key;
                state.value = record.value;
                drop(state);
                Ok(Some(self))
            }
        }
    }
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut out = f.debug_struct("Cursor");
        out.field("store", &self.store.name())
            .field("index", &self.index)
            .field("direction", &self.direction);
        if let Ok(state) = self.state.try_borrow() {
            out.field("cursor_id", &state.cursor_id)
                .field("key", &state.key)
                .field("done", &state.done);
        }
        out.finish()
    }
}
