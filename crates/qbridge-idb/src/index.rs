//! Index handles.

use serde_json::Value as JsonValue;

use crate::cursor::Cursor;
use crate::error::IdbError;
use crate::request::{Request, RequestSource};
use crate::store::{optional_value, parse_reply, validate_optional, ObjectStore};
use qbridge_protocol::{Command, CursorDirection, IndexMetadata, KeyPath, Query};

/// An index over an object store.
#[derive(Clone, Debug)]
pub struct Index {
    store: ObjectStore,
    name: String,
}

impl Index {
    pub(crate) fn new(store: ObjectStore, name: &str) -> Self {
        Self {
            store,
            name: name.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn object_store(&self) -> &ObjectStore {
        &self.store
    }

    pub fn key_path(&self) -> KeyPath {
        self.metadata().map(|m| m.key_path).unwrap_or_default()
    }

    pub fn unique(&self) -> bool {
        self.metadata().map(|m| m.unique).unwrap_or(false)
    }

    pub fn multi_entry(&self) -> bool {
        self.metadata().map(|m| m.multi_entry).unwrap_or(false)
    }

    /// First record whose index key matches.
    pub fn get(&self, query: impl Into<Query>) -> Result<Request<Option<JsonValue>>, IdbError> {
        self.store.transaction().ensure_active()?;
        let query = query.into();
        query.validate()?;
        self.dispatch(
            Command::IndexGet {
                db: self.store.db_name(),
                store: self.store.name().to_string(),
                index: self.name.clone(),
                query,
            },
            optional_value,
        )
    }

    pub fn get_all(
        &self,
        query: Option<Query>,
        count: Option<u32>,
    ) -> Result<Request<Vec<JsonValue>>, IdbError> {
        self.store.transaction().ensure_active()?;
        validate_optional(&query)?;
        self.dispatch(
            Command::IndexGetAll {
                db: self.store.db_name(),
                store: self.store.name().to_string(),
                index: self.name.clone(),
                query,
                count,
            },
            parse_reply,
        )
    }

    pub fn count(&self, query: Option<Query>) -> Result<Request<u64>, IdbError> {
        self.store.transaction().ensure_active()?;
        validate_optional(&query)?;
        self.dispatch(
            Command::IndexCount {
                db: self.store.db_name(),
                store: self.store.name().to_string(),
                index: self.name.clone(),
                query,
            },
            parse_reply,
        )
    }

    pub fn open_cursor(
        &self,
        query: Option<Query>,
        direction: CursorDirection,
    ) -> Result<Request<Option<Cursor>>, IdbError> {
        self.store
            .open_cursor_on(Some(self.name.clone()), query, direction, false)
    }

    pub fn open_key_cursor(
        &self,
        query: Option<Query>,
        direction: CursorDirection,
    ) -> Result<Request<Option<Cursor>>, IdbError> {
        self.store
            .open_cursor_on(Some(self.name.clone()), query, direction, true)
    }

    fn metadata(&self) -> Option<IndexMetadata> {
        self.store
            .transaction()
            .db()
            .index_metadata(self.store.name(), &self.name)
    }

    fn dispatch<T, P>(&self, command: Command, parse: P) -> Result<Request<T>, IdbError>
    where
        T: Clone + 'static,
        P: FnOnce(JsonValue) -> Result<T, IdbError> + 'static,
    {
        let source = RequestSource::Index {
            store: self.store.name().to_string(),
            index: self.name.clone(),
        };
        self.store
            .transaction()
            .dispatch(source, command, move |outcome| outcome.and_then(parse))
    }
}
