//! Object store handles.

use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

use crate::cursor::Cursor;
use crate::error::IdbError;
use crate::index::Index;
use crate::request::{Request, RequestSource};
use crate::transaction::Transaction;
use qbridge_common::BridgeError;
use qbridge_protocol::{
    validate_key, Command, CursorDirection, CursorOpened, ImportOptions, ImportRow, IndexOptions,
    KeyPath, Query, StoreMetadata,
};

/// An object store seen through one transaction.
#[derive(Clone)]
pub struct ObjectStore {
    tx: Transaction,
    name: String,
}

impl ObjectStore {
    pub(crate) fn new(tx: Transaction, name: &str) -> Self {
        Self {
            tx,
            name: name.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn transaction(&self) -> Transaction {
        self.tx.clone()
    }

    pub fn key_path(&self) -> KeyPath {
        self.metadata().map(|m| m.key_path).unwrap_or_default()
    }

    pub fn auto_increment(&self) -> bool {
        self.metadata().map(|m| m.auto_increment).unwrap_or(false)
    }

    pub fn index_names(&self) -> Vec<String> {
        self.tx.db().index_names(&self.name)
    }

    /// Insert a record; fails if the key exists.
    pub fn add(&self, value: JsonValue, key: Option<JsonValue>) -> Result<Request<()>, IdbError> {
        self.tx.ensure_writable()?;
        let key = self.resolve_key(&value, key)?;
        self.dispatch(
            Command::Add {
                db: self.db_name(),
                store: self.name.clone(),
                value,
                key,
            },
            acknowledged,
        )
    }

    /// Insert or replace a record.
    pub fn put(&self, value: JsonValue, key: Option<JsonValue>) -> Result<Request<()>, IdbError> {
        self.tx.ensure_writable()?;
        let key = self.resolve_key(&value, key)?;
        self.put_resolved(value, key)
    }

    /// Delete every record matching `query`.
    pub fn delete(&self, query: impl Into<Query>) -> Result<Request<()>, IdbError> {
        self.tx.ensure_writable()?;
        let query = query.into();
        query.validate()?;
        self.dispatch(
            Command::Delete {
                db: self.db_name(),
                store: self.name.clone(),
                query,
            },
            acknowledged,
        )
    }

    /// First value matching `query`, if any.
    pub fn get(&self, query: impl Into<Query>) -> Result<Request<Option<JsonValue>>, IdbError> {
        self.tx.ensure_active()?;
        let query = query.into();
        query.validate()?;
        self.dispatch(
            Command::Get {
                db: self.db_name(),
                store: self.name.clone(),
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
        self.tx.ensure_active()?;
        validate_optional(&query)?;
        self.dispatch(
            Command::GetAll {
                db: self.db_name(),
                store: self.name.clone(),
                query,
                count,
            },
            parse_reply,
        )
    }

    pub fn get_all_keys(
        &self,
        query: Option<Query>,
        count: Option<u32>,
    ) -> Result<Request<Vec<JsonValue>>, IdbError> {
        self.tx.ensure_active()?;
        validate_optional(&query)?;
        self.dispatch(
            Command::GetAllKeys {
                db: self.db_name(),
                store: self.name.clone(),
                query,
                count,
            },
            parse_reply,
        )
    }

    pub fn clear(&self) -> Result<Request<()>, IdbError> {
        self.tx.ensure_writable()?;
        self.dispatch(
            Command::Clear {
                db: self.db_name(),
                store: self.name.clone(),
            },
            acknowledged,
        )
    }

    pub fn count(&self, query: Option<Query>) -> Result<Request<u64>, IdbError> {
        self.tx.ensure_active()?;
        validate_optional(&query)?;
        self.dispatch(
            Command::Count {
                db: self.db_name(),
                store: self.name.clone(),
                query,
            },
            parse_reply,
        )
    }

    /// Cursor over records. The request settles with `None` when nothing matches.
    pub fn open_cursor(
        &self,
        query: Option<Query>,
        direction: CursorDirection,
    ) -> Result<Request<Option<Cursor>>, IdbError> {
        self.open_cursor_on(None, query, direction, false)
    }

    /// Cursor over keys only.
    pub fn open_key_cursor(
        &self,
        query: Option<Query>,
        direction: CursorDirection,
    ) -> Result<Request<Option<Cursor>>, IdbError> {
        self.open_cursor_on(None, query, direction, true)
    }

    /// Create an index. Only inside the version change transaction.
    pub fn create_index(
        &self,
        name: &str,
        key_path: impl Into<KeyPath>,
        options: IndexOptions,
    ) -> Result<Index, IdbError> {
        self.tx
            .db()
            .create_index(&self.tx, &self.name, name, key_path.into(), options)?;
        Ok(Index::new(self.clone(), name))
    }

    /// Delete an index. Only inside the version change transaction.
    pub fn delete_index(&self, name: &str) -> Result<Request<()>, IdbError> {
        self.tx.db().delete_index(&self.tx, &self.name, name)
    }

    /// Handle to an existing index.
    pub fn index(&self, name: &str) -> Result<Index, IdbError> {
        if self.tx.state().is_finished() {
            return Err(IdbError::InvalidState("transaction has finished".into()));
        }
        if self.tx.db().index_metadata(&self.name, name).is_none() {
            return Err(IdbError::NotFound(format!("index not found: {}", name)));
        }
        Ok(Index::new(self.clone(), name))
    }

    /// Bulk put of `rows`, optionally emptying the store first.
    pub fn import_chunk(
        &self,
        rows: Vec<ImportRow>,
        options: ImportOptions,
    ) -> Result<Request<()>, IdbError> {
        self.tx.ensure_writable()?;
        for row in &rows {
            if let Some(key) = &row.key {
                validate_key(key)?;
            }
        }
        self.dispatch(
            Command::ImportChunk {
                db: self.db_name(),
                store: self.name.clone(),
                rows,
                options,
            },
            acknowledged,
        )
    }

    pub(crate) fn db_name(&self) -> String {
        self.tx.db().name()
    }

    pub(crate) fn metadata(&self) -> Option<StoreMetadata> {
        self.tx.db().store_metadata(&self.name)
    }

    /// Put with an already resolved key.
    pub(crate) fn put_resolved(
        &self,
        value: JsonValue,
        key: Option<JsonValue>,
    ) -> Result<Request<()>, IdbError> {
        self.tx.ensure_writable()?;
        self.dispatch(
            Command::Put {
                db: self.db_name(),
                store: self.name.clone(),
                value,
                key,
            },
            acknowledged,
        )
    }

    pub(crate) fn open_cursor_on(
        &self,
        index: Option<String>,
        query: Option<Query>,
        direction: CursorDirection,
        key_only: bool,
    ) -> Result<Request<Option<Cursor>>, IdbError> {
        self.tx.ensure_active()?;
        validate_optional(&query)?;

        let source = match &index {
            Some(index) => RequestSource::Index {
                store: self.name.clone(),
                index: index.clone(),
            },
            None => RequestSource::ObjectStore {
                store: self.name.clone(),
            },
        };
        let request = Request::new(source, Some(self.tx.clone()));
        let command = Command::OpenCursor {
            db: self.db_name(),
            store: self.name.clone(),
            index: index.clone(),
            query,
            direction,
            key_only,
            transaction: Some(self.tx.id()),
        };

        let handle = request.clone();
        let store = self.clone();
        self.tx.dispatch_on(&request, command, move |outcome| {
            let opened = CursorOpened::parse(outcome?)?;
            match opened {
                CursorOpened::Empty => Ok(None),
                // Cursors do not outlive their transaction.
                CursorOpened::Positioned { .. } if store.tx.state().is_finished() => Ok(None),
                CursorOpened::Positioned { cursor_id, record } => Ok(Some(Cursor::new(
                    store, index, handle, cursor_id, record, direction, key_only,
                ))),
            }
        })?;
        Ok(request)
    }

    fn source(&self) -> RequestSource {
        RequestSource::ObjectStore {
            store: self.name.clone(),
        }
    }

    fn dispatch<T, P>(&self, command: Command, parse: P) -> Result<Request<T>, IdbError>
    where
        T: Clone + 'static,
        P: FnOnce(JsonValue) -> Result<T, IdbError> + 'static,
    {
        self.tx
            .dispatch(self.source(), command, move |outcome| outcome.and_then(parse))
    }

    /// Work out the key to send with a write.
    fn resolve_key(
        &self,
        value: &JsonValue,
        key: Option<JsonValue>,
    ) -> Result<Option<JsonValue>, IdbError> {
        let metadata = self
            .metadata()
            .ok_or_else(|| IdbError::NotFound(format!("object store not found: {}", self.name)))?;

        match (key, metadata.key_path.is_inline()) {
            (Some(_), true) => Err(IdbError::Data(
                "a key was given for a store with in-line keys".into(),
            )),
            (Some(key), false) => {
                validate_key(&key)?;
                Ok(Some(key))
            }
            (None, true) => match metadata.key_path.extract(value) {
                Some(key) => {
                    validate_key(&key)?;
                    Ok(Some(key))
                }
                None if metadata.auto_increment => Ok(None),
                None => Err(IdbError::Data("the key path did not yield a key".into())),
            },
            (None, false) if metadata.auto_increment => Ok(None),
            (None, false) => Err(IdbError::Data(
                "no key given and the store has no key generator".into(),
            )),
        }
    }
}

impl std::fmt::Debug for ObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStore")
            .field("name", &self.name)
            .field("transaction", &self.tx)
            .finish()
    }
}

pub(crate) fn validate_optional(query: &Option<Query>) -> Result<(), IdbError> {
    if let Some(query) = query {
        query.validate()?;
    }
    Ok(())
}

pub(crate) fn parse_reply<T: DeserializeOwned>(value: JsonValue) -> Result<T, IdbError> {
    serde_json::from_value(value)
        .map_err(|e| IdbError::Transport(BridgeError::codec(format!("unexpected reply: {}", e))))
}

pub(crate) fn optional_value(value: JsonValue) -> Result<Option<JsonValue>, IdbError> {
    Ok(match value {
        JsonValue::Null => None,
        value => Some(value),
    })
}

fn acknowledged(_: JsonValue) -> Result<(), IdbError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{open_notes, ScriptedChannel};
    use qbridge_protocol::{KeyRange, TransactionMode};
    use serde_json::json;
    use tokio::task::LocalSet;

    #[tokio::test]
    async fn test_key_resolution() {
        LocalSet::new()
            .run_until(async {
                let channel = ScriptedChannel::new();
                let db = open_notes(&channel).await;
                let tx = db
                    .transaction(["items", "notes", "counters"], TransactionMode::ReadWrite)
                    .unwrap();
                let items = tx.object_store("items").unwrap();
                let notes = tx.object_store("notes").unwrap();
                let counters = tx.object_store("counters").unwrap();
                let posted = channel.count();

                // Out-of-line keys need a key unless generated.
                assert!(matches!(items.put(json!("x"), None), Err(IdbError::Data(_))));
                assert!(matches!(items.put(json!("x"), Some(json!(true))), Err(IdbError::Data(_))));
                // In-line keys come from the value only.
                assert!(matches!(
                    notes.put(json!({"id": "a"}), Some(json!("a"))),
                    Err(IdbError::Data(_))
                ));
                assert!(matches!(notes.add(json!({"text": "no id"}), None), Err(IdbError::Data(_))));
                assert!(matches!(notes.get(json!(null)), Err(IdbError::Data(_))));
                assert_eq!(channel.count(), posted);

                items.put(json!("x"), Some(json!("a"))).unwrap();
                notes.put(json!({"id": "n1", "tag": "t"}), None).unwrap();
                counters.add(json!({"n": 1}), None).unwrap();

                let puts: Vec<_> = (posted..channel.count()).map(|i| channel.envelope(i)).collect();
                assert_eq!(puts[0].arguments[3], json!("a"));
                assert_eq!(puts[1].arguments[3], json!("n1"));
                assert_eq!(puts[2].operation, "add");
                assert_eq!(puts[2].arguments[3], json!(null));
            })
            .await;
    }

    #[tokio::test]
    async fn test_reads_encode_queries() {
        LocalSet::new()
            .run_until(async {
                let channel = ScriptedChannel::new();
                let db = open_notes(&channel).await;
                let tx = db.transaction(["items"], TransactionMode::ReadOnly).unwrap();
                let items = tx.object_store("items").unwrap();

                let range = KeyRange::bound(json!(1), json!(5), false, true).unwrap();
                let all = items.get_all(Some(range.clone().into()), Some(2)).unwrap();
                let count = items.count(None).unwrap();

                let get_all = channel.envelope(channel.last("getAll"));
                assert_eq!(
                    get_all.arguments,
                    vec![
                        json!("Notes"),
                        json!("items"),
                        json!({"lower": 1, "upper": 5, "lowerOpen": false, "upperOpen": true}),
                        json!(2)
                    ]
                );
                channel.reply(channel.last("getAll"), json!(["a", "b"]));
                channel.reply(channel.last("count"), json!(7));
                assert_eq!(all.await.unwrap(), vec![json!("a"), json!("b")]);
                assert_eq!(count.await.unwrap(), 7);
            })
            .await;
    }

    #[tokio::test]
    async fn test_malformed_reply_fails_request() {
        LocalSet::new()
            .run_until(async {
                let channel = ScriptedChannel::new();
                let db = open_notes(&channel).await;
                let tx = db.transaction(["items"], TransactionMode::ReadOnly).unwrap();
                let count = tx.object_store("items").unwrap().count(None).unwrap();
                channel.reply(channel.last("count"), json!("many"));
                assert!(matches!(count.await, Err(IdbError::Transport(BridgeError::Codec(_)))));
                assert!(matches!(tx.done().await, Err(IdbError::Transport(_))));
            })
            .await;
    }

    #[tokio::test]
    async fn test_index_lookup() {
        LocalSet::new()
            .run_until(async {
                let channel = ScriptedChannel::new();
                let db = open_notes(&channel).await;
                let tx = db.transaction(["notes"], TransactionMode::ReadOnly).unwrap();
                let notes = tx.object_store("notes").unwrap();
                assert_eq!(notes.key_path(), KeyPath::from("id"));
                assert_eq!(notes.index_names(), vec!["by_tag"]);
                assert!(matches!(notes.index("by_title"), Err(IdbError::NotFound(_))));

                let by_tag = notes.index("by_tag").unwrap();
                assert_eq!(by_tag.key_path(), KeyPath::from("tag"));
                assert!(!by_tag.unique());
                let found = by_tag.get("t").unwrap();
                let envelope = channel.envelope(channel.last("indexGet"));
                assert_eq!(
                    envelope.arguments,
                    vec![json!("Notes"), json!("notes"), json!("by_tag"), json!("t")]
                );
                channel.reply(channel.last("indexGet"), json!({"id": "n1", "tag": "t"}));
                assert_eq!(found.await.unwrap(), Some(json!({"id": "n1", "tag": "t"})));
            })
            .await;
    }
}
