//! Server-side cursor result sets, paged by cursor id.

use hashbrown::HashMap;
use qbridge_protocol::{CursorOpened, CursorRecord, CursorStep};
use std::collections::VecDeque;

use crate::EngineError;

#[derive(Debug)]
struct MaterializedCursor {
    database: String,
    transaction: Option<u64>,
    remaining: VecDeque<CursorRecord>,
}

/// Open cursors keyed by the id handed to the client.
#[derive(Debug, Default)]
pub struct CursorTable {
    next_id: u64,
    open: HashMap<String, MaterializedCursor>,
}

impl CursorTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a walk and hand out its first record. An empty walk creates no cursor.
    pub fn open(
        &mut self,
        database: &str,
        store: &str,
        transaction: Option<u64>,
        records: Vec<CursorRecord>,
    ) -> CursorOpened {
        let mut remaining: VecDeque<CursorRecord> = records.into();
        let Some(first) = remaining.pop_front() else {
            return CursorOpened::Empty;
        };

        self.next_id += 1;
        let cursor_id = format!("{}:{}:{}", database, store, self.next_id);
        self.open.insert(
            cursor_id.clone(),
            MaterializedCursor {
                database: database.to_string(),
                transaction,
                remaining,
            },
        );
        CursorOpened::Positioned {
            cursor_id,
            record: first,
        }
    }

    /// Skip `count - 1` records and return the next one. Exhaustion closes the cursor.
    pub fn advance(&mut self, cursor_id: &str, count: u32) -> Result<CursorStep, EngineError> {
        let cursor = self
            .open
            .get_mut(cursor_id)
            .ok_or_else(|| EngineError::NotFound(format!("Cursor not found: {}", cursor_id)))?;

        let skip = (count.max(1) - 1) as usize;
        let skip = skip.min(cursor.remaining.len());
        cursor.remaining.drain(..skip);

        match cursor.remaining.pop_front() {
            Some(record) => Ok(CursorStep::Record(record)),
            None => {
                self.open.remove(cursor_id);
                Ok(CursorStep::Done)
            }
        }
    }

    /// Drop every cursor over `database`. Returns how many were dropped.
    pub fn release_database(&mut self, database: &str) -> usize {
        let before = self.open.len();
        self.open.retain(|_, cursor| cursor.database != database);
        before - self.open.len()
    }

    /// Drop the cursors `transaction` opened on `database`.
    pub fn release_transaction(&mut self, database: &str, transaction: u64) -> usize {
        let before = self.open.len();
        self.open.retain(|_, cursor| {
            cursor.database != database || cursor.transaction != Some(transaction)
        });
        before - self.open.len()
    }

    pub fn clear(&mut self) {
        self.open.clear();
    }

    /// Number of open cursors.
    pub fn len(&self) -> usize {
        self.open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }
}
