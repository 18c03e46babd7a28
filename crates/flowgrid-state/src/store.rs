//! StateStore — redb-backed persistence for session telemetry.
//!
//! Keeps the full transition history of every session plus its latest
//! summary. Values are JSON-serialized into redb's `&[u8]` columns. Both
//! on-disk and in-memory backends are supported (the latter for tests and
//! the simulator).

use std::path::Path;
use std::sync::Arc;

use flowgrid_lifecycle::TransitionEvent;
use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::{SessionRecord, TransitionRecord, transition_key};

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe telemetry store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store.
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(TRANSITIONS).map_err(map_err!(Table))?;
        txn.open_table(SESSIONS).map_err(map_err!(Table))?;
        txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Transitions ────────────────────────────────────────────────

    /// Append a transition to its session's history. Returns its sequence number.
    pub fn append_transition(&self, event: &TransitionEvent) -> StateResult<u64> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let seq;
        {
            let mut sequences = txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
            seq = sequences
                .get(event.session.as_str())
                .map_err(map_err!(Read))?
                .map(|g| g.value())
                .unwrap_or(0);
            sequences
                .insert(event.session.as_str(), seq + 1)
                .map_err(map_err!(Write))?;

            let record = TransitionRecord {
                seq,
                event: event.clone(),
            };
            let key = record.table_key();
            let value = serde_json::to_vec(&record).map_err(map_err!(Encode))?;
            let mut table = txn.open_table(TRANSITIONS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(seq)
    }

    /// A session's transitions in recording order.
    pub fn transitions_for_session(&self, session: &str) -> StateResult<Vec<TransitionRecord>> {
        let prefix = format!("{session}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(TRANSITIONS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let record: TransitionRecord =
                    serde_json::from_slice(value.value()).map_err(map_err!(Decode))?;
                results.push(record);
            }
        }
        Ok(results)
    }

    // ── Sessions ───────────────────────────────────────────────────

    /// Insert or update a session summary.
    pub fn put_session(&self, record: &SessionRecord) -> StateResult<()> {
        let value = serde_json::to_vec(record).map_err(map_err!(Encode))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(SESSIONS).map_err(map_err!(Table))?;
            table
                .insert(record.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(session = %record.id, state = %record.state, "session record stored");
        Ok(())
    }

    pub fn get_session(&self, id: &str) -> StateResult<Option<SessionRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SESSIONS).map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: SessionRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Decode))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    pub fn list_sessions(&self) -> StateResult<Vec<SessionRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SESSIONS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: SessionRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Decode))?;
            results.push(record);
        }
        Ok(results)
    }

    /// Delete a session summary and its history. Returns true if the summary existed.
    pub fn delete_session(&self, id: &str) -> StateResult<bool> {
        let count = {
            let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
            let sequences = txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
            sequences
                .get(id)
                .map_err(map_err!(Read))?
                .map(|g| g.value())
                .unwrap_or(0)
        };

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut sessions = txn.open_table(SESSIONS).map_err(map_err!(Table))?;
            existed = sessions.remove(id).map_err(map_err!(Write))?.is_some();

            let mut transitions = txn.open_table(TRANSITIONS).map_err(map_err!(Table))?;
            for seq in 0..count {
                transitions
                    .remove(transition_key(id, seq).as_str())
                    .map_err(map_err!(Write))?;
            }

            let mut sequences = txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
            sequences.remove(id).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(session = %id, existed, transitions = count, "session deleted");
        Ok(existed)
    }
}
