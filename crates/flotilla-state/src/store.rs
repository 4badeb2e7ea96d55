//! StateStore — redb-backed persistence.
//!
//! Generic byte-level CRUD over the fixed [`Table`] set; the typed
//! repositories in [`crate::repos`] (and in the tracker and deployment
//! crates) layer JSON on top. Supports on-disk and in-memory backends,
//! the latter for testing.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::{Table, APPS, DEPLOYMENTS, FRAMEWORK, GROUPS, TASKS};

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
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

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(APPS).map_err(map_err!(Table))?;
        txn.open_table(GROUPS).map_err(map_err!(Table))?;
        txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        txn.open_table(TASKS).map_err(map_err!(Table))?;
        txn.open_table(FRAMEWORK).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Insert or replace an entry.
    pub fn put(&self, table: Table, key: &str, value: &[u8]) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(table.definition()).map_err(map_err!(Table))?;
            t.insert(key, value).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Fetch an entry.
    pub fn get(&self, table: Table, key: &str) -> StateResult<Option<Vec<u8>>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table.definition()).map_err(map_err!(Table))?;
        match t.get(key).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(guard.value().to_vec())),
            None => Ok(None),
        }
    }

    /// Delete an entry. Returns true if it existed.
    pub fn remove(&self, table: Table, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut t = txn.open_table(table.definition()).map_err(map_err!(Table))?;
            existed = t.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    /// List all entries whose key starts with `prefix`, in key order.
    pub fn list_prefix(&self, table: Table, prefix: &str) -> StateResult<Vec<(String, Vec<u8>)>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table.definition()).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in t.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                results.push((key.value().to_string(), value.value().to_vec()));
            }
        }
        Ok(results)
    }

    /// Delete all entries whose key starts with `prefix`. Returns the
    /// number of removed entries.
    pub fn remove_prefix(&self, table: Table, prefix: &str) -> StateResult<usize> {
        let keys: Vec<String> = self
            .list_prefix(table, prefix)?
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(table.definition()).map_err(map_err!(Table))?;
            for key in &keys {
                t.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(keys.len())
    }
}
