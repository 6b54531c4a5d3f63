//! Persistent key-value storage collaborators.
//!
//! The engine persists everything through the [`KeyValueStorage`] trait: a
//! flat byte store with namespaced string keys. Two backends are provided:
//! [`RedbStorage`] for on-disk persistence and [`MemoryStorage`] for tests
//! and ephemeral embedders.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};

use crate::error::PairlinkError;

/// Protocol name used in storage key namespacing
pub const PROTOCOL: &str = "pairlink";

/// Storage schema version used in storage key namespacing
pub const STORAGE_VERSION: u32 = 1;

/// Build a namespaced storage key: `<protocol>@<version>:<context>//<name>`
pub fn storage_key(context: &str, name: &str) -> String {
    format!("{}@{}:{}//{}", PROTOCOL, STORAGE_VERSION, context, name)
}

/// Persisted key-value byte store the engine writes through.
///
/// Implementations must be safe to share across tasks; all methods are
/// synchronous and must not block for long.
pub trait KeyValueStorage: Send + Sync {
    /// Read the value for a key, `None` if absent
    fn get_item(&self, key: &str) -> Result<Option<Vec<u8>>, PairlinkError>;

    /// Insert or replace the value for a key
    fn set_item(&self, key: &str, value: &[u8]) -> Result<(), PairlinkError>;

    /// Remove a key (no-op if absent)
    fn remove_item(&self, key: &str) -> Result<(), PairlinkError>;

    /// List all stored keys
    fn get_keys(&self) -> Result<Vec<String>, PairlinkError>;
}

/// Shared handle to a storage backend
pub type DynStorage = Arc<dyn KeyValueStorage>;

const ITEMS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("items");

/// On-disk storage backend using redb
pub struct RedbStorage {
    db: Arc<RwLock<Database>>,
}

impl RedbStorage {
    /// Open (or create) a database file at the given path.
    ///
    /// Creates parent directories as needed and initializes the table.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, PairlinkError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(ITEMS_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }
}

impl KeyValueStorage for RedbStorage {
    fn get_item(&self, key: &str) -> Result<Option<Vec<u8>>, PairlinkError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(ITEMS_TABLE)?;
        Ok(table.get(key)?.map(|v| v.value().to_vec()))
    }

    fn set_item(&self, key: &str, value: &[u8]) -> Result<(), PairlinkError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(ITEMS_TABLE)?;
            table.insert(key, value)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), PairlinkError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(ITEMS_TABLE)?;
            table.remove(key)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn get_keys(&self) -> Result<Vec<String>, PairlinkError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(ITEMS_TABLE)?;

        let mut keys = Vec::new();
        for entry in table.iter()? {
            let (key, _) = entry?;
            keys.push(key.value().to_string());
        }
        Ok(keys)
    }
}

/// In-memory storage backend (tests, ephemeral embedders)
#[derive(Default)]
pub struct MemoryStorage {
    items: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    /// Create an empty in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty in-memory store behind a shared handle
    pub fn shared() -> DynStorage {
        Arc::new(Self::new())
    }
}

impl KeyValueStorage for MemoryStorage {
    fn get_item(&self, key: &str) -> Result<Option<Vec<u8>>, PairlinkError> {
        Ok(self.items.read().get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &[u8]) -> Result<(), PairlinkError> {
        self.items.write().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), PairlinkError> {
        self.items.write().remove(key);
        Ok(())
    }

    fn get_keys(&self) -> Result<Vec<String>, PairlinkError> {
        Ok(self.items.read().keys().cloned().collect())
    }
}
