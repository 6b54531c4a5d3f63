//! Generic persisted entity store.
//!
//! One `Store<V>` instance exclusively owns all records of one entity type
//! (pairings, sessions, proposals, pending requests). The in-memory map is
//! the source of truth for the process lifetime; persistence is
//! write-through and best-effort: a failed persist never rolls back the
//! in-memory mutation, it is logged and surfaced as a
//! [`StoreEvent::PersistFailed`] event instead.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::{PairlinkError, PairlinkResult};
use crate::storage::{storage_key, DynStorage};
use crate::types::Reason;

/// Capacity of each store's event channel
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// A record a [`Store`] can hold: cloneable, serializable, with a derivable
/// unique key (topic or numeric id rendered as a string).
pub trait Entity: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The record's unique key within its store
    fn key(&self) -> String;
}

/// Events emitted by a store
#[derive(Debug, Clone)]
pub enum StoreEvent {
    /// A record was inserted or replaced
    Set {
        /// Key of the record
        key: String,
    },
    /// A record was deleted
    Deleted {
        /// Key of the record
        key: String,
        /// Why it was deleted
        reason: Reason,
    },
    /// A write-through persist failed; the in-memory state is ahead of disk
    PersistFailed {
        /// Error rendered as text
        error: String,
    },
}

/// Generic container for one entity type, write-through persisted
pub struct Store<V: Entity> {
    name: &'static str,
    records: RwLock<HashMap<String, V>>,
    storage: DynStorage,
    storage_key: String,
    event_tx: broadcast::Sender<StoreEvent>,
}

impl<V: Entity> Store<V> {
    /// Create a store for the given entity context, restoring any persisted
    /// records. A missing or malformed persisted blob starts the store
    /// empty rather than failing.
    pub fn new(name: &'static str, storage: DynStorage) -> Self {
        let storage_key = storage_key("core", name);
        let records = match storage.get_item(&storage_key) {
            Ok(Some(bytes)) => match serde_json::from_slice::<Vec<V>>(&bytes) {
                Ok(list) => list.into_iter().map(|v| (v.key(), v)).collect(),
                Err(e) => {
                    warn!(store = name, "persisted records malformed, starting empty: {}", e);
                    HashMap::new()
                }
            },
            Ok(None) => HashMap::new(),
            Err(e) => {
                warn!(store = name, "restore failed, starting empty: {}", e);
                HashMap::new()
            }
        };

        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            name,
            records: RwLock::new(records),
            storage,
            storage_key,
            event_tx,
        }
    }

    /// Subscribe to this store's events
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.event_tx.subscribe()
    }

    /// Insert or replace a record, then persist
    pub fn set(&self, value: V) {
        let key = value.key();
        self.records.write().insert(key.clone(), value);
        self.persist();
        let _ = self.event_tx.send(StoreEvent::Set { key });
    }

    /// Get a record by key
    pub fn get(&self, key: &str) -> PairlinkResult<V> {
        self.records
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| PairlinkError::NotFound(format!("{}: {}", self.name, key)))
    }

    /// Whether a record exists for the key
    pub fn contains(&self, key: &str) -> bool {
        self.records.read().contains_key(key)
    }

    /// Apply an in-place mutation to a record, persist, and return the
    /// updated value
    pub fn update(&self, key: &str, f: impl FnOnce(&mut V)) -> PairlinkResult<V> {
        let updated = {
            let mut records = self.records.write();
            let value = records
                .get_mut(key)
                .ok_or_else(|| PairlinkError::NotFound(format!("{}: {}", self.name, key)))?;
            f(value);
            value.clone()
        };
        self.persist();
        let _ = self.event_tx.send(StoreEvent::Set {
            key: key.to_string(),
        });
        Ok(updated)
    }

    /// Delete a record, persist, and emit a deleted event with the reason.
    ///
    /// Deleting an absent key is a no-op: teardown paths race with expiry
    /// and both must be free to call this.
    pub fn delete(&self, key: &str, reason: Reason) {
        let removed = self.records.write().remove(key).is_some();
        if !removed {
            debug!(store = self.name, key, "delete of absent record skipped");
            return;
        }
        self.persist();
        let _ = self.event_tx.send(StoreEvent::Deleted {
            key: key.to_string(),
            reason,
        });
    }

    /// All records, optionally filtered
    pub fn get_all(&self, filter: Option<&dyn Fn(&V) -> bool>) -> Vec<V> {
        let records = self.records.read();
        match filter {
            Some(f) => records.values().filter(|v| f(v)).cloned().collect(),
            None => records.values().cloned().collect(),
        }
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    fn persist(&self) {
        let list: Vec<V> = self.records.read().values().cloned().collect();
        let result = serde_json::to_vec(&list)
            .map_err(|e| PairlinkError::Serialization(e.to_string()))
            .and_then(|bytes| self.storage.set_item(&self.storage_key, &bytes));

        if let Err(e) = result {
            warn!(store = self.name, "write-through persist failed: {}", e);
            let _ = self.event_tx.send(StoreEvent::PersistFailed {
                error: e.to_string(),
            });
        }
    }
}
