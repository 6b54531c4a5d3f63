//! Expiry tracking for TTL-bound entities.
//!
//! The expirer holds (key, expiry-timestamp) pairs, one per expirable
//! pairing, session, proposal, or pending request, and scans them on each
//! heartbeat tick. Elapsed entries are removed and an
//! [`ExpirerEvent::Expired`] fires for each; the controllers listening on
//! the event stream then delete the owning entity with their own teardown
//! side effects. Detection is decoupled from deletion on purpose: the
//! expirer knows nothing about entity semantics.

use std::collections::HashMap;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::{PairlinkError, PairlinkResult};
use crate::storage::{storage_key, DynStorage};

/// Capacity of the expiry event channel
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Events emitted by the expirer
#[derive(Debug, Clone)]
pub enum ExpirerEvent {
    /// An entry's expiry timestamp elapsed and the entry was removed
    Expired {
        /// Key of the expired entry
        key: String,
        /// The expiry timestamp that elapsed
        expiry: i64,
    },
}

/// Persisted (key, expiry) tracker scanned on each heartbeat
pub struct Expirer {
    entries: RwLock<HashMap<String, i64>>,
    storage: DynStorage,
    storage_key: String,
    event_tx: broadcast::Sender<ExpirerEvent>,
}

impl Expirer {
    /// Create an expirer backed by the given storage, restoring persisted
    /// entries (missing or malformed blob starts empty).
    pub fn new(storage: DynStorage) -> Self {
        let storage_key = storage_key("core", "expirer");
        let entries = match storage.get_item(&storage_key) {
            Ok(Some(bytes)) => match serde_json::from_slice::<HashMap<String, i64>>(&bytes) {
                Ok(map) => map,
                Err(e) => {
                    warn!("expirer records malformed, starting empty: {}", e);
                    HashMap::new()
                }
            },
            Ok(None) => HashMap::new(),
            Err(e) => {
                warn!("expirer restore failed, starting empty: {}", e);
                HashMap::new()
            }
        };

        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            entries: RwLock::new(entries),
            storage,
            storage_key,
            event_tx,
        }
    }

    /// Subscribe to expiry events
    pub fn subscribe(&self) -> broadcast::Receiver<ExpirerEvent> {
        self.event_tx.subscribe()
    }

    /// Set (or replace) the expiry timestamp for a key
    pub fn set(&self, key: &str, expiry: i64) {
        self.entries.write().insert(key.to_string(), expiry);
        self.persist();
    }

    /// Get the expiry timestamp for a key
    pub fn get(&self, key: &str) -> PairlinkResult<i64> {
        self.entries
            .read()
            .get(key)
            .copied()
            .ok_or_else(|| PairlinkError::NotFound(format!("expirer: {}", key)))
    }

    /// Whether an entry exists for the key
    pub fn has(&self, key: &str) -> bool {
        self.entries.read().contains_key(key)
    }

    /// Remove the entry for a key (no-op if absent: entity deletion and
    /// expiry race, both may clean up)
    pub fn del(&self, key: &str) {
        let removed = self.entries.write().remove(key).is_some();
        if removed {
            self.persist();
        }
    }

    /// Scan all entries once; remove those whose expiry has elapsed and
    /// fire an `Expired` event per removal. Returns the expired keys.
    pub fn check(&self, now: i64) -> Vec<String> {
        let expired: Vec<(String, i64)> = {
            let mut entries = self.entries.write();
            let elapsed: Vec<String> = entries
                .iter()
                .filter(|(_, &expiry)| expiry <= now)
                .map(|(key, _)| key.clone())
                .collect();
            elapsed
                .into_iter()
                .filter_map(|key| entries.remove(&key).map(|expiry| (key, expiry)))
                .collect()
        };

        if expired.is_empty() {
            return Vec::new();
        }

        self.persist();

        let mut keys = Vec::with_capacity(expired.len());
        for (key, expiry) in expired {
            debug!(key, expiry, "entry expired");
            let _ = self.event_tx.send(ExpirerEvent::Expired {
                key: key.clone(),
                expiry,
            });
            keys.push(key);
        }
        keys
    }

    /// Number of tracked entries
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether no entries are tracked
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn persist(&self) {
        let map = self.entries.read().clone();
        let result = serde_json::to_vec(&map)
            .map_err(|e| PairlinkError::Serialization(e.to_string()))
            .and_then(|bytes| self.storage.set_item(&self.storage_key, &bytes));
        if let Err(e) = result {
            warn!("expirer persist failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::types::now_secs;

    #[test]
    fn test_set_get_has_del() {
        let expirer = Expirer::new(MemoryStorage::shared());

        assert!(!expirer.has("k"));
        assert!(expirer.get("k").is_err());

        expirer.set("k", 1000);
        assert!(expirer.has("k"));
        assert_eq!(expirer.get("k").unwrap(), 1000);

        expirer.del("k");
        assert!(!expirer.has("k"));
        // del on absent key is a no-op
        expirer.del("k");
    }

    #[test]
    fn test_check_removes_only_elapsed() {
        let expirer = Expirer::new(MemoryStorage::shared());
        let now = now_secs();

        expirer.set("past", now - 10);
        expirer.set("boundary", now);
        expirer.set("future", now + 1000);

        let mut expired = expirer.check(now);
        expired.sort();
        assert_eq!(expired, vec!["boundary", "past"]);
        assert!(!expirer.has("past"));
        assert!(!expirer.has("boundary"));
        assert!(expirer.has("future"));
    }

    #[tokio::test]
    async fn test_check_fires_events_once_per_entry() {
        let expirer = Expirer::new(MemoryStorage::shared());
        let mut events = expirer.subscribe();
        let now = now_secs();

        expirer.set("gone", now - 5);
        assert_eq!(expirer.check(now), vec!["gone"]);

        match events.recv().await.unwrap() {
            ExpirerEvent::Expired { key, expiry } => {
                assert_eq!(key, "gone");
                assert_eq!(expiry, now - 5);
            }
        }

        // A second scan finds nothing: the entry is gone, no double-fire
        assert!(expirer.check(now).is_empty());
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_restore_across_instances() {
        let storage = MemoryStorage::shared();
        {
            let expirer = Expirer::new(storage.clone());
            expirer.set("persisted", 12345);
        }

        let expirer = Expirer::new(storage);
        assert_eq!(expirer.get("persisted").unwrap(), 12345);
    }

    #[test]
    fn test_restore_tolerates_malformed_blob() {
        let storage = MemoryStorage::shared();
        storage
            .set_item(&storage_key("core", "expirer"), b"not json")
            .unwrap();
        let expirer = Expirer::new(storage);
        assert!(expirer.is_empty());
    }
}
