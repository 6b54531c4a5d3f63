//! JSON-RPC history: request/response correlation and replay protection.
//!
//! Every request a party sends or receives on a topic is recorded here.
//! Records transition exactly once from pending (no response) to resolved
//! (response attached), or are deleted outright on timeout/abort or topic
//! teardown. `resolve` is deliberately idempotent: relays may redeliver,
//! and a duplicate resolution must not overwrite or raise.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{PairlinkError, PairlinkResult};
use crate::rpc::{RpcRequest, RpcResponse};
use crate::storage::{storage_key, DynStorage};
use crate::types::Topic;

/// One recorded request and its eventual response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    /// Request id (unique per topic for the record's lifetime)
    pub id: u64,
    /// Topic the request rode on
    pub topic: Topic,
    /// Chain id the request targeted, when applicable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<String>,
    /// The request payload
    pub request: RpcRequest,
    /// The response, absent while pending
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<RpcResponse>,
}

impl HistoryRecord {
    /// Whether a response has been attached
    pub fn is_resolved(&self) -> bool {
        self.response.is_some()
    }
}

/// Persisted request/response journal
pub struct History {
    records: RwLock<HashMap<u64, HistoryRecord>>,
    storage: DynStorage,
    storage_key: String,
}

impl History {
    /// Create a history backed by the given storage, restoring persisted
    /// records (missing or malformed blob starts empty).
    pub fn new(storage: DynStorage) -> Self {
        let storage_key = storage_key("core", "history");
        let records = match storage.get_item(&storage_key) {
            Ok(Some(bytes)) => match serde_json::from_slice::<Vec<HistoryRecord>>(&bytes) {
                Ok(list) => list.into_iter().map(|r| (r.id, r)).collect(),
                Err(e) => {
                    warn!("history records malformed, starting empty: {}", e);
                    HashMap::new()
                }
            },
            Ok(None) => HashMap::new(),
            Err(e) => {
                warn!("history restore failed, starting empty: {}", e);
                HashMap::new()
            }
        };

        Self {
            records: RwLock::new(records),
            storage,
            storage_key,
        }
    }

    /// Record a pending request. Re-recording a known id is a no-op so that
    /// redelivered requests do not reset an already resolved record.
    pub fn set(&self, topic: Topic, request: RpcRequest, chain_id: Option<String>) {
        {
            let mut records = self.records.write();
            if records.contains_key(&request.id) {
                debug!(id = request.id, "request already recorded, skipping");
                return;
            }
            records.insert(
                request.id,
                HistoryRecord {
                    id: request.id,
                    topic,
                    chain_id,
                    request,
                    response: None,
                },
            );
        }
        self.persist();
    }

    /// Attach a response to its pending record.
    ///
    /// A no-op (not an error) if the id is unknown or the record is already
    /// resolved; the stored response never changes after the first
    /// resolution.
    pub fn resolve(&self, response: &RpcResponse) {
        {
            let mut records = self.records.write();
            match records.get_mut(&response.id) {
                Some(record) if record.response.is_none() => {
                    record.response = Some(response.clone());
                }
                Some(_) => {
                    debug!(id = response.id, "record already resolved, ignoring");
                    return;
                }
                None => {
                    debug!(id = response.id, "no record for response, ignoring");
                    return;
                }
            }
        }
        self.persist();
    }

    /// Get the record for a (topic, id) pair
    pub fn get(&self, topic: &Topic, id: u64) -> PairlinkResult<HistoryRecord> {
        self.records
            .read()
            .get(&id)
            .filter(|r| &r.topic == topic)
            .cloned()
            .ok_or_else(|| PairlinkError::NotFound(format!("history: {}/{}", topic, id)))
    }

    /// Whether a record exists for the (topic, id) pair; the duplicate
    /// check inbound dispatch runs before handling a request
    pub fn exists(&self, topic: &Topic, id: u64) -> bool {
        self.records
            .read()
            .get(&id)
            .map(|r| &r.topic == topic)
            .unwrap_or(false)
    }

    /// Delete one record (`Some(id)`) or every record for a topic (`None`)
    pub fn delete(&self, topic: &Topic, id: Option<u64>) {
        let removed = {
            let mut records = self.records.write();
            match id {
                Some(id) => records
                    .get(&id)
                    .filter(|r| &r.topic == topic)
                    .map(|r| r.id)
                    .map(|id| records.remove(&id).is_some())
                    .unwrap_or(false),
                None => {
                    let before = records.len();
                    records.retain(|_, r| &r.topic != topic);
                    records.len() != before
                }
            }
        };
        if removed {
            self.persist();
        }
    }

    /// All unresolved records, for post-reconnect replay by callers
    pub fn pending(&self) -> Vec<HistoryRecord> {
        self.records
            .read()
            .values()
            .filter(|r| !r.is_resolved())
            .cloned()
            .collect()
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Whether the journal is empty
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    fn persist(&self) {
        let list: Vec<HistoryRecord> = self.records.read().values().cloned().collect();
        let result = serde_json::to_vec(&list)
            .map_err(|e| PairlinkError::Serialization(e.to_string()))
            .and_then(|bytes| self.storage.set_item(&self.storage_key, &bytes));
        if let Err(e) = result {
            warn!("history persist failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use serde_json::json;

    fn make_history() -> History {
        History::new(MemoryStorage::shared())
    }

    fn request(id: u64) -> RpcRequest {
        RpcRequest {
            id,
            jsonrpc: "2.0".to_string(),
            method: "wc_sessionRequest".to_string(),
            params: json!({"n": id}),
        }
    }

    #[test]
    fn test_set_and_get() {
        let history = make_history();
        let topic = Topic::generate();

        history.set(topic.clone(), request(1), Some("eip155:1".to_string()));

        let record = history.get(&topic, 1).unwrap();
        assert!(!record.is_resolved());
        assert_eq!(record.chain_id.as_deref(), Some("eip155:1"));
        assert!(history.exists(&topic, 1));
    }

    #[test]
    fn test_get_checks_topic() {
        let history = make_history();
        let topic = Topic::generate();
        let other = Topic::generate();

        history.set(topic.clone(), request(1), None);
        assert!(history.get(&other, 1).is_err());
        assert!(!history.exists(&other, 1));
    }

    #[test]
    fn test_resolve_transitions_once() {
        let history = make_history();
        let topic = Topic::generate();
        history.set(topic.clone(), request(1), None);

        history.resolve(&RpcResponse::result(1, json!("first")));
        let record = history.get(&topic, 1).unwrap();
        assert_eq!(record.response.as_ref().unwrap().result, Some(json!("first")));

        // Second resolution is a silent no-op, stored response unchanged
        history.resolve(&RpcResponse::result(1, json!("second")));
        let record = history.get(&topic, 1).unwrap();
        assert_eq!(record.response.as_ref().unwrap().result, Some(json!("first")));
    }

    #[test]
    fn test_resolve_unknown_id_is_noop() {
        let history = make_history();
        history.resolve(&RpcResponse::result(42, json!(true)));
        assert!(history.is_empty());
    }

    #[test]
    fn test_duplicate_set_does_not_reset_resolved_record() {
        let history = make_history();
        let topic = Topic::generate();
        history.set(topic.clone(), request(1), None);
        history.resolve(&RpcResponse::result(1, json!(true)));

        // Relay redelivers the request
        history.set(topic.clone(), request(1), None);
        assert!(history.get(&topic, 1).unwrap().is_resolved());
    }

    #[test]
    fn test_pending_lists_unresolved_only() {
        let history = make_history();
        let topic = Topic::generate();

        history.set(topic.clone(), request(1), None);
        history.set(topic.clone(), request(2), None);
        history.resolve(&RpcResponse::result(1, json!(true)));

        let pending = history.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, 2);
    }

    #[test]
    fn test_delete_single_and_whole_topic() {
        let history = make_history();
        let topic = Topic::generate();
        let other = Topic::generate();

        history.set(topic.clone(), request(1), None);
        history.set(topic.clone(), request(2), None);
        history.set(other.clone(), request(3), None);

        history.delete(&topic, Some(1));
        assert!(!history.exists(&topic, 1));
        assert!(history.exists(&topic, 2));

        history.delete(&topic, None);
        assert!(!history.exists(&topic, 2));
        assert!(history.exists(&other, 3));
    }

    #[test]
    fn test_delete_checks_topic() {
        let history = make_history();
        let topic = Topic::generate();
        let other = Topic::generate();

        history.set(topic.clone(), request(1), None);
        history.delete(&other, Some(1));
        assert!(history.exists(&topic, 1));
    }

    #[test]
    fn test_restore_across_instances() {
        let storage = MemoryStorage::shared();
        let topic = Topic::generate();
        {
            let history = History::new(storage.clone());
            history.set(topic.clone(), request(1), None);
            history.resolve(&RpcResponse::result(1, json!(true)));
        }

        let history = History::new(storage);
        assert!(history.get(&topic, 1).unwrap().is_resolved());
    }
}
