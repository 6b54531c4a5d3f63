//! JSON-RPC 2.0 payload types, id generation, and pending-response
//! bookkeeping.
//!
//! The same payload shapes ride two layers: the relay wire protocol
//! (subscribe/publish/unsubscribe) and the encrypted protocol messages
//! exchanged between peers over a topic.

use std::collections::HashMap;

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{PairlinkError, PairlinkResult};

/// JSON-RPC protocol version string
pub const JSONRPC_VERSION: &str = "2.0";

/// A JSON-RPC 2.0 request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Request id, unique per channel for the record's lifetime
    pub id: u64,
    /// Always "2.0"
    pub jsonrpc: String,
    /// Method name
    pub method: String,
    /// Method parameters
    #[serde(default)]
    pub params: Value,
}

impl RpcRequest {
    /// Build a request with a fresh id
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            id: new_request_id(),
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC 2.0 error object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    /// Error code
    pub code: i64,
    /// Error message
    pub message: String,
}

/// A JSON-RPC 2.0 response (result or error)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    /// Id of the request being answered
    pub id: u64,
    /// Always "2.0"
    pub jsonrpc: String,
    /// Present on success
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Present on failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorObject>,
}

impl RpcResponse {
    /// Build a success response
    pub fn result(id: u64, result: Value) -> Self {
        Self {
            id,
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: Some(result),
            error: None,
        }
    }

    /// Build an error response
    pub fn error(id: u64, code: i64, message: impl Into<String>) -> Self {
        Self {
            id,
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: None,
            error: Some(RpcErrorObject {
                code,
                message: message.into(),
            }),
        }
    }

    /// Convert into `Ok(result)` or `Err(PeerError)`
    pub fn into_result(self) -> PairlinkResult<Value> {
        if let Some(err) = self.error {
            return Err(PairlinkError::PeerError {
                code: err.code,
                message: err.message,
            });
        }
        Ok(self.result.unwrap_or(Value::Null))
    }
}

/// Either half of a JSON-RPC exchange.
///
/// Untagged: requests carry `method`, responses carry `result` or `error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcPayload {
    /// A request frame
    Request(RpcRequest),
    /// A response frame
    Response(RpcResponse),
}

impl RpcPayload {
    /// The id shared by both frame kinds
    pub fn id(&self) -> u64 {
        match self {
            RpcPayload::Request(r) => r.id,
            RpcPayload::Response(r) => r.id,
        }
    }
}

/// Generate a request id: millisecond timestamp scaled by 1000 plus three
/// random digits. Unique enough per channel and roughly time-ordered, which
/// helps when reading relay logs.
pub fn new_request_id() -> u64 {
    let millis = chrono::Utc::now().timestamp_millis() as u64;
    millis * 1000 + rand::rng().random_range(0..1000)
}

/// Pending request-response waits, keyed by request id.
///
/// One instance is shared between the protocol engine's outbound calls
/// (pings, session requests) and its inbound dispatch loop. A late response
/// for an id that was already resolved or timed out finds no waiter and is
/// dropped.
#[derive(Default)]
pub struct ResponseWaiters {
    waiters: Mutex<HashMap<u64, oneshot::Sender<PairlinkResult<Value>>>>,
}

impl ResponseWaiters {
    /// Create an empty waiter table
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a wait for the given id
    pub fn register(&self, id: u64) -> oneshot::Receiver<PairlinkResult<Value>> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().insert(id, tx);
        rx
    }

    /// Resolve a wait; returns false (and drops the outcome) if nobody is
    /// waiting on the id.
    pub fn resolve(&self, id: u64, outcome: PairlinkResult<Value>) -> bool {
        match self.waiters.lock().remove(&id) {
            Some(tx) => tx.send(outcome).is_ok(),
            None => {
                debug!(id, "dropping response with no registered waiter");
                false
            }
        }
    }

    /// Remove a wait without resolving it (caller-side timeout cleanup)
    pub fn forget(&self, id: u64) {
        self.waiters.lock().remove(&id);
    }

    /// Reject every pending wait with `TransportClosed` (explicit disconnect)
    pub fn reject_all(&self) {
        let drained: Vec<_> = self.waiters.lock().drain().collect();
        for (_, tx) in drained {
            let _ = tx.send(Err(PairlinkError::TransportClosed));
        }
    }

    /// Number of pending waits
    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }

    /// Whether no waits are pending
    pub fn is_empty(&self) -> bool {
        self.waiters.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_id_is_unique_and_recent() {
        let id1 = new_request_id();
        let id2 = new_request_id();
        assert_ne!(id1, id2);
        // id / 1_000_000 recovers the second-resolution timestamp
        let now = chrono::Utc::now().timestamp() as u64;
        assert!((id1 / 1_000_000).abs_diff(now) <= 2);
    }

    #[test]
    fn test_payload_parses_request() {
        let raw = json!({
            "id": 1, "jsonrpc": "2.0", "method": "wc_sessionPing", "params": {}
        });
        let payload: RpcPayload = serde_json::from_value(raw).unwrap();
        match payload {
            RpcPayload::Request(req) => {
                assert_eq!(req.method, "wc_sessionPing");
                assert_eq!(req.id, 1);
            }
            _ => panic!("expected request"),
        }
    }

    #[test]
    fn test_payload_parses_result_response() {
        let raw = json!({"id": 2, "jsonrpc": "2.0", "result": true});
        let payload: RpcPayload = serde_json::from_value(raw).unwrap();
        match payload {
            RpcPayload::Response(res) => {
                assert_eq!(res.id, 2);
                assert_eq!(res.clone().into_result().unwrap(), json!(true));
            }
            _ => panic!("expected response"),
        }
    }

    #[test]
    fn test_payload_parses_error_response() {
        let raw = json!({
            "id": 3, "jsonrpc": "2.0",
            "error": {"code": 3001, "message": "unauthorized method"}
        });
        let payload: RpcPayload = serde_json::from_value(raw).unwrap();
        match payload {
            RpcPayload::Response(res) => {
                let err = res.into_result().unwrap_err();
                assert!(matches!(err, PairlinkError::PeerError { code: 3001, .. }));
            }
            _ => panic!("expected response"),
        }
    }

    #[test]
    fn test_response_serialization_omits_absent_half() {
        let ok = RpcResponse::result(1, json!(true));
        let raw = serde_json::to_value(&ok).unwrap();
        assert!(raw.get("error").is_none());

        let err = RpcResponse::error(2, 1001, "invalid method");
        let raw = serde_json::to_value(&err).unwrap();
        assert!(raw.get("result").is_none());
    }

    #[tokio::test]
    async fn test_waiters_resolve() {
        let waiters = ResponseWaiters::new();
        let rx = waiters.register(7);
        assert_eq!(waiters.len(), 1);

        assert!(waiters.resolve(7, Ok(json!("pong"))));
        assert!(waiters.is_empty());
        assert_eq!(rx.await.unwrap().unwrap(), json!("pong"));
    }

    #[tokio::test]
    async fn test_waiters_late_response_is_dropped() {
        let waiters = ResponseWaiters::new();
        // Nothing registered for this id
        assert!(!waiters.resolve(99, Ok(json!(null))));
    }

    #[tokio::test]
    async fn test_waiters_reject_all() {
        let waiters = ResponseWaiters::new();
        let rx1 = waiters.register(1);
        let rx2 = waiters.register(2);

        waiters.reject_all();
        assert!(waiters.is_empty());
        assert!(matches!(
            rx1.await.unwrap(),
            Err(PairlinkError::TransportClosed)
        ));
        assert!(matches!(
            rx2.await.unwrap(),
            Err(PairlinkError::TransportClosed)
        ));
    }
}
