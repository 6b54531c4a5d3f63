//! Core types shared across the pairlink engine

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Opaque identifier for an encrypted relay channel.
///
/// A topic is the addressing unit for the relay: one topic maps to exactly
/// one symmetric key and one encrypted channel. Topics derived from key
/// material are the lowercase hex SHA-256 of the key bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(pub String);

impl Topic {
    /// Derive a topic from symmetric key material (hex SHA-256 of the key)
    pub fn from_key(key: &[u8]) -> Self {
        let digest = Sha256::digest(key);
        Self(hex::encode(digest))
    }

    /// Create a fresh random topic (32 random bytes, hex encoded)
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    /// View the topic as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Topic {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Topic {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Relay-assigned identifier for an active topic subscription
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(pub String);

impl SubscriptionId {
    /// View the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Relay protocol options carried in pairing URIs and entity records
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relay {
    /// Relay protocol name (e.g. "irn")
    pub protocol: String,
    /// Opaque protocol-specific data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl Default for Relay {
    fn default() -> Self {
        Self {
            protocol: "irn".to_string(),
            data: None,
        }
    }
}

/// Peer application metadata exchanged during pairing/session setup
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// Human-readable application name
    pub name: String,
    /// Short application description
    pub description: String,
    /// Application URL
    pub url: String,
    /// Icon URLs
    pub icons: Vec<String>,
}

/// Reason attached to entity deletions and JSON-RPC error responses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reason {
    /// Protocol reason code
    pub code: i64,
    /// Human-readable message
    pub message: String,
}

impl Reason {
    /// Build a reason from a code/message pair
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

/// Protocol reason codes used in delete notifications and error responses
pub mod reason {
    use super::Reason;

    /// Inbound payload could not be parsed as JSON-RPC
    pub const INVALID_PAYLOAD: i64 = 1000;
    /// Method is not part of the protocol
    pub const INVALID_METHOD: i64 = 1001;
    /// Entity expired before the operation completed
    pub const EXPIRED: i64 = 1301;
    /// Method is outside the session's negotiated set
    pub const UNAUTHORIZED_METHOD: i64 = 3001;
    /// Event is outside the session's negotiated set
    pub const UNAUTHORIZED_EVENT: i64 = 3002;
    /// Approved namespaces do not cover the required ones
    pub const UNSUPPORTED_NAMESPACES: i64 = 5100;
    /// Proposal rejected by the responder
    pub const USER_REJECTED: i64 = 5000;
    /// Explicit user-initiated disconnect
    pub const USER_DISCONNECTED: i64 = 6000;
    /// Settlement failed on the proposer side
    pub const SESSION_SETTLEMENT_FAILED: i64 = 7000;
    /// No entity is registered for the message topic
    pub const NO_MATCHING_TOPIC: i64 = 1100;

    /// Reason for expiry-driven deletions
    pub fn expired() -> Reason {
        Reason::new(EXPIRED, "Expired")
    }

    /// Reason for explicit user-initiated deletions
    pub fn user_disconnected() -> Reason {
        Reason::new(USER_DISCONNECTED, "User disconnected")
    }
}

/// Common TTL values, in seconds
pub mod ttl {
    /// Five minutes: proposals, inactive pairings, handshake payloads
    pub const FIVE_MINUTES: i64 = 60 * 5;
    /// One day: relayed session payloads
    pub const ONE_DAY: i64 = 60 * 60 * 24;
    /// Seven days: settled sessions
    pub const SEVEN_DAYS: i64 = 60 * 60 * 24 * 7;
    /// Thirty days: active pairings
    pub const THIRTY_DAYS: i64 = 60 * 60 * 24 * 30;
}

/// Current wall-clock time in whole seconds since the Unix epoch
pub fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Expiry timestamp `ttl_secs` from now
pub fn expiry_from_now(ttl_secs: i64) -> i64 {
    now_secs() + ttl_secs
}
