//! Session records and wire payloads.
//!
//! Sessions are negotiated atop a settled pairing. The proposer publishes a
//! proposal on the pairing topic; the responder approves by answering with
//! its public key and settling on the derived session topic. Three persisted
//! record types live here: the proposal (pre-settlement), the session itself,
//! and pending application-level requests awaiting a response.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::namespaces::{ProposedNamespaces, SettledNamespaces};
use crate::relay::PublishOptions;
use crate::store::Entity;
use crate::types::{expiry_from_now, ttl, Metadata, Relay, Topic};

/// Wire methods carried over pairing and session topics
pub mod methods {
    pub const SESSION_PROPOSE: &str = "wc_sessionPropose";
    pub const SESSION_SETTLE: &str = "wc_sessionSettle";
    pub const SESSION_UPDATE: &str = "wc_sessionUpdate";
    pub const SESSION_EXTEND: &str = "wc_sessionExtend";
    pub const SESSION_REQUEST: &str = "wc_sessionRequest";
    pub const SESSION_EVENT: &str = "wc_sessionEvent";
    pub const SESSION_PING: &str = "wc_sessionPing";
    pub const SESSION_DELETE: &str = "wc_sessionDelete";
}

/// Relay publish parameters for a session-level request
pub fn request_options(method: &str) -> PublishOptions {
    let (ttl, tag, prompt) = match method {
        methods::SESSION_PROPOSE => (ttl::FIVE_MINUTES, 1100, true),
        methods::SESSION_SETTLE => (ttl::FIVE_MINUTES, 1102, false),
        methods::SESSION_UPDATE => (ttl::ONE_DAY, 1104, false),
        methods::SESSION_EXTEND => (ttl::ONE_DAY, 1106, false),
        methods::SESSION_REQUEST => (ttl::FIVE_MINUTES, 1108, true),
        methods::SESSION_EVENT => (ttl::FIVE_MINUTES, 1110, true),
        methods::SESSION_DELETE => (ttl::ONE_DAY, 1112, false),
        methods::SESSION_PING => (ttl::FIVE_MINUTES, 1114, false),
        _ => (ttl::FIVE_MINUTES, 0, false),
    };
    PublishOptions { ttl, tag, prompt }
}

/// Relay publish parameters for the response to a session-level request
pub fn response_options(method: &str) -> PublishOptions {
    let mut opts = request_options(method);
    opts.tag += 1;
    opts.prompt = false;
    opts
}

/// One side of a session, as carried on the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub public_key: String,
    pub metadata: Metadata,
}

/// Params of `wc_sessionPropose`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionProposeParams {
    pub relays: Vec<Relay>,
    pub proposer: Participant,
    pub required_namespaces: ProposedNamespaces,
    #[serde(default)]
    pub optional_namespaces: ProposedNamespaces,
}

/// Result payload of the `wc_sessionPropose` response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionProposeResult {
    pub relay: Relay,
    pub responder_public_key: String,
}

/// Params of `wc_sessionSettle`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSettleParams {
    pub relay: Relay,
    pub controller: Participant,
    pub namespaces: SettledNamespaces,
    pub expiry: i64,
}

/// Params of `wc_sessionUpdate`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionUpdateParams {
    pub namespaces: SettledNamespaces,
}

/// Params of `wc_sessionRequest`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRequestParams {
    pub request: RequestPayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<String>,
}

/// The application-level call inside `wc_sessionRequest`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestPayload {
    pub method: String,
    pub params: Value,
}

/// Params of `wc_sessionEvent`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEventParams {
    pub event: EventPayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<String>,
}

/// The notification inside `wc_sessionEvent`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventPayload {
    pub name: String,
    pub data: Value,
}

/// A settled session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub topic: Topic,
    pub pairing_topic: Topic,
    pub relay: Relay,
    /// Seconds since epoch; extendable to at most seven days from now
    pub expiry: i64,
    /// Whether this side is the controller (the wallet)
    pub controller: bool,
    pub self_public_key: String,
    pub peer_public_key: String,
    pub self_metadata: Metadata,
    pub peer_metadata: Metadata,
    /// Capabilities granted at settlement, possibly widened by updates
    pub namespaces: SettledNamespaces,
    pub required_namespaces: ProposedNamespaces,
}

impl Session {
    /// The largest expiry an extension may reach right now
    pub fn max_extension() -> i64 {
        expiry_from_now(ttl::SEVEN_DAYS)
    }
}

impl Entity for Session {
    fn key(&self) -> String {
        self.topic.0.clone()
    }
}

/// A proposal awaiting approval or rejection.
///
/// On the proposer side, `session_topic` is filled in once the approval
/// response arrives, so the later `wc_sessionSettle` can be matched back to
/// the namespaces that were required.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Proposal {
    /// The id of the `wc_sessionPropose` request
    pub id: u64,
    pub pairing_topic: Topic,
    pub relay: Relay,
    pub proposer: Participant,
    pub required_namespaces: ProposedNamespaces,
    pub optional_namespaces: ProposedNamespaces,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_topic: Option<Topic>,
    pub expiry: i64,
}

impl Entity for Proposal {
    fn key(&self) -> String {
        self.id.to_string()
    }
}

/// An application-level request awaiting its response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingSessionRequest {
    pub id: u64,
    pub topic: Topic,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<String>,
    pub params: Value,
    pub expiry: i64,
}

impl Entity for PendingSessionRequest {
    fn key(&self) -> String {
        self.id.to_string()
    }
}
