//! The core object: owns every component, dispatches inbound traffic, and
//! exposes the pairing/session operations.
//!
//! One [`Core`] per process side. All state is explicit instance state so
//! tests can run several isolated cores concurrently. Three background tasks
//! run while the core is started:
//!
//! - relayer events → inbound JSON-RPC dispatch by topic
//! - heartbeat ticks → expirer scan + pending-subscription retries
//! - expirer events → owning-entity teardown
//!
//! Malformed or unauthorized inbound requests are answered with a JSON-RPC
//! error response to the peer; they never surface as local errors.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::crypto::Crypto;
use crate::error::{PairlinkError, PairlinkResult};
use crate::expirer::{Expirer, ExpirerEvent};
use crate::heartbeat::{Heartbeat, DEFAULT_INTERVAL};
use crate::history::History;
use crate::namespaces::{
    assert_conforms, is_event_authorized, is_method_authorized, ProposedNamespaces,
    SettledNamespaces,
};
use crate::pairing::{self, Pairing};
use crate::relay::{Relayer, RelayerConfig, RelayerEvent};
use crate::rpc::{ResponseWaiters, RpcPayload, RpcRequest, RpcResponse};
use crate::session::{
    self, Participant, PendingSessionRequest, Proposal, RequestPayload, Session,
    SessionEventParams, SessionProposeParams, SessionProposeResult, SessionRequestParams,
    SessionSettleParams, SessionUpdateParams,
};
use crate::storage::{DynStorage, MemoryStorage, RedbStorage};
use crate::store::Store;
use crate::types::{
    expiry_from_now, now_secs, reason, ttl, Metadata, Reason, Relay, Topic,
};
use crate::uri::PairingUri;

/// Capacity of the core event channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Where persisted records live
#[derive(Debug, Clone)]
pub enum StorageBackend {
    /// Volatile, for tests and ephemeral embedders
    Memory,
    /// redb database at the given path
    Persistent(PathBuf),
}

/// Core configuration
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub relay: RelayerConfig,
    pub storage: StorageBackend,
    /// Our metadata, shared with peers during pairing/session setup
    pub metadata: Metadata,
    pub heartbeat_interval: Duration,
    /// Deadline for ping pongs
    pub ping_timeout: Duration,
    /// Deadline for application-level session request responses
    pub session_request_timeout: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            relay: RelayerConfig::default(),
            storage: StorageBackend::Memory,
            metadata: Metadata::default(),
            heartbeat_interval: DEFAULT_INTERVAL,
            ping_timeout: Duration::from_secs(30),
            session_request_timeout: Duration::from_secs(300),
        }
    }
}

/// Protocol events surfaced to the embedder
#[derive(Debug, Clone)]
pub enum CoreEvent {
    /// The peer proposed a session on one of our pairings
    SessionProposal { proposal: Proposal },
    /// The peer rejected one of our proposals
    SessionRejected { id: u64, reason: Reason },
    /// A session reached `settled` (either side)
    SessionSettled { session: Session },
    /// The peer sent an application-level request; answer via
    /// [`Core::respond`]
    SessionRequest {
        topic: Topic,
        id: u64,
        method: String,
        chain_id: Option<String>,
        params: Value,
    },
    /// The peer emitted a session event notification
    SessionEvent {
        topic: Topic,
        name: String,
        data: Value,
        chain_id: Option<String>,
    },
    /// The peer replaced the session namespaces
    SessionUpdated {
        topic: Topic,
        namespaces: SettledNamespaces,
    },
    /// The session expiry moved forward
    SessionExtended { topic: Topic, expiry: i64 },
    /// A session was torn down (peer delete or expiry)
    SessionDeleted { topic: Topic, reason: Reason },
    /// The pairing expiry moved forward
    PairingExtended { topic: Topic, expiry: i64 },
    /// A pairing was torn down (peer delete or expiry)
    PairingDeleted { topic: Topic, reason: Reason },
}

/// Expirer key prefixes, one per owning entity type
mod expiry_target {
    use crate::types::Topic;

    pub fn pairing(topic: &Topic) -> String {
        format!("pairing:{}", topic)
    }

    pub fn session(topic: &Topic) -> String {
        format!("session:{}", topic)
    }

    pub fn proposal(id: u64) -> String {
        format!("proposal:{}", id)
    }

    pub fn request(id: u64) -> String {
        format!("request:{}", id)
    }
}

/// The protocol engine
pub struct Core {
    crypto: Arc<Crypto>,
    relayer: Relayer,
    pairings: Store<Pairing>,
    sessions: Store<Session>,
    proposals: Store<Proposal>,
    pending_requests: Store<PendingSessionRequest>,
    expirer: Expirer,
    history: History,
    heartbeat: Arc<Heartbeat>,
    waiters: ResponseWaiters,
    metadata: Metadata,
    ping_timeout: Duration,
    session_request_timeout: Duration,
    event_tx: broadcast::Sender<CoreEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Core {
    /// Build a core from configuration. Persisted records are restored
    /// immediately; no background task runs until [`start`](Self::start).
    pub fn new(config: CoreConfig) -> PairlinkResult<Self> {
        let storage: DynStorage = match &config.storage {
            StorageBackend::Memory => MemoryStorage::shared(),
            StorageBackend::Persistent(path) => Arc::new(RedbStorage::new(path)?),
        };

        let crypto = Arc::new(Crypto::new(storage.clone()));
        let relayer = Relayer::new(config.relay.clone(), crypto.clone());
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            crypto,
            relayer,
            pairings: Store::new("pairings", storage.clone()),
            sessions: Store::new("sessions", storage.clone()),
            proposals: Store::new("proposals", storage.clone()),
            pending_requests: Store::new("pending-requests", storage.clone()),
            expirer: Expirer::new(storage.clone()),
            history: History::new(storage),
            heartbeat: Arc::new(Heartbeat::new(config.heartbeat_interval)),
            waiters: ResponseWaiters::new(),
            metadata: config.metadata,
            ping_timeout: config.ping_timeout,
            session_request_timeout: config.session_request_timeout,
            event_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Subscribe to protocol events
    pub fn subscribe_events(&self) -> broadcast::Receiver<CoreEvent> {
        self.event_tx.subscribe()
    }

    /// Whether the relay transport is live
    pub fn is_connected(&self) -> bool {
        self.relayer.is_connected()
    }

    /// All persisted pairings
    pub fn pairings(&self) -> Vec<Pairing> {
        self.pairings.get_all(None)
    }

    /// All settled sessions
    pub fn sessions(&self) -> Vec<Session> {
        self.sessions.get_all(None)
    }

    /// Peer requests awaiting a [`respond`](Self::respond) call
    pub fn pending_session_requests(&self) -> Vec<PendingSessionRequest> {
        self.pending_requests.get_all(None)
    }

    /// Connect the transport, restore subscriptions for persisted entities,
    /// and start the background tasks.
    pub async fn start(self: &Arc<Self>) -> PairlinkResult<()> {
        self.spawn_tasks();
        self.heartbeat.start();
        self.relayer.connect().await?;

        for pairing in self.pairings.get_all(None) {
            if let Err(e) = self.relayer.subscribe(&pairing.topic).await {
                warn!(topic = %pairing.topic, "pairing resubscribe failed: {}", e);
            }
        }
        for session in self.sessions.get_all(None) {
            if let Err(e) = self.relayer.subscribe(&session.topic).await {
                warn!(topic = %session.topic, "session resubscribe failed: {}", e);
            }
        }
        info!(
            pairings = self.pairings.len(),
            sessions = self.sessions.len(),
            "core started"
        );
        Ok(())
    }

    /// Close the transport and stop the background tasks. Persisted
    /// entities are untouched and restored on the next [`start`](Self::start).
    pub async fn shutdown(&self) {
        self.heartbeat.stop();
        self.relayer.disconnect().await;
        self.waiters.reject_all();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        info!("core stopped");
    }

    // ---- pairing operations ----

    /// Create a fresh pairing and the URI to share with the peer
    pub async fn create_pairing(&self) -> PairlinkResult<(Pairing, PairingUri)> {
        let sym_key = Crypto::generate_sym_key();
        let topic = self.crypto.set_sym_key(sym_key, None)?;
        let relay = Relay::default();

        let pairing = Pairing::new(topic.clone(), relay.clone());
        self.pairings.set(pairing.clone());
        self.expirer
            .set(&expiry_target::pairing(&topic), pairing.expiry);
        self.relayer.subscribe(&topic).await?;

        let uri = PairingUri::new(topic, relay, sym_key);
        Ok((pairing, uri))
    }

    /// Join a pairing from a scanned/shared URI
    pub async fn pair(&self, uri: &str) -> PairlinkResult<Pairing> {
        let uri = PairingUri::parse(uri)?;
        if self.pairings.contains(uri.topic.as_str()) {
            return Err(PairlinkError::InvalidOperation(format!(
                "pairing already exists for topic {}",
                uri.topic
            )));
        }

        let topic = self.crypto.set_sym_key(uri.sym_key, Some(uri.topic))?;
        let pairing = Pairing::new(topic.clone(), uri.relay);
        self.pairings.set(pairing.clone());
        self.expirer
            .set(&expiry_target::pairing(&topic), pairing.expiry);
        self.relayer.subscribe(&topic).await?;
        Ok(pairing)
    }

    /// Probe entity liveness; resolves on the peer's pong
    pub async fn ping(&self, topic: &Topic) -> PairlinkResult<()> {
        let method = if self.sessions.contains(topic.as_str()) {
            session::methods::SESSION_PING
        } else if self.pairings.contains(topic.as_str()) {
            pairing::methods::PAIRING_PING
        } else {
            return Err(PairlinkError::NotFound(topic.0.clone()));
        };

        let opts = if method == session::methods::SESSION_PING {
            session::request_options(method)
        } else {
            pairing::request_options(method)
        };

        let request = RpcRequest::new(method, json!({}));
        let rx = self.waiters.register(request.id);
        self.history.set(topic.clone(), request.clone(), None);
        if let Err(e) = self.publish_request(topic, &request, opts).await {
            self.waiters.forget(request.id);
            self.history.delete(topic, Some(request.id));
            return Err(e);
        }

        match tokio::time::timeout(self.ping_timeout, rx).await {
            Ok(Ok(outcome)) => outcome.map(|_| ()),
            Ok(Err(_)) => {
                self.history.delete(topic, Some(request.id));
                Err(PairlinkError::TransportClosed)
            }
            Err(_) => {
                self.waiters.forget(request.id);
                self.history.delete(topic, Some(request.id));
                Err(PairlinkError::PingTimeout(topic.0.clone()))
            }
        }
    }

    /// Push the pairing expiry out to thirty days from now
    pub async fn extend_pairing(&self, topic: &Topic) -> PairlinkResult<i64> {
        let _ = self.pairings.get(topic.as_str())?;
        let expiry = Pairing::max_extension();

        let request = RpcRequest::new(pairing::methods::PAIRING_EXTEND, json!({}));
        self.history.set(topic.clone(), request.clone(), None);
        let opts = pairing::request_options(pairing::methods::PAIRING_EXTEND);
        self.publish_request(topic, &request, opts).await?;

        self.pairings.update(topic.as_str(), |p| p.expiry = expiry)?;
        self.expirer.set(&expiry_target::pairing(topic), expiry);
        Ok(expiry)
    }

    /// Notify the peer, then tear the pairing down locally
    pub async fn delete_pairing(&self, topic: &Topic, reason: Reason) -> PairlinkResult<()> {
        // get() first so an unknown topic errors instead of publishing
        let _ = self.pairings.get(topic.as_str())?;

        let request = RpcRequest::new(
            pairing::methods::PAIRING_DELETE,
            serde_json::to_value(&reason)
                .map_err(|e| PairlinkError::Serialization(e.to_string()))?,
        );
        self.history.set(topic.clone(), request.clone(), None);
        let opts = pairing::request_options(pairing::methods::PAIRING_DELETE);
        if let Err(e) = self.publish_request(topic, &request, opts).await {
            warn!(topic = %topic, "pairing delete publish failed: {}", e);
        }
        self.teardown_pairing(topic, reason).await;
        Ok(())
    }

    // ---- session operations ----

    /// Propose a session over a settled pairing. Resolution arrives as
    /// [`CoreEvent::SessionSettled`] or [`CoreEvent::SessionRejected`].
    pub async fn propose_session(
        &self,
        pairing_topic: &Topic,
        required_namespaces: ProposedNamespaces,
        optional_namespaces: ProposedNamespaces,
    ) -> PairlinkResult<u64> {
        let pairing = self.pairings.get(pairing_topic.as_str())?;
        let public_key = self.crypto.generate_key_pair()?;

        let proposer = Participant {
            public_key,
            metadata: self.metadata.clone(),
        };
        let params = SessionProposeParams {
            relays: vec![pairing.relay.clone()],
            proposer: proposer.clone(),
            required_namespaces: required_namespaces.clone(),
            optional_namespaces: optional_namespaces.clone(),
        };
        let request = RpcRequest::new(
            session::methods::SESSION_PROPOSE,
            serde_json::to_value(&params)
                .map_err(|e| PairlinkError::Serialization(e.to_string()))?,
        );

        let proposal = Proposal {
            id: request.id,
            pairing_topic: pairing_topic.clone(),
            relay: pairing.relay,
            proposer,
            required_namespaces,
            optional_namespaces,
            session_topic: None,
            expiry: expiry_from_now(ttl::FIVE_MINUTES),
        };
        self.proposals.set(proposal.clone());
        self.expirer
            .set(&expiry_target::proposal(proposal.id), proposal.expiry);

        self.history.set(pairing_topic.clone(), request.clone(), None);
        let opts = session::request_options(session::methods::SESSION_PROPOSE);
        self.publish_request(pairing_topic, &request, opts).await?;
        Ok(request.id)
    }

    /// Approve a received proposal with the namespaces granted by the user.
    ///
    /// The granted namespaces must cover everything the proposal required,
    /// for every required chain; a partial grant rejects nothing on the wire
    /// but fails here with `NamespacesMismatch` so the caller can instead
    /// reject explicitly.
    pub async fn approve_session(
        &self,
        proposal_id: u64,
        namespaces: SettledNamespaces,
    ) -> PairlinkResult<Session> {
        let proposal = self
            .proposals
            .get(&proposal_id.to_string())
            .map_err(|_| PairlinkError::ProposalNotFound(proposal_id))?;
        assert_conforms(&proposal.required_namespaces, &namespaces)?;
        // Consumed here: a second approve of the same id fails with
        // ProposalNotFound.
        self.drop_proposal(proposal_id);

        let self_public_key = self.crypto.generate_key_pair()?;
        let session_topic =
            self.crypto
                .generate_shared_key(&self_public_key, &proposal.proposer.public_key, None)?;
        self.relayer.subscribe(&session_topic).await?;

        // Approval rides the proposal's JSON-RPC response frame, back on the
        // pairing topic.
        let approval = RpcResponse::result(
            proposal_id,
            serde_json::to_value(&SessionProposeResult {
                relay: proposal.relay.clone(),
                responder_public_key: self_public_key.clone(),
            })
            .map_err(|e| PairlinkError::Serialization(e.to_string()))?,
        );
        self.history.resolve(&approval);
        let opts = session::response_options(session::methods::SESSION_PROPOSE);
        self.publish_response(&proposal.pairing_topic, &approval, opts)
            .await?;

        let session = Session {
            topic: session_topic.clone(),
            pairing_topic: proposal.pairing_topic.clone(),
            relay: proposal.relay.clone(),
            expiry: expiry_from_now(ttl::SEVEN_DAYS),
            controller: true,
            self_public_key: self_public_key.clone(),
            peer_public_key: proposal.proposer.public_key.clone(),
            self_metadata: self.metadata.clone(),
            peer_metadata: proposal.proposer.metadata.clone(),
            namespaces: namespaces.clone(),
            required_namespaces: proposal.required_namespaces.clone(),
        };
        self.sessions.set(session.clone());
        self.expirer
            .set(&expiry_target::session(&session_topic), session.expiry);

        let settle = RpcRequest::new(
            session::methods::SESSION_SETTLE,
            serde_json::to_value(&SessionSettleParams {
                relay: session.relay.clone(),
                controller: Participant {
                    public_key: self_public_key,
                    metadata: self.metadata.clone(),
                },
                namespaces,
                expiry: session.expiry,
            })
            .map_err(|e| PairlinkError::Serialization(e.to_string()))?,
        );
        self.history.set(session_topic.clone(), settle.clone(), None);
        let opts = session::request_options(session::methods::SESSION_SETTLE);
        self.publish_request(&session_topic, &settle, opts).await?;

        self.activate_pairing(&proposal.pairing_topic);
        let _ = self.event_tx.send(CoreEvent::SessionSettled {
            session: session.clone(),
        });
        Ok(session)
    }

    /// Reject a received proposal
    pub async fn reject_session(&self, proposal_id: u64, reason: Reason) -> PairlinkResult<()> {
        let proposal = self.take_proposal(proposal_id)?;
        let rejection = RpcResponse::error(proposal_id, reason.code, reason.message);
        self.history.resolve(&rejection);
        let opts = session::response_options(session::methods::SESSION_PROPOSE);
        self.publish_response(&proposal.pairing_topic, &rejection, opts)
            .await
    }

    /// Forward an application-level JSON-RPC call to the peer and wait for
    /// its response
    pub async fn session_request(
        &self,
        topic: &Topic,
        chain_id: Option<String>,
        method: &str,
        params: Value,
    ) -> PairlinkResult<Value> {
        let session = self.sessions.get(topic.as_str())?;
        if !is_method_authorized(&session.namespaces, method, chain_id.as_deref()) {
            return Err(PairlinkError::UnauthorizedMethod(method.to_string()));
        }

        let request = RpcRequest::new(
            session::methods::SESSION_REQUEST,
            serde_json::to_value(&SessionRequestParams {
                request: RequestPayload {
                    method: method.to_string(),
                    params,
                },
                chain_id: chain_id.clone(),
            })
            .map_err(|e| PairlinkError::Serialization(e.to_string()))?,
        );

        let rx = self.waiters.register(request.id);
        self.history.set(topic.clone(), request.clone(), chain_id);
        let opts = session::request_options(session::methods::SESSION_REQUEST);
        if let Err(e) = self.publish_request(topic, &request, opts).await {
            self.waiters.forget(request.id);
            self.history.delete(topic, Some(request.id));
            return Err(e);
        }

        match tokio::time::timeout(self.session_request_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => {
                self.history.delete(topic, Some(request.id));
                Err(PairlinkError::TransportClosed)
            }
            Err(_) => {
                self.waiters.forget(request.id);
                self.history.delete(topic, Some(request.id));
                Err(PairlinkError::RequestTimeout(request.id))
            }
        }
    }

    /// Answer a peer request surfaced as [`CoreEvent::SessionRequest`]
    ///
    /// The response id must match a pending request received on this topic.
    pub async fn respond(&self, topic: &Topic, response: RpcResponse) -> PairlinkResult<()> {
        let id = response.id;
        let pending = self.pending_requests.get(&id.to_string())?;
        if &pending.topic != topic {
            return Err(PairlinkError::NotFound(format!(
                "pending request {} does not belong to topic {}",
                id, topic.0
            )));
        }
        let opts = session::response_options(session::methods::SESSION_REQUEST);
        self.publish_response(topic, &response, opts).await?;
        self.history.resolve(&response);
        self.pending_requests
            .delete(&id.to_string(), Reason::new(0, "responded"));
        self.expirer.del(&expiry_target::request(id));
        Ok(())
    }

    /// Emit a session event notification to the peer
    pub async fn emit_event(
        &self,
        topic: &Topic,
        name: &str,
        data: Value,
        chain_id: Option<String>,
    ) -> PairlinkResult<()> {
        let session = self.sessions.get(topic.as_str())?;
        if !is_event_authorized(&session.namespaces, name) {
            return Err(PairlinkError::UnauthorizedMethod(name.to_string()));
        }

        let request = RpcRequest::new(
            session::methods::SESSION_EVENT,
            serde_json::to_value(&SessionEventParams {
                event: crate::session::EventPayload {
                    name: name.to_string(),
                    data,
                },
                chain_id: chain_id.clone(),
            })
            .map_err(|e| PairlinkError::Serialization(e.to_string()))?,
        );
        self.history.set(topic.clone(), request.clone(), chain_id);
        let opts = session::request_options(session::methods::SESSION_EVENT);
        self.publish_request(topic, &request, opts).await
    }

    /// Replace the session namespaces (controller side)
    pub async fn update_session(
        &self,
        topic: &Topic,
        namespaces: SettledNamespaces,
    ) -> PairlinkResult<()> {
        let session = self.sessions.get(topic.as_str())?;
        if !session.controller {
            return Err(PairlinkError::InvalidOperation(
                "only the controller may update a session".to_string(),
            ));
        }
        assert_conforms(&session.required_namespaces, &namespaces)?;

        let request = RpcRequest::new(
            session::methods::SESSION_UPDATE,
            serde_json::to_value(&SessionUpdateParams {
                namespaces: namespaces.clone(),
            })
            .map_err(|e| PairlinkError::Serialization(e.to_string()))?,
        );
        self.history.set(topic.clone(), request.clone(), None);
        let opts = session::request_options(session::methods::SESSION_UPDATE);
        self.publish_request(topic, &request, opts).await?;

        self.sessions
            .update(topic.as_str(), |s| s.namespaces = namespaces)?;
        Ok(())
    }

    /// Push the session expiry out to seven days from now
    pub async fn extend_session(&self, topic: &Topic) -> PairlinkResult<i64> {
        let _ = self.sessions.get(topic.as_str())?;
        let expiry = Session::max_extension();

        let request = RpcRequest::new(session::methods::SESSION_EXTEND, json!({}));
        self.history.set(topic.clone(), request.clone(), None);
        let opts = session::request_options(session::methods::SESSION_EXTEND);
        self.publish_request(topic, &request, opts).await?;

        self.sessions.update(topic.as_str(), |s| s.expiry = expiry)?;
        self.expirer.set(&expiry_target::session(topic), expiry);
        Ok(expiry)
    }

    /// Notify the peer, then tear the session down locally
    pub async fn disconnect_session(&self, topic: &Topic, reason: Reason) -> PairlinkResult<()> {
        let _ = self.sessions.get(topic.as_str())?;

        let request = RpcRequest::new(
            session::methods::SESSION_DELETE,
            serde_json::to_value(&reason)
                .map_err(|e| PairlinkError::Serialization(e.to_string()))?,
        );
        self.history.set(topic.clone(), request.clone(), None);
        let opts = session::request_options(session::methods::SESSION_DELETE);
        if let Err(e) = self.publish_request(topic, &request, opts).await {
            warn!(topic = %topic, "session delete publish failed: {}", e);
        }
        self.teardown_session(topic, reason).await;
        Ok(())
    }

    // ---- inbound dispatch ----

    async fn handle_message(&self, topic: Topic, payload: Value) {
        match serde_json::from_value::<RpcPayload>(payload) {
            Ok(RpcPayload::Request(request)) => self.handle_inbound_request(topic, request).await,
            Ok(RpcPayload::Response(response)) => {
                self.handle_inbound_response(topic, response).await
            }
            Err(e) => warn!(topic = %topic, "undecodable inbound payload: {}", e),
        }
    }

    async fn handle_inbound_request(&self, topic: Topic, request: RpcRequest) {
        // Relays redeliver; a request id already in history was handled
        if self.history.exists(&topic, request.id) {
            debug!(topic = %topic, id = request.id, "duplicate inbound request, skipping");
            return;
        }
        self.history.set(topic.clone(), request.clone(), None);

        use pairing::methods as pm;
        use session::methods as sm;
        match request.method.as_str() {
            sm::SESSION_PROPOSE => self.on_session_propose(topic, request).await,
            sm::SESSION_SETTLE => self.on_session_settle(topic, request).await,
            sm::SESSION_REQUEST => self.on_session_request(topic, request).await,
            sm::SESSION_EVENT => self.on_session_event(topic, request).await,
            sm::SESSION_UPDATE => self.on_session_update(topic, request).await,
            sm::SESSION_EXTEND => self.on_session_extend(topic, request).await,
            pm::PAIRING_EXTEND => self.on_pairing_extend(topic, request).await,
            sm::SESSION_PING => {
                if self.sessions.contains(topic.as_str()) {
                    self.ack(&topic, request.id, session::response_options(sm::SESSION_PING))
                        .await;
                } else {
                    self.nack(
                        &topic,
                        request.id,
                        reason::NO_MATCHING_TOPIC,
                        "no session for topic",
                        session::response_options(sm::SESSION_PING),
                    )
                    .await;
                }
            }
            pm::PAIRING_PING => {
                if self.pairings.contains(topic.as_str()) {
                    self.ack(&topic, request.id, pairing::response_options(pm::PAIRING_PING))
                        .await;
                } else {
                    self.nack(
                        &topic,
                        request.id,
                        reason::NO_MATCHING_TOPIC,
                        "no pairing for topic",
                        pairing::response_options(pm::PAIRING_PING),
                    )
                    .await;
                }
            }
            sm::SESSION_DELETE => {
                let reason = serde_json::from_value::<Reason>(request.params)
                    .unwrap_or_else(|_| reason::user_disconnected());
                self.ack(&topic, request.id, session::response_options(sm::SESSION_DELETE))
                    .await;
                self.teardown_session(&topic, reason).await;
            }
            pm::PAIRING_DELETE => {
                let reason = serde_json::from_value::<Reason>(request.params)
                    .unwrap_or_else(|_| reason::user_disconnected());
                self.ack(&topic, request.id, pairing::response_options(pm::PAIRING_DELETE))
                    .await;
                self.teardown_pairing(&topic, reason).await;
            }
            other => {
                warn!(topic = %topic, method = %other, "unknown inbound method");
                self.nack(
                    &topic,
                    request.id,
                    reason::INVALID_METHOD,
                    "unknown method",
                    session::response_options(other),
                )
                .await;
            }
        }
    }

    async fn on_session_propose(&self, topic: Topic, request: RpcRequest) {
        let opts = session::response_options(session::methods::SESSION_PROPOSE);
        let params: SessionProposeParams = match serde_json::from_value(request.params) {
            Ok(p) => p,
            Err(e) => {
                self.nack(&topic, request.id, reason::INVALID_PAYLOAD, e.to_string(), opts)
                    .await;
                return;
            }
        };
        if !self.pairings.contains(topic.as_str()) {
            self.nack(
                &topic,
                request.id,
                reason::NO_MATCHING_TOPIC,
                "no pairing for topic",
                opts,
            )
            .await;
            return;
        }

        let peer_metadata = params.proposer.metadata.clone();
        let _ = self.pairings.update(topic.as_str(), |p| {
            p.peer_metadata = Some(peer_metadata);
        });

        let proposal = Proposal {
            id: request.id,
            pairing_topic: topic,
            relay: params.relays.into_iter().next().unwrap_or_default(),
            proposer: params.proposer,
            required_namespaces: params.required_namespaces,
            optional_namespaces: params.optional_namespaces,
            session_topic: None,
            expiry: expiry_from_now(ttl::FIVE_MINUTES),
        };
        self.proposals.set(proposal.clone());
        self.expirer
            .set(&expiry_target::proposal(proposal.id), proposal.expiry);
        let _ = self.event_tx.send(CoreEvent::SessionProposal { proposal });
    }

    /// Proposer side: the settle request arrives on the session topic we
    /// subscribed after the approval response.
    async fn on_session_settle(&self, topic: Topic, request: RpcRequest) {
        let opts = session::response_options(session::methods::SESSION_SETTLE);
        let params: SessionSettleParams = match serde_json::from_value(request.params) {
            Ok(p) => p,
            Err(e) => {
                self.nack(&topic, request.id, reason::INVALID_PAYLOAD, e.to_string(), opts)
                    .await;
                return;
            }
        };

        let matching = self
            .proposals
            .get_all(Some(&|p: &Proposal| {
                p.session_topic.as_ref() == Some(&topic)
            }))
            .into_iter()
            .next();
        let Some(proposal) = matching else {
            self.nack(
                &topic,
                request.id,
                reason::NO_MATCHING_TOPIC,
                "no proposal for topic",
                opts,
            )
            .await;
            return;
        };

        if let Err(e) = assert_conforms(&proposal.required_namespaces, &params.namespaces) {
            warn!(topic = %topic, "settlement namespaces nonconforming: {}", e);
            self.nack(
                &topic,
                request.id,
                reason::SESSION_SETTLEMENT_FAILED,
                e.to_string(),
                opts,
            )
            .await;
            self.drop_proposal(proposal.id);
            return;
        }

        let session = Session {
            topic: topic.clone(),
            pairing_topic: proposal.pairing_topic.clone(),
            relay: params.relay,
            expiry: params.expiry.min(Session::max_extension()),
            controller: false,
            self_public_key: proposal.proposer.public_key.clone(),
            peer_public_key: params.controller.public_key.clone(),
            self_metadata: self.metadata.clone(),
            peer_metadata: params.controller.metadata,
            namespaces: params.namespaces,
            required_namespaces: proposal.required_namespaces.clone(),
        };
        self.sessions.set(session.clone());
        self.expirer
            .set(&expiry_target::session(&topic), session.expiry);
        self.drop_proposal(proposal.id);
        self.activate_pairing(&proposal.pairing_topic);

        self.ack(&topic, request.id, opts).await;
        let _ = self.event_tx.send(CoreEvent::SessionSettled { session });
    }

    async fn on_session_request(&self, topic: Topic, request: RpcRequest) {
        let opts = session::response_options(session::methods::SESSION_REQUEST);
        let Ok(session) = self.sessions.get(topic.as_str()) else {
            self.nack(
                &topic,
                request.id,
                reason::NO_MATCHING_TOPIC,
                "no session for topic",
                opts,
            )
            .await;
            return;
        };
        let params: SessionRequestParams = match serde_json::from_value(request.params) {
            Ok(p) => p,
            Err(e) => {
                self.nack(&topic, request.id, reason::INVALID_PAYLOAD, e.to_string(), opts)
                    .await;
                return;
            }
        };
        if !is_method_authorized(
            &session.namespaces,
            &params.request.method,
            params.chain_id.as_deref(),
        ) {
            self.nack(
                &topic,
                request.id,
                reason::UNAUTHORIZED_METHOD,
                format!("method {} not granted", params.request.method),
                opts,
            )
            .await;
            return;
        }

        let pending = PendingSessionRequest {
            id: request.id,
            topic: topic.clone(),
            method: params.request.method.clone(),
            chain_id: params.chain_id.clone(),
            params: params.request.params.clone(),
            expiry: expiry_from_now(ttl::FIVE_MINUTES),
        };
        self.pending_requests.set(pending);
        self.expirer
            .set(&expiry_target::request(request.id), expiry_from_now(ttl::FIVE_MINUTES));

        let _ = self.event_tx.send(CoreEvent::SessionRequest {
            topic,
            id: request.id,
            method: params.request.method,
            chain_id: params.chain_id,
            params: params.request.params,
        });
    }

    async fn on_session_event(&self, topic: Topic, request: RpcRequest) {
        let opts = session::response_options(session::methods::SESSION_EVENT);
        let Ok(session) = self.sessions.get(topic.as_str()) else {
            self.nack(
                &topic,
                request.id,
                reason::NO_MATCHING_TOPIC,
                "no session for topic",
                opts,
            )
            .await;
            return;
        };
        let params: SessionEventParams = match serde_json::from_value(request.params) {
            Ok(p) => p,
            Err(e) => {
                self.nack(&topic, request.id, reason::INVALID_PAYLOAD, e.to_string(), opts)
                    .await;
                return;
            }
        };
        if !is_event_authorized(&session.namespaces, &params.event.name) {
            self.nack(
                &topic,
                request.id,
                reason::UNAUTHORIZED_EVENT,
                format!("event {} not granted", params.event.name),
                opts,
            )
            .await;
            return;
        }

        self.ack(&topic, request.id, opts).await;
        let _ = self.event_tx.send(CoreEvent::SessionEvent {
            topic,
            name: params.event.name,
            data: params.event.data,
            chain_id: params.chain_id,
        });
    }

    async fn on_session_update(&self, topic: Topic, request: RpcRequest) {
        let opts = session::response_options(session::methods::SESSION_UPDATE);
        let params: SessionUpdateParams = match serde_json::from_value(request.params) {
            Ok(p) => p,
            Err(e) => {
                self.nack(&topic, request.id, reason::INVALID_PAYLOAD, e.to_string(), opts)
                    .await;
                return;
            }
        };
        let namespaces = params.namespaces.clone();
        match self
            .sessions
            .update(topic.as_str(), |s| s.namespaces = namespaces)
        {
            Ok(_) => {
                self.ack(&topic, request.id, opts).await;
                let _ = self.event_tx.send(CoreEvent::SessionUpdated {
                    topic,
                    namespaces: params.namespaces,
                });
            }
            Err(_) => {
                self.nack(
                    &topic,
                    request.id,
                    reason::NO_MATCHING_TOPIC,
                    "no session for topic",
                    opts,
                )
                .await;
            }
        }
    }

    async fn on_session_extend(&self, topic: Topic, request: RpcRequest) {
        let opts = session::response_options(session::methods::SESSION_EXTEND);
        let expiry = Session::max_extension();
        match self.sessions.update(topic.as_str(), |s| s.expiry = expiry) {
            Ok(_) => {
                self.expirer.set(&expiry_target::session(&topic), expiry);
                self.ack(&topic, request.id, opts).await;
                let _ = self
                    .event_tx
                    .send(CoreEvent::SessionExtended { topic, expiry });
            }
            Err(_) => {
                self.nack(
                    &topic,
                    request.id,
                    reason::NO_MATCHING_TOPIC,
                    "no session for topic",
                    opts,
                )
                .await;
            }
        }
    }

    async fn on_pairing_extend(&self, topic: Topic, request: RpcRequest) {
        let opts = pairing::response_options(pairing::methods::PAIRING_EXTEND);
        let expiry = Pairing::max_extension();
        match self.pairings.update(topic.as_str(), |p| p.expiry = expiry) {
            Ok(_) => {
                self.expirer.set(&expiry_target::pairing(&topic), expiry);
                self.ack(&topic, request.id, opts).await;
                let _ = self
                    .event_tx
                    .send(CoreEvent::PairingExtended { topic, expiry });
            }
            Err(_) => {
                self.nack(
                    &topic,
                    request.id,
                    reason::NO_MATCHING_TOPIC,
                    "no pairing for topic",
                    opts,
                )
                .await;
            }
        }
    }

    async fn handle_inbound_response(&self, topic: Topic, response: RpcResponse) {
        self.history.resolve(&response);

        // An answer to one of our proposals carries the responder key;
        // everything else goes to the registered waiter.
        let proposal = self
            .proposals
            .get(&response.id.to_string())
            .ok()
            .filter(|p| p.session_topic.is_none());
        if let Some(proposal) = proposal {
            self.on_propose_response(proposal, response).await;
            return;
        }

        if !self.waiters.resolve(response.id, response.into_result()) {
            debug!(topic = %topic, "response without a waiter, dropping");
        }
    }

    /// Proposer side: derive the session topic from the responder's key and
    /// subscribe so the settle request can reach us.
    async fn on_propose_response(&self, proposal: Proposal, response: RpcResponse) {
        if let Some(error) = &response.error {
            info!(id = proposal.id, "session proposal rejected by peer");
            self.drop_proposal(proposal.id);
            let _ = self.event_tx.send(CoreEvent::SessionRejected {
                id: proposal.id,
                reason: Reason::new(error.code, error.message.clone()),
            });
            return;
        }

        let approval: SessionProposeResult = match response
            .result
            .clone()
            .map(serde_json::from_value)
            .transpose()
        {
            Ok(Some(a)) => a,
            _ => {
                warn!(id = proposal.id, "malformed proposal approval, dropping");
                return;
            }
        };

        let session_topic = match self.crypto.generate_shared_key(
            &proposal.proposer.public_key,
            &approval.responder_public_key,
            None,
        ) {
            Ok(t) => t,
            Err(e) => {
                warn!(id = proposal.id, "session key derivation failed: {}", e);
                self.drop_proposal(proposal.id);
                return;
            }
        };

        if let Err(e) = self.relayer.subscribe(&session_topic).await {
            warn!(topic = %session_topic, "session topic subscribe failed: {}", e);
        }
        let _ = self.proposals.update(&proposal.id.to_string(), |p| {
            p.session_topic = Some(session_topic);
        });
    }

    // ---- background tasks ----

    fn spawn_tasks(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }

        let core = self.clone();
        let mut relay_events = self.relayer.subscribe_events();
        tasks.push(tokio::spawn(async move {
            loop {
                match relay_events.recv().await {
                    Ok(RelayerEvent::Message { topic, payload }) => {
                        core.handle_message(topic, payload).await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "core lagged behind relayer events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));

        let core = self.clone();
        let mut expirer_events = self.expirer.subscribe();
        tasks.push(tokio::spawn(async move {
            loop {
                match expirer_events.recv().await {
                    Ok(ExpirerEvent::Expired { key, .. }) => core.handle_expired(&key).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "core lagged behind expirer events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));

        let core = self.clone();
        let mut ticks = self.heartbeat.subscribe();
        tasks.push(tokio::spawn(async move {
            while ticks.recv().await.is_ok() {
                let expired = core.expirer.check(now_secs());
                if !expired.is_empty() {
                    debug!(count = expired.len(), "expiry scan");
                }
                core.relayer.check_liveness();
                core.relayer.retry_pending_subscriptions().await;
            }
        }));
    }

    async fn handle_expired(&self, key: &str) {
        let Some((kind, target)) = key.split_once(':') else {
            warn!(key, "unrecognized expiry key");
            return;
        };
        match kind {
            "pairing" => {
                self.teardown_pairing(&Topic(target.to_string()), reason::expired())
                    .await
            }
            "session" => {
                self.teardown_session(&Topic(target.to_string()), reason::expired())
                    .await
            }
            "proposal" => {
                if let Ok(id) = target.parse::<u64>() {
                    self.proposals.delete(&id.to_string(), reason::expired());
                    let _ = self.event_tx.send(CoreEvent::SessionRejected {
                        id,
                        reason: reason::expired(),
                    });
                }
            }
            "request" => {
                self.pending_requests.delete(target, reason::expired());
            }
            other => warn!(kind = other, "unrecognized expiry key kind"),
        }
    }

    // ---- internals ----

    async fn publish_request(
        &self,
        topic: &Topic,
        request: &RpcRequest,
        opts: crate::relay::PublishOptions,
    ) -> PairlinkResult<()> {
        let payload = serde_json::to_value(request)
            .map_err(|e| PairlinkError::Serialization(e.to_string()))?;
        self.relayer.publish(topic, &payload, &opts).await
    }

    async fn publish_response(
        &self,
        topic: &Topic,
        response: &RpcResponse,
        opts: crate::relay::PublishOptions,
    ) -> PairlinkResult<()> {
        let payload = serde_json::to_value(response)
            .map_err(|e| PairlinkError::Serialization(e.to_string()))?;
        self.relayer.publish(topic, &payload, &opts).await
    }

    /// Send a `true` result; failure to deliver is logged, not raised
    async fn ack(&self, topic: &Topic, id: u64, opts: crate::relay::PublishOptions) {
        let response = RpcResponse::result(id, Value::Bool(true));
        self.history.resolve(&response);
        if let Err(e) = self.publish_response(topic, &response, opts).await {
            warn!(topic = %topic, id, "ack publish failed: {}", e);
        }
    }

    /// Answer an inbound request with a JSON-RPC error
    async fn nack(
        &self,
        topic: &Topic,
        id: u64,
        code: i64,
        message: impl Into<String>,
        opts: crate::relay::PublishOptions,
    ) {
        let response = RpcResponse::error(id, code, message);
        self.history.resolve(&response);
        if let Err(e) = self.publish_response(topic, &response, opts).await {
            warn!(topic = %topic, id, "error response publish failed: {}", e);
        }
    }

    fn take_proposal(&self, id: u64) -> PairlinkResult<Proposal> {
        let proposal = self
            .proposals
            .get(&id.to_string())
            .map_err(|_| PairlinkError::ProposalNotFound(id))?;
        self.drop_proposal(id);
        Ok(proposal)
    }

    fn drop_proposal(&self, id: u64) {
        self.proposals
            .delete(&id.to_string(), Reason::new(0, "consumed"));
        self.expirer.del(&expiry_target::proposal(id));
    }

    fn activate_pairing(&self, topic: &Topic) {
        if let Ok(pairing) = self.pairings.update(topic.as_str(), |p| p.activate()) {
            self.expirer
                .set(&expiry_target::pairing(topic), pairing.expiry);
        }
    }

    async fn teardown_session(&self, topic: &Topic, reason: Reason) {
        if !self.sessions.contains(topic.as_str()) {
            return;
        }
        self.sessions.delete(topic.as_str(), reason.clone());
        self.expirer.del(&expiry_target::session(topic));
        for pending in self
            .pending_requests
            .get_all(Some(&|r: &PendingSessionRequest| &r.topic == topic))
        {
            self.pending_requests
                .delete(&pending.id.to_string(), reason.clone());
            self.expirer.del(&expiry_target::request(pending.id));
        }
        if let Err(e) = self.crypto.delete_sym_key(topic) {
            debug!(topic = %topic, "sym key removal: {}", e);
        }
        if let Err(e) = self.relayer.unsubscribe(topic).await {
            debug!(topic = %topic, "unsubscribe: {}", e);
        }
        self.history.delete(topic, None);
        let _ = self.event_tx.send(CoreEvent::SessionDeleted {
            topic: topic.clone(),
            reason,
        });
    }

    async fn teardown_pairing(&self, topic: &Topic, reason: Reason) {
        if !self.pairings.contains(topic.as_str()) {
            return;
        }
        self.pairings.delete(topic.as_str(), reason.clone());
        self.expirer.del(&expiry_target::pairing(topic));
        for proposal in self
            .proposals
            .get_all(Some(&|p: &Proposal| &p.pairing_topic == topic))
        {
            self.drop_proposal(proposal.id);
        }
        if let Err(e) = self.crypto.delete_sym_key(topic) {
            debug!(topic = %topic, "sym key removal: {}", e);
        }
        if let Err(e) = self.relayer.unsubscribe(topic).await {
            debug!(topic = %topic, "unsubscribe: {}", e);
        }
        self.history.delete(topic, None);
        let _ = self.event_tx.send(CoreEvent::PairingDeleted {
            topic: topic.clone(),
            reason,
        });
    }
}
