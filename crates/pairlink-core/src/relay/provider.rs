//! WebSocket JSON-RPC connection to the relay.
//!
//! The provider owns exactly one socket at a time and models its lifecycle
//! as an explicit state machine:
//!
//! ```text
//! Disconnected → Connecting → Connected → (unexpected close) → Reconnecting
//!                                      ↘ (explicit disconnect) → Disconnected
//! ```
//!
//! Reconnect attempts are serialized inside a single supervisor task (a new
//! attempt never starts while one is in flight) with a fixed base interval
//! between attempts, alternating to the fallback relay URL when one is
//! configured. An explicit [`Provider::disconnect`] cancels the supervisor
//! and rejects every pending request-response wait with `TransportClosed`.
//!
//! Half-open sockets are caught by [`Provider::check_liveness`], driven on
//! a heartbeat cadence: it pings the socket and forces a reconnect when a
//! probe goes unanswered for a whole tick.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::error::{PairlinkError, PairlinkResult};
use crate::rpc::{RpcPayload, RpcRequest, RpcResponse};
use crate::types::reason;

/// Capacity of the provider event channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Relay method name of inbound message notifications
pub const SUBSCRIPTION_METHOD: &str = "subscription";

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket, no supervisor running
    Disconnected,
    /// First connection attempt in flight
    Connecting,
    /// Socket is live
    Connected,
    /// Connection dropped unexpectedly; supervisor is retrying
    Reconnecting,
}

/// Events emitted by the provider
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    /// Socket established (initial connect or reconnect)
    Connected,
    /// Socket lost (unexpected close or explicit disconnect)
    Disconnected,
    /// Inbound JSON-RPC request from the relay (message notification)
    InboundRequest(RpcRequest),
}

/// Provider configuration
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Primary relay endpoint
    pub url: String,
    /// Secondary relay endpoint, tried when the primary fails
    pub fallback_url: Option<String>,
    /// Default deadline for request-response waits
    pub request_timeout: Duration,
    /// Base delay between reconnect attempts
    pub reconnect_interval: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            url: "wss://relay.pairlink.org".to_string(),
            fallback_url: None,
            request_timeout: Duration::from_secs(30),
            reconnect_interval: Duration::from_secs(1),
        }
    }
}

struct ProviderInner {
    config: ProviderConfig,
    state: RwLock<ConnectionState>,
    sender: RwLock<Option<mpsc::UnboundedSender<Message>>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<PairlinkResult<Value>>>>,
    event_tx: broadcast::Sender<ProviderEvent>,
    closed: AtomicBool,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    /// Set when a liveness ping went out; cleared by any inbound frame
    awaiting_pong: AtomicBool,
    /// Wakes the reader loop to drop a socket deemed dead
    reconnect_notify: Notify,
}

impl ProviderInner {
    fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
    }

    /// Fail every pending wait with an error produced per waiter
    fn reject_pending(&self, make_err: impl Fn() -> PairlinkError) {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        for (_, tx) in drained {
            let _ = tx.send(Err(make_err()));
        }
    }

    fn send_raw(&self, text: String) -> PairlinkResult<()> {
        self.send_message(Message::Text(text))
    }

    fn send_message(&self, message: Message) -> PairlinkResult<()> {
        let sender = self
            .sender
            .read()
            .clone()
            .ok_or_else(|| PairlinkError::Network("not connected".to_string()))?;
        sender
            .send(message)
            .map_err(|_| PairlinkError::Network("send queue closed".to_string()))
    }

    fn handle_text(&self, text: &str) {
        let payload: RpcPayload = match serde_json::from_str(text) {
            Ok(p) => p,
            Err(e) => {
                warn!("unparsable relay frame, dropping: {}", e);
                return;
            }
        };

        match payload {
            RpcPayload::Response(res) => {
                let waiter = self.pending.lock().remove(&res.id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(res.into_result());
                    }
                    None => debug!(id = res.id, "late relay response, dropping"),
                }
            }
            RpcPayload::Request(req) => {
                if req.method == SUBSCRIPTION_METHOD {
                    // Ack first so the relay can stop redelivering, then
                    // hand the notification up.
                    let ack = RpcResponse::result(req.id, Value::Bool(true));
                    if let Ok(text) = serde_json::to_string(&ack) {
                        let _ = self.send_raw(text);
                    }
                    let _ = self.event_tx.send(ProviderEvent::InboundRequest(req));
                } else {
                    warn!(method = %req.method, "unexpected relay request");
                    let err =
                        RpcResponse::error(req.id, reason::INVALID_METHOD, "unsupported method");
                    if let Ok(text) = serde_json::to_string(&err) {
                        let _ = self.send_raw(text);
                    }
                }
            }
        }
    }
}

/// Handle to the relay connection; cheap to clone
#[derive(Clone)]
pub struct Provider {
    inner: Arc<ProviderInner>,
}

impl Provider {
    /// Create a provider (not yet connected)
    pub fn new(config: ProviderConfig) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(ProviderInner {
                config,
                state: RwLock::new(ConnectionState::Disconnected),
                sender: RwLock::new(None),
                pending: Mutex::new(HashMap::new()),
                event_tx,
                closed: AtomicBool::new(false),
                supervisor: Mutex::new(None),
                awaiting_pong: AtomicBool::new(false),
                reconnect_notify: Notify::new(),
            }),
        }
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.read()
    }

    /// Whether the socket is currently live
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Subscribe to provider events
    pub fn subscribe_events(&self) -> broadcast::Receiver<ProviderEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Open the connection and start the supervisor.
    ///
    /// Resolves once the first connection attempt succeeds (the fallback
    /// URL is tried if the primary fails) or fails definitively. After the
    /// initial success, unexpected closures are retried indefinitely until
    /// [`disconnect`](Self::disconnect).
    pub async fn connect(&self) -> PairlinkResult<()> {
        if self.is_connected() {
            return Ok(());
        }
        self.inner.closed.store(false, Ordering::SeqCst);

        let (ready_tx, ready_rx) = oneshot::channel();
        let inner = self.inner.clone();
        let handle = tokio::spawn(supervise(inner, ready_tx));
        if let Some(previous) = self.inner.supervisor.lock().replace(handle) {
            previous.abort();
        }

        ready_rx
            .await
            .map_err(|_| PairlinkError::Network("connection task ended".to_string()))?
    }

    /// Send a JSON-RPC request and wait for its response with the default
    /// timeout
    pub async fn request(&self, method: &str, params: Value) -> PairlinkResult<Value> {
        self.request_with_timeout(method, params, self.inner.config.request_timeout)
            .await
    }

    /// Send a JSON-RPC request and wait for its response with an explicit
    /// deadline
    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Value,
        deadline: Duration,
    ) -> PairlinkResult<Value> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(PairlinkError::TransportClosed);
        }

        let request = RpcRequest::new(method, params);
        let id = request.id;

        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(id, tx);

        let text = serde_json::to_string(&request)
            .map_err(|e| PairlinkError::Serialization(e.to_string()))?;
        if let Err(e) = self.inner.send_raw(text) {
            self.inner.pending.lock().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(outcome)) => outcome,
            // Waiter dropped without a value: transport torn down
            Ok(Err(_)) => Err(PairlinkError::TransportClosed),
            Err(_) => {
                self.inner.pending.lock().remove(&id);
                Err(PairlinkError::RequestTimeout(id))
            }
        }
    }

    /// Probe the socket, called on a heartbeat cadence.
    ///
    /// Sends a WebSocket ping; any inbound frame before the next probe
    /// counts as proof of life. A probe still unanswered when the next one
    /// is due means the socket is half-open, so the reader loop is woken to
    /// drop it and the supervisor reconnects. Returns `false` when a stale
    /// socket was detected.
    pub fn check_liveness(&self) -> bool {
        if !self.is_connected() {
            return true;
        }
        if self.inner.awaiting_pong.swap(true, Ordering::SeqCst) {
            warn!("no relay traffic since the last liveness probe, dropping socket");
            self.inner.awaiting_pong.store(false, Ordering::SeqCst);
            self.inner.reconnect_notify.notify_waiters();
            return false;
        }
        let _ = self.inner.send_message(Message::Ping(Vec::new()));
        true
    }

    /// Close the connection for good.
    ///
    /// Cancels the reconnect supervisor and rejects all pending
    /// request-response waits with `TransportClosed`. Persisted entities
    /// are untouched; they survive a transport restart.
    pub async fn disconnect(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);

        if let Some(sender) = self.inner.sender.write().take() {
            let _ = sender.send(Message::Close(None));
        }
        if let Some(handle) = self.inner.supervisor.lock().take() {
            handle.abort();
        }

        self.inner
            .reject_pending(|| PairlinkError::TransportClosed);
        self.inner.set_state(ConnectionState::Disconnected);
        let _ = self.inner.event_tx.send(ProviderEvent::Disconnected);
    }
}

/// Connection supervisor: one serialized connect/reconnect loop
async fn supervise(inner: Arc<ProviderInner>, ready: oneshot::Sender<PairlinkResult<()>>) {
    let mut ready = Some(ready);
    let mut use_fallback = false;

    loop {
        if inner.closed.load(Ordering::SeqCst) {
            break;
        }

        let url = match (&inner.config.fallback_url, use_fallback) {
            (Some(fallback), true) => fallback.clone(),
            _ => inner.config.url.clone(),
        };
        let initial = ready.is_some();
        inner.set_state(if initial {
            ConnectionState::Connecting
        } else {
            ConnectionState::Reconnecting
        });

        match connect_async(url.as_str()).await {
            Ok((socket, _)) => {
                info!(url = %url, "relay connected");
                // Install the writer channel before announcing the
                // connection, so reactions to Connected can send right away.
                let (tx, rx) = mpsc::unbounded_channel::<Message>();
                *inner.sender.write() = Some(tx);
                inner.awaiting_pong.store(false, Ordering::SeqCst);
                inner.set_state(ConnectionState::Connected);
                if let Some(r) = ready.take() {
                    let _ = r.send(Ok(()));
                }
                let _ = inner.event_tx.send(ProviderEvent::Connected);

                run_connection(&inner, socket, rx).await;

                *inner.sender.write() = None;
                // In-flight waits die with the socket; callers retry with
                // idempotent request ids validated against history.
                inner.reject_pending(|| {
                    PairlinkError::Network("connection closed".to_string())
                });
                let _ = inner.event_tx.send(ProviderEvent::Disconnected);

                if inner.closed.load(Ordering::SeqCst) {
                    break;
                }
                inner.set_state(ConnectionState::Reconnecting);
                info!(url = %url, "relay connection lost, reconnecting");
            }
            Err(e) => {
                warn!(url = %url, "relay connection attempt failed: {}", e);
                if initial {
                    // One shot at the fallback before giving up the initial
                    // connect; reconnects keep alternating instead.
                    if !use_fallback && inner.config.fallback_url.is_some() {
                        use_fallback = true;
                        continue;
                    }
                    inner.set_state(ConnectionState::Disconnected);
                    if let Some(r) = ready.take() {
                        let _ = r.send(Err(PairlinkError::Network(e.to_string())));
                    }
                    return;
                }
                if inner.config.fallback_url.is_some() {
                    use_fallback = !use_fallback;
                }
            }
        }

        tokio::time::sleep(inner.config.reconnect_interval).await;
    }

    inner.set_state(ConnectionState::Disconnected);
}

/// Pump one live socket until it closes
async fn run_connection(
    inner: &Arc<ProviderInner>,
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    let (mut sink, mut stream) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if sink.send(message).await.is_err() {
                break;
            }
            if closing {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            _ = inner.reconnect_notify.notified() => break,
            frame = stream.next() => {
                let Some(frame) = frame else { break };
                // Anything the relay sends, pong frames included, proves
                // the socket is alive.
                inner.awaiting_pong.store(false, Ordering::SeqCst);
                match frame {
                    Ok(Message::Text(text)) => inner.handle_text(&text),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        debug!("relay socket error: {}", e);
                        break;
                    }
                }
                if inner.closed.load(Ordering::SeqCst) {
                    break;
                }
            }
        }
    }

    writer.abort();
}
