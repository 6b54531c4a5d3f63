//! Shared test harness: an in-process mock relay.
//!
//! The mock speaks the relay wire protocol over WebSocket JSON-RPC:
//! `subscribe(topic) -> subscriptionId`, `unsubscribe(id, topic)`,
//! `publish(topic, message, ttl, tag, prompt) -> ack`, and the inbound
//! `subscription(id, data{topic, message})` notification. Messages published
//! to a topic nobody is subscribed to yet are held in a per-topic mailbox and
//! delivered on the next subscribe, matching the retention a real relay
//! provides within the message ttl.
//!
//! Test controls: publish acknowledgments can be suppressed (to exercise the
//! retry budget) and all client sockets can be force-closed (to exercise
//! reconnect and resubscription).

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

/// Opt-in log output for debugging: `RUST_LOG=debug cargo test`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

struct ClientSub {
    sub_id: String,
    tx: mpsc::UnboundedSender<Message>,
}

struct RelayState {
    ack_publishes: AtomicBool,
    next_sub_id: AtomicU64,
    next_note_id: AtomicU64,
    /// topic -> subscribed clients
    subscriptions: Mutex<HashMap<String, Vec<ClientSub>>>,
    /// topic -> messages retained for future subscribers
    mailbox: Mutex<HashMap<String, Vec<String>>>,
    kick: broadcast::Sender<()>,
}

impl RelayState {
    fn notification(&self, sub_id: &str, topic: &str, message: &str) -> Message {
        let id = self.next_note_id.fetch_add(1, Ordering::SeqCst);
        Message::Text(
            json!({
                "id": id,
                "jsonrpc": "2.0",
                "method": "subscription",
                "params": {"id": sub_id, "data": {"topic": topic, "message": message}}
            })
            .to_string(),
        )
    }
}

/// In-process relay for integration tests
pub struct MockRelay {
    addr: SocketAddr,
    state: Arc<RelayState>,
    accept_task: JoinHandle<()>,
}

impl MockRelay {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (kick, _) = broadcast::channel(8);
        let state = Arc::new(RelayState {
            ack_publishes: AtomicBool::new(true),
            next_sub_id: AtomicU64::new(1),
            next_note_id: AtomicU64::new(1_000_000),
            subscriptions: Mutex::new(HashMap::new()),
            mailbox: Mutex::new(HashMap::new()),
            kick,
        });

        let accept_state = state.clone();
        let accept_task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve_client(accept_state.clone(), stream));
            }
        });

        Self {
            addr,
            state,
            accept_task,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// When false, `publish` requests get no response at all
    pub fn set_acking(&self, ack: bool) {
        self.state.ack_publishes.store(ack, Ordering::SeqCst);
    }

    /// Force-close every connected client socket
    pub fn kick_all(&self) {
        let _ = self.state.kick.send(());
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.state
            .subscriptions
            .lock()
            .get(topic)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }
}

impl Drop for MockRelay {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn serve_client(state: Arc<RelayState>, stream: TcpStream) {
    let socket = match tokio_tungstenite::accept_async(stream).await {
        Ok(s) => s,
        Err(_) => return,
    };
    let (mut sink, mut read) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let mut kick = state.kick.subscribe();

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            _ = kick.recv() => {
                let _ = tx.send(Message::Close(None));
                break;
            }
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => handle_frame(&state, &tx, &text),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            }
        }
    }

    // Forget this client's subscriptions
    let mut subs = state.subscriptions.lock();
    for clients in subs.values_mut() {
        clients.retain(|c| !c.tx.same_channel(&tx));
    }
    subs.retain(|_, clients| !clients.is_empty());
    drop(subs);
    writer.abort();
}

fn handle_frame(state: &Arc<RelayState>, tx: &mpsc::UnboundedSender<Message>, text: &str) {
    let frame: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => return,
    };
    let Some(method) = frame.get("method").and_then(Value::as_str) else {
        // A client ack for one of our notifications
        return;
    };
    let Some(id) = frame.get("id").and_then(Value::as_u64) else {
        return;
    };
    let params = frame.get("params").cloned().unwrap_or(Value::Null);

    match method {
        "subscribe" => {
            let topic = params["topic"].as_str().unwrap_or_default().to_string();
            let sub_id = format!(
                "mock-sub-{}",
                state.next_sub_id.fetch_add(1, Ordering::SeqCst)
            );
            state
                .subscriptions
                .lock()
                .entry(topic.clone())
                .or_default()
                .push(ClientSub {
                    sub_id: sub_id.clone(),
                    tx: tx.clone(),
                });
            respond(tx, id, json!(sub_id));

            // Drain the topic mailbox to the new subscriber
            let retained = state.mailbox.lock().remove(&topic).unwrap_or_default();
            for message in retained {
                let _ = tx.send(state.notification(&sub_id, &topic, &message));
            }
        }
        "unsubscribe" => {
            let topic = params["topic"].as_str().unwrap_or_default();
            let mut subs = state.subscriptions.lock();
            if let Some(clients) = subs.get_mut(topic) {
                clients.retain(|c| !c.tx.same_channel(tx));
                if clients.is_empty() {
                    subs.remove(topic);
                }
            }
            drop(subs);
            respond(tx, id, json!(true));
        }
        "publish" => {
            let topic = params["topic"].as_str().unwrap_or_default().to_string();
            let message = params["message"].as_str().unwrap_or_default().to_string();

            if !state.ack_publishes.load(Ordering::SeqCst) {
                return;
            }

            let mut delivered = false;
            {
                let subs = state.subscriptions.lock();
                if let Some(clients) = subs.get(&topic) {
                    for client in clients {
                        // A publisher never receives its own message back
                        if client.tx.same_channel(tx) {
                            continue;
                        }
                        let _ = client
                            .tx
                            .send(state.notification(&client.sub_id, &topic, &message));
                        delivered = true;
                    }
                }
            }
            if !delivered {
                state.mailbox.lock().entry(topic).or_default().push(message);
            }
            respond(tx, id, json!(true));
        }
        _ => {
            let _ = tx.send(Message::Text(
                json!({
                    "id": id,
                    "jsonrpc": "2.0",
                    "error": {"code": 1001, "message": "unsupported method"}
                })
                .to_string(),
            ));
        }
    }
}

fn respond(tx: &mpsc::UnboundedSender<Message>, id: u64, result: Value) {
    let _ = tx.send(Message::Text(
        json!({"id": id, "jsonrpc": "2.0", "result": result}).to_string(),
    ));
}
