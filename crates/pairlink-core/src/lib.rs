//! Pairlink Core Library
//!
//! Session/transport core of a peer-to-peer wallet-connection protocol.
//!
//! ## Overview
//!
//! Two parties (an application and a wallet) establish an encrypted,
//! topic-addressed channel through an untrusted relay, negotiate
//! capabilities, and exchange JSON-RPC requests over the channel for the
//! lifetime of a session. The core covers key agreement and per-topic
//! symmetric encryption, persisted entity stores, expiry scheduling,
//! request/response correlation with replay protection, and the relay
//! transport (WebSocket JSON-RPC with reconnect, subscription management,
//! and publish-with-acknowledgment).
//!
//! ## Core Principles
//!
//! - **Untrusted relay**: payloads are sealed end to end; the relay only
//!   sees topics and opaque envelopes
//! - **Survives restarts**: pairings, sessions, and subscription intent are
//!   persisted and restored; a transport drop never deletes entities
//! - **Explicit instances**: no global state; every component is owned by
//!   one [`Core`] so tests run isolated cores side by side
//!
//! ## Quick Start
//!
//! ```ignore
//! use pairlink_core::{Core, CoreConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let core = Arc::new(Core::new(CoreConfig::default())?);
//!     core.start().await?;
//!
//!     // Create a pairing and hand the URI to the wallet (QR code, link...)
//!     let (pairing, uri) = core.create_pairing().await?;
//!     println!("scan me: {}", uri);
//!
//!     // Propose a session once the wallet has paired
//!     let proposal_id = core
//!         .propose_session(&pairing.topic, required_namespaces(), Default::default())
//!         .await?;
//!
//!     Ok(())
//! }
//! ```

pub mod crypto;
pub mod engine;
pub mod error;
pub mod expirer;
pub mod heartbeat;
pub mod history;
pub mod namespaces;
pub mod pairing;
pub mod relay;
pub mod rpc;
pub mod session;
pub mod storage;
pub mod store;
pub mod types;
pub mod uri;

// Re-exports
pub use crypto::Crypto;
pub use engine::{Core, CoreConfig, CoreEvent, StorageBackend};
pub use error::{PairlinkError, PairlinkResult};
pub use expirer::{Expirer, ExpirerEvent};
pub use heartbeat::Heartbeat;
pub use history::{History, HistoryRecord};
pub use namespaces::{
    ProposedNamespace, ProposedNamespaces, SettledNamespace, SettledNamespaces,
};
pub use pairing::Pairing;
pub use relay::{
    ConnectionState, PublishOptions, Relayer, RelayerConfig, RelayerEvent,
};
pub use rpc::{RpcPayload, RpcRequest, RpcResponse};
pub use session::{PendingSessionRequest, Proposal, Session};
pub use storage::{KeyValueStorage, MemoryStorage, RedbStorage};
pub use store::{Store, StoreEvent};
pub use types::*;
pub use uri::PairingUri;
