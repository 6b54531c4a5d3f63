//! End-to-end pairing and session flow against the mock relay.
//!
//! Two cores (the application and the wallet) talk through an in-process
//! relay: pair over a shared URI, negotiate a session, exchange an
//! application-level request, and tear down. Also covers explicit
//! disconnect semantics (pending waits rejected, persisted entities kept)
//! and restart restoration from redb-backed storage.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;
use tokio::sync::broadcast;

use common::MockRelay;
use pairlink_core::{
    reason, Core, CoreConfig, CoreEvent, Metadata, PairlinkError, ProposedNamespace,
    ProposedNamespaces, Reason, RelayerConfig, RpcResponse, SettledNamespace, SettledNamespaces,
    StorageBackend,
};

// ============================================================================
// Test Utilities
// ============================================================================

fn test_config(relay: &MockRelay, name: &str) -> CoreConfig {
    CoreConfig {
        relay: RelayerConfig {
            url: relay.url(),
            fallback_url: None,
            project_id: None,
            request_timeout: Duration::from_secs(5),
            publish_ack_timeout: Duration::from_millis(500),
            publish_attempts: 3,
            reconnect_interval: Duration::from_millis(100),
        },
        storage: StorageBackend::Memory,
        metadata: Metadata {
            name: name.to_string(),
            description: format!("{} under test", name),
            url: "https://example.org".to_string(),
            icons: vec![],
        },
        heartbeat_interval: Duration::from_millis(200),
        ping_timeout: Duration::from_secs(2),
        session_request_timeout: Duration::from_secs(5),
    }
}

async fn started_core(relay: &MockRelay, name: &str) -> Arc<Core> {
    let core = Arc::new(Core::new(test_config(relay, name)).unwrap());
    core.start().await.unwrap();
    core
}

fn required_eip155() -> ProposedNamespaces {
    let mut ns = ProposedNamespaces::new();
    ns.insert(
        "eip155".to_string(),
        ProposedNamespace {
            chains: vec!["eip155:1".to_string()],
            methods: vec!["personal_sign".to_string()],
            events: vec!["accountsChanged".to_string()],
        },
    );
    ns
}

fn settled_eip155() -> SettledNamespaces {
    let mut ns = SettledNamespaces::new();
    ns.insert(
        "eip155".to_string(),
        SettledNamespace {
            accounts: vec!["eip155:1:0xabc".to_string()],
            methods: vec!["personal_sign".to_string()],
            events: vec!["accountsChanged".to_string()],
        },
    );
    ns
}

/// Receive events until one matches, or fail after the timeout
async fn wait_for_event<T>(
    events: &mut broadcast::Receiver<CoreEvent>,
    timeout: Duration,
    mut matcher: impl FnMut(CoreEvent) -> Option<T>,
) -> T {
    tokio::time::timeout(timeout, async {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Some(value) = matcher(event) {
                        return value;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_full_pairing_session_and_request_flow() {
    common::init_tracing();
    let relay = MockRelay::start().await;
    let app = started_core(&relay, "app").await;
    let wallet = started_core(&relay, "wallet").await;

    // Pair over the shared URI
    let (pairing, uri) = app.create_pairing().await.unwrap();
    wallet.pair(&uri.to_string()).await.unwrap();

    let mut wallet_events = wallet.subscribe_events();
    let mut app_events = app.subscribe_events();

    // Propose; wallet sees the proposal
    let proposal_id = app
        .propose_session(&pairing.topic, required_eip155(), Default::default())
        .await
        .unwrap();
    let proposal = wait_for_event(&mut wallet_events, Duration::from_secs(5), |e| match e {
        CoreEvent::SessionProposal { proposal } => Some(proposal),
        _ => None,
    })
    .await;
    assert_eq!(proposal.id, proposal_id);
    assert_eq!(proposal.pairing_topic, pairing.topic);
    assert_eq!(proposal.proposer.metadata.name, "app");

    // Approve; both sides settle on the same derived topic
    let wallet_session = wallet
        .approve_session(proposal.id, settled_eip155())
        .await
        .unwrap();
    let app_session = wait_for_event(&mut app_events, Duration::from_secs(5), |e| match e {
        CoreEvent::SessionSettled { session } => Some(session),
        _ => None,
    })
    .await;
    assert_eq!(app_session.topic, wallet_session.topic);
    assert!(wallet_session.controller);
    assert!(!app_session.controller);
    assert_eq!(app_session.peer_metadata.name, "wallet");

    // The wallet answers the app's personal_sign request
    let responder = {
        let wallet = wallet.clone();
        tokio::spawn(async move {
            let (topic, id) =
                wait_for_event(&mut wallet_events, Duration::from_secs(5), |e| match e {
                    CoreEvent::SessionRequest {
                        topic, id, method, ..
                    } => {
                        assert_eq!(method, "personal_sign");
                        Some((topic, id))
                    }
                    _ => None,
                })
                .await;
            wallet
                .respond(&topic, RpcResponse::result(id, json!("0xsigned")))
                .await
                .unwrap();
        })
    };

    let outcome = app
        .session_request(
            &app_session.topic,
            Some("eip155:1".to_string()),
            "personal_sign",
            json!(["0xdeadbeef", "eip155:1:0xabc"]),
        )
        .await
        .unwrap();
    assert_eq!(outcome, json!("0xsigned"));
    responder.await.unwrap();

    // Ping both directions over the settled topic
    app.ping(&app_session.topic).await.unwrap();
    wallet.ping(&wallet_session.topic).await.unwrap();

    app.shutdown().await;
    wallet.shutdown().await;
}

#[tokio::test]
async fn test_wallet_rejection_reaches_the_proposer() {
    let relay = MockRelay::start().await;
    let app = started_core(&relay, "app").await;
    let wallet = started_core(&relay, "wallet").await;

    let (pairing, uri) = app.create_pairing().await.unwrap();
    wallet.pair(&uri.to_string()).await.unwrap();
    let mut wallet_events = wallet.subscribe_events();
    let mut app_events = app.subscribe_events();

    let proposal_id = app
        .propose_session(&pairing.topic, required_eip155(), Default::default())
        .await
        .unwrap();
    let proposal = wait_for_event(&mut wallet_events, Duration::from_secs(5), |e| match e {
        CoreEvent::SessionProposal { proposal } => Some(proposal),
        _ => None,
    })
    .await;

    wallet
        .reject_session(
            proposal.id,
            Reason::new(reason::USER_REJECTED, "user rejected"),
        )
        .await
        .unwrap();

    let (id, rejection) = wait_for_event(&mut app_events, Duration::from_secs(5), |e| match e {
        CoreEvent::SessionRejected { id, reason } => Some((id, reason)),
        _ => None,
    })
    .await;
    assert_eq!(id, proposal_id);
    assert_eq!(rejection.code, reason::USER_REJECTED);

    app.shutdown().await;
    wallet.shutdown().await;
}

#[tokio::test]
async fn test_approve_with_partial_namespaces_fails_locally() {
    let relay = MockRelay::start().await;
    let app = started_core(&relay, "app").await;
    let wallet = started_core(&relay, "wallet").await;

    let (pairing, uri) = app.create_pairing().await.unwrap();
    wallet.pair(&uri.to_string()).await.unwrap();
    let mut wallet_events = wallet.subscribe_events();

    let mut required = required_eip155();
    required.insert(
        "cosmos".to_string(),
        ProposedNamespace {
            chains: vec!["cosmos:cosmoshub-4".to_string()],
            methods: vec!["cosmos_signDirect".to_string()],
            events: vec![],
        },
    );
    app.propose_session(&pairing.topic, required, Default::default())
        .await
        .unwrap();
    let proposal = wait_for_event(&mut wallet_events, Duration::from_secs(5), |e| match e {
        CoreEvent::SessionProposal { proposal } => Some(proposal),
        _ => None,
    })
    .await;

    // Granting only eip155 while cosmos was required rejects the whole grant
    let result = wallet.approve_session(proposal.id, settled_eip155()).await;
    assert!(matches!(
        result,
        Err(PairlinkError::NamespacesMismatch(_))
    ));
    // The proposal is still there for an explicit reject
    wallet
        .reject_session(
            proposal.id,
            Reason::new(reason::UNSUPPORTED_NAMESPACES, "unsupported chains"),
        )
        .await
        .unwrap();

    app.shutdown().await;
    wallet.shutdown().await;
}

#[tokio::test]
async fn test_session_delete_propagates_to_the_peer() {
    let relay = MockRelay::start().await;
    let app = started_core(&relay, "app").await;
    let wallet = started_core(&relay, "wallet").await;

    let (pairing, uri) = app.create_pairing().await.unwrap();
    wallet.pair(&uri.to_string()).await.unwrap();
    let mut wallet_events = wallet.subscribe_events();
    let mut app_events = app.subscribe_events();

    app.propose_session(&pairing.topic, required_eip155(), Default::default())
        .await
        .unwrap();
    let proposal = wait_for_event(&mut wallet_events, Duration::from_secs(5), |e| match e {
        CoreEvent::SessionProposal { proposal } => Some(proposal),
        _ => None,
    })
    .await;
    let session = wallet
        .approve_session(proposal.id, settled_eip155())
        .await
        .unwrap();
    wait_for_event(&mut app_events, Duration::from_secs(5), |e| match e {
        CoreEvent::SessionSettled { .. } => Some(()),
        _ => None,
    })
    .await;

    wallet
        .disconnect_session(&session.topic, reason::user_disconnected())
        .await
        .unwrap();

    let delete_reason = wait_for_event(&mut app_events, Duration::from_secs(5), |e| match e {
        CoreEvent::SessionDeleted { topic, reason } if topic == session.topic => Some(reason),
        _ => None,
    })
    .await;
    assert_eq!(delete_reason.code, reason::USER_DISCONNECTED);
    assert!(app.sessions().is_empty());

    app.shutdown().await;
    wallet.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_rejects_pending_waits_and_keeps_entities() {
    let relay = MockRelay::start().await;
    let app = started_core(&relay, "app").await;

    // Nobody ever answers on the pairing topic, so the ping stays pending
    let (pairing, _) = app.create_pairing().await.unwrap();

    let pinger = {
        let app = app.clone();
        let topic = pairing.topic.clone();
        tokio::spawn(async move { app.ping(&topic).await })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;

    app.shutdown().await;

    let outcome = pinger.await.unwrap();
    assert!(matches!(outcome, Err(PairlinkError::TransportClosed)));
    // Persisted entities survive the transport teardown
    assert!(app.pairings().iter().any(|p| p.topic == pairing.topic));
    assert!(!app.is_connected());
}

#[tokio::test]
async fn test_restart_restores_persisted_pairings() {
    let relay = MockRelay::start().await;
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("pairlink.redb");

    let topic = {
        let mut config = test_config(&relay, "app");
        config.storage = StorageBackend::Persistent(db_path.clone());
        let core = Arc::new(Core::new(config).unwrap());
        core.start().await.unwrap();
        let (pairing, _) = core.create_pairing().await.unwrap();
        core.shutdown().await;
        pairing.topic
    };
    // Let aborted tasks release their handles before reopening the database
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut config = test_config(&relay, "app");
    config.storage = StorageBackend::Persistent(db_path);
    let restored = Arc::new(Core::new(config).unwrap());
    restored.start().await.unwrap();
    assert!(restored.pairings().iter().any(|p| p.topic == topic));

    // The pairing topic is resubscribed on the relay after restart
    tokio::time::timeout(Duration::from_secs(2), async {
        while relay.subscriber_count(topic.as_str()) == 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("pairing topic resubscribed after restart");

    restored.shutdown().await;
}
