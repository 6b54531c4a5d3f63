//! Topic subscription bookkeeping.
//!
//! The subscriber exclusively owns the topic → subscription-id mapping.
//! Topics live in one of two sets: `active` (live relay subscription) or
//! `pending` (intent remembered while the connection is down or the relay
//! call failed). Connection loss never drops subscription intent: every
//! remembered topic is resubscribed in a best-effort batch on reconnect,
//! with individual failures left pending for later retries instead of
//! aborting the batch.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::error::{PairlinkError, PairlinkResult};
use crate::types::{SubscriptionId, Topic};

use super::provider::Provider;

/// Relay `subscription` notification parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionParams {
    /// Relay-assigned subscription id
    pub id: SubscriptionId,
    /// The message and its topic
    pub data: SubscriptionData,
}

/// Payload half of a `subscription` notification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionData {
    /// Topic the message was published to
    pub topic: Topic,
    /// Opaque wire string (sealed envelope or hex fallback)
    pub message: String,
}

/// Subscription state owner
pub struct Subscriber {
    provider: Provider,
    active: RwLock<HashMap<Topic, SubscriptionId>>,
    pending: RwLock<HashSet<Topic>>,
}

impl Subscriber {
    /// Create a subscriber over the given provider
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            active: RwLock::new(HashMap::new()),
            pending: RwLock::new(HashSet::new()),
        }
    }

    /// Subscribe to a topic.
    ///
    /// The intent is remembered immediately; if the relay is unreachable
    /// the returned id is provisional (the topic itself) and the real
    /// subscription is established on the next (re)connect.
    pub async fn subscribe(&self, topic: &Topic) -> PairlinkResult<SubscriptionId> {
        if let Some(id) = self.active.read().get(topic) {
            return Ok(id.clone());
        }
        self.pending.write().insert(topic.clone());

        if !self.provider.is_connected() {
            debug!(topic = %topic, "offline subscribe, keeping intent pending");
            return Ok(SubscriptionId(topic.0.clone()));
        }

        self.subscribe_now(topic).await
    }

    /// Drop a topic subscription and forget the intent
    pub async fn unsubscribe(&self, topic: &Topic) -> PairlinkResult<()> {
        self.pending.write().remove(topic);
        let id = self.active.write().remove(topic);

        if let Some(id) = id {
            if self.provider.is_connected() {
                // Best effort: the relay expires server-side state anyway
                if let Err(e) = self
                    .provider
                    .request("unsubscribe", json!({ "id": id, "topic": topic }))
                    .await
                {
                    warn!(topic = %topic, "unsubscribe failed: {}", e);
                }
            }
        }
        Ok(())
    }

    /// Whether a topic is subscribed or pending subscription
    pub fn is_known_topic(&self, topic: &Topic) -> bool {
        self.active.read().contains_key(topic) || self.pending.read().contains(topic)
    }

    /// Topics with a live relay subscription
    pub fn active_topics(&self) -> Vec<Topic> {
        self.active.read().keys().cloned().collect()
    }

    /// Topics awaiting (re)connection
    pub fn pending_topics(&self) -> Vec<Topic> {
        self.pending.read().iter().cloned().collect()
    }

    /// Demote every active subscription to pending (connection lost);
    /// relay-side ids are worthless across connections.
    pub fn on_disconnected(&self) {
        let dropped: Vec<Topic> = self.active.write().drain().map(|(topic, _)| topic).collect();
        if !dropped.is_empty() {
            debug!(count = dropped.len(), "remembering topics across disconnect");
            self.pending.write().extend(dropped);
        }
    }

    /// Best-effort batch resubscription of every remembered topic.
    ///
    /// Called on each successful (re)connect and retried from the
    /// heartbeat while anything is left pending. Individual failures stay
    /// pending; they never abort the batch.
    pub async fn resubscribe_all(&self) {
        let topics = self.pending_topics();
        for topic in topics {
            if let Err(e) = self.subscribe_now(&topic).await {
                warn!(topic = %topic, "resubscribe failed, will retry: {}", e);
            }
        }
    }

    /// Match an inbound notification to a known topic.
    ///
    /// Messages for topics we never subscribed to are dropped (the relay
    /// is untrusted; unknown-topic traffic is noise or misdelivery).
    pub fn route_inbound(&self, params: serde_json::Value) -> Option<SubscriptionData> {
        let params: SubscriptionParams = match serde_json::from_value(params) {
            Ok(p) => p,
            Err(e) => {
                warn!("malformed subscription notification: {}", e);
                return None;
            }
        };
        if !self.is_known_topic(&params.data.topic) {
            warn!(topic = %params.data.topic, "message for unknown topic, dropping");
            return None;
        }
        Some(params.data)
    }

    /// Issue the relay call for one topic and promote it to active
    async fn subscribe_now(&self, topic: &Topic) -> PairlinkResult<SubscriptionId> {
        let result = self
            .provider
            .request("subscribe", json!({ "topic": topic }))
            .await?;

        let id = match result {
            serde_json::Value::String(id) => SubscriptionId(id),
            other => {
                return Err(PairlinkError::Serialization(format!(
                    "subscribe ack is not a string: {}",
                    other
                )))
            }
        };

        self.pending.write().remove(topic);
        self.active.write().insert(topic.clone(), id.clone());
        debug!(topic = %topic, id = %id, "subscribed");
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::provider::ProviderConfig;
    use serde_json::json;

    fn make_subscriber() -> Subscriber {
        Subscriber::new(Provider::new(ProviderConfig::default()))
    }

    #[tokio::test]
    async fn test_offline_subscribe_keeps_intent_pending() {
        let subscriber = make_subscriber();
        let topic = Topic::generate();

        let id = subscriber.subscribe(&topic).await.unwrap();
        // Provisional id until the relay assigns one
        assert_eq!(id.as_str(), topic.as_str());
        assert!(subscriber.is_known_topic(&topic));
        assert_eq!(subscriber.pending_topics(), vec![topic.clone()]);
        assert!(subscriber.active_topics().is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribe_forgets_intent() {
        let subscriber = make_subscriber();
        let topic = Topic::generate();

        subscriber.subscribe(&topic).await.unwrap();
        subscriber.unsubscribe(&topic).await.unwrap();
        assert!(!subscriber.is_known_topic(&topic));
    }

    #[tokio::test]
    async fn test_on_disconnected_demotes_active() {
        let subscriber = make_subscriber();
        let topic = Topic::generate();
        subscriber
            .active
            .write()
            .insert(topic.clone(), SubscriptionId("relay-id".to_string()));

        subscriber.on_disconnected();

        assert!(subscriber.active_topics().is_empty());
        assert_eq!(subscriber.pending_topics(), vec![topic.clone()]);
        assert!(subscriber.is_known_topic(&topic));
    }

    #[tokio::test]
    async fn test_route_inbound_known_topic() {
        let subscriber = make_subscriber();
        let topic = Topic::generate();
        subscriber.subscribe(&topic).await.unwrap();

        let data = subscriber
            .route_inbound(json!({
                "id": "sub-1",
                "data": {"topic": topic, "message": "deadbeef"}
            }))
            .unwrap();
        assert_eq!(data.topic, topic);
        assert_eq!(data.message, "deadbeef");
    }

    #[tokio::test]
    async fn test_route_inbound_unknown_topic_dropped() {
        let subscriber = make_subscriber();
        let routed = subscriber.route_inbound(json!({
            "id": "sub-1",
            "data": {"topic": "never-subscribed", "message": "deadbeef"}
        }));
        assert!(routed.is_none());
    }

    #[tokio::test]
    async fn test_route_inbound_malformed_dropped() {
        let subscriber = make_subscriber();
        assert!(subscriber.route_inbound(json!({"garbage": true})).is_none());
    }
}
