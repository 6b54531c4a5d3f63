//! Publish-with-acknowledgment retry loop.
//!
//! Publishes are at-least-once: we resend until the relay acks or the
//! retry budget runs out, so payloads must carry idempotent request ids
//! (history-backed deduplication on the receiving side absorbs duplicates).

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::crypto::Crypto;
use crate::error::{PairlinkError, PairlinkResult};
use crate::types::{ttl, Topic};

use super::provider::Provider;

/// Per-publish relay options
#[derive(Debug, Clone)]
pub struct PublishOptions {
    /// Relay-side retention, in seconds
    pub ttl: i64,
    /// Protocol tag identifying the payload kind
    pub tag: u32,
    /// Whether the relay should trigger a push notification
    pub prompt: bool,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            ttl: ttl::FIVE_MINUTES,
            tag: 0,
            prompt: false,
        }
    }
}

/// Publisher: encrypts, sends, and retries until acked
pub struct Publisher {
    provider: Provider,
    crypto: Arc<Crypto>,
    ack_timeout: Duration,
    max_attempts: u32,
}

impl Publisher {
    /// Create a publisher over the given provider and crypto engine
    pub fn new(
        provider: Provider,
        crypto: Arc<Crypto>,
        ack_timeout: Duration,
        max_attempts: u32,
    ) -> Self {
        Self {
            provider,
            crypto,
            ack_timeout,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Publish a payload to a topic and wait for the relay ack.
    ///
    /// The payload is sealed under the topic's key when one is registered,
    /// otherwise sent in the reversible fallback encoding (handshake
    /// bootstrap). Retries up to the attempt budget, then fails with
    /// `PublishFailure`.
    pub async fn publish(
        &self,
        topic: &Topic,
        payload: &Value,
        opts: &PublishOptions,
    ) -> PairlinkResult<()> {
        let message = self.crypto.encode(topic, payload)?;
        let params = json!({
            "topic": topic,
            "message": message,
            "ttl": opts.ttl,
            "tag": opts.tag,
            "prompt": opts.prompt,
        });

        let mut last_error = String::new();
        for attempt in 1..=self.max_attempts {
            match self
                .provider
                .request_with_timeout("publish", params.clone(), self.ack_timeout)
                .await
            {
                Ok(_ack) => {
                    debug!(topic = %topic, tag = opts.tag, attempt, "publish acked");
                    return Ok(());
                }
                // Crypto/store problems won't heal on retry; transport
                // closure means the caller chose to stop.
                Err(PairlinkError::TransportClosed) => {
                    return Err(PairlinkError::TransportClosed)
                }
                Err(e) => {
                    warn!(topic = %topic, attempt, "publish not acked: {}", e);
                    last_error = e.to_string();
                }
            }
        }

        Err(PairlinkError::PublishFailure(format!(
            "no ack for topic {} after {} attempts: {}",
            topic, self.max_attempts, last_error
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::provider::ProviderConfig;
    use crate::storage::MemoryStorage;
    use serde_json::json;

    fn make_publisher(max_attempts: u32) -> Publisher {
        Publisher::new(
            Provider::new(ProviderConfig::default()),
            Arc::new(Crypto::new(MemoryStorage::shared())),
            Duration::from_millis(50),
            max_attempts,
        )
    }

    #[tokio::test]
    async fn test_publish_without_connection_exhausts_retries() {
        let publisher = make_publisher(2);
        let result = publisher
            .publish(&Topic::generate(), &json!({"x": 1}), &PublishOptions::default())
            .await;
        assert!(matches!(result, Err(PairlinkError::PublishFailure(_))));
    }

    #[tokio::test]
    async fn test_publish_after_disconnect_stops_immediately() {
        let publisher = make_publisher(5);
        publisher.provider.disconnect().await;
        let result = publisher
            .publish(&Topic::generate(), &json!({"x": 1}), &PublishOptions::default())
            .await;
        assert!(matches!(result, Err(PairlinkError::TransportClosed)));
    }

    #[test]
    fn test_zero_attempts_clamped_to_one() {
        let publisher = make_publisher(0);
        assert_eq!(publisher.max_attempts, 1);
    }
}
