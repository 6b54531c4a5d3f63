//! Pairing records.
//!
//! A pairing is the long-lived encrypted channel bootstrapped from a shared
//! URI. It starts inactive with a short expiry; the first successful session
//! settlement over it activates it and stretches the expiry to thirty days.

use serde::{Deserialize, Serialize};

use crate::relay::PublishOptions;
use crate::store::Entity;
use crate::types::{expiry_from_now, ttl, Metadata, Relay, Topic};

/// Wire methods carried over a pairing topic
pub mod methods {
    pub const PAIRING_PING: &str = "wc_pairingPing";
    pub const PAIRING_EXTEND: &str = "wc_pairingExtend";
    pub const PAIRING_DELETE: &str = "wc_pairingDelete";
}

/// Relay publish parameters for a pairing-level request
pub fn request_options(method: &str) -> PublishOptions {
    match method {
        methods::PAIRING_DELETE => PublishOptions {
            ttl: ttl::ONE_DAY,
            tag: 1000,
            prompt: false,
        },
        methods::PAIRING_EXTEND => PublishOptions {
            ttl: ttl::ONE_DAY,
            tag: 1004,
            prompt: false,
        },
        _ => PublishOptions {
            ttl: ttl::FIVE_MINUTES,
            tag: 1002,
            prompt: false,
        },
    }
}

/// Relay publish parameters for the response to a pairing-level request
pub fn response_options(method: &str) -> PublishOptions {
    match method {
        methods::PAIRING_DELETE => PublishOptions {
            ttl: ttl::ONE_DAY,
            tag: 1001,
            prompt: false,
        },
        methods::PAIRING_EXTEND => PublishOptions {
            ttl: ttl::ONE_DAY,
            tag: 1005,
            prompt: false,
        },
        _ => PublishOptions {
            ttl: ttl::FIVE_MINUTES,
            tag: 1003,
            prompt: false,
        },
    }
}

/// A persisted pairing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pairing {
    pub topic: Topic,
    pub relay: Relay,
    /// Seconds since epoch
    pub expiry: i64,
    /// False until a session settles over this pairing
    pub active: bool,
    /// Learned from the first proposal the peer sends
    pub peer_metadata: Option<Metadata>,
}

impl Pairing {
    /// A fresh inactive pairing with the short bootstrap expiry
    pub fn new(topic: Topic, relay: Relay) -> Self {
        Self {
            topic,
            relay,
            expiry: expiry_from_now(ttl::FIVE_MINUTES),
            active: false,
            peer_metadata: None,
        }
    }

    /// Mark active and stretch the expiry to the long-lived window
    pub fn activate(&mut self) {
        self.active = true;
        self.expiry = Self::max_extension();
    }

    /// The furthest expiry a pairing may reach from now
    pub fn max_extension() -> i64 {
        expiry_from_now(ttl::THIRTY_DAYS)
    }
}

impl Entity for Pairing {
    fn key(&self) -> String {
        self.topic.0.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::now_secs;

    #[test]
    fn test_new_pairing_is_inactive_with_short_expiry() {
        let pairing = Pairing::new(Topic::generate(), Relay::default());
        assert!(!pairing.active);
        assert!(pairing.expiry <= now_secs() + ttl::FIVE_MINUTES);
        assert!(pairing.expiry > now_secs());
    }

    #[test]
    fn test_activation_stretches_expiry() {
        let mut pairing = Pairing::new(Topic::generate(), Relay::default());
        let short = pairing.expiry;

        pairing.activate();

        assert!(pairing.active);
        assert!(pairing.expiry > short);
        assert!(pairing.expiry > now_secs() + ttl::SEVEN_DAYS);
    }

    #[test]
    fn test_extend_options_use_the_paired_tag() {
        let req = request_options(methods::PAIRING_EXTEND);
        let res = response_options(methods::PAIRING_EXTEND);
        assert_eq!(res.tag, req.tag + 1);
        assert_eq!(req.ttl, ttl::ONE_DAY);
    }

    #[test]
    fn test_entity_key_is_topic() {
        let pairing = Pairing::new(Topic::generate(), Relay::default());
        assert_eq!(pairing.key(), pairing.topic.0);
    }

    #[test]
    fn test_serde_roundtrip_uses_camel_case() {
        let pairing = Pairing::new(Topic::generate(), Relay::default());
        let json = serde_json::to_value(&pairing).unwrap();
        assert!(json.get("peerMetadata").is_some());

        let back: Pairing = serde_json::from_value(json).unwrap();
        assert_eq!(back.topic, pairing.topic);
        assert_eq!(back.expiry, pairing.expiry);
    }
}
