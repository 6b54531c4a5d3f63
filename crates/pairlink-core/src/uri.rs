//! Pairing URI parsing and formatting.
//!
//! Format: `wc:<topic>@<version>?relay-protocol=<name>&relay-data=<opaque>&symKey=<hex>`
//!
//! The URI is the out-of-band bootstrap artifact: it carries the pairing
//! topic and symmetric key from one device to the other (QR code, link,
//! copy-paste). `relay-data` is optional; everything else is mandatory.

use crate::crypto::KEY_SIZE;
use crate::error::{PairlinkError, PairlinkResult};
use crate::types::{Relay, Topic};

/// URI scheme prefix
const URI_SCHEME: &str = "wc";

/// Protocol version carried in URIs produced by this crate
pub const URI_VERSION: u32 = 2;

/// Parsed pairing URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingUri {
    /// Pairing topic
    pub topic: Topic,
    /// Protocol version
    pub version: u32,
    /// Relay protocol options
    pub relay: Relay,
    /// Pairing symmetric key
    pub sym_key: [u8; KEY_SIZE],
}

impl PairingUri {
    /// Build a URI value for a freshly created pairing
    pub fn new(topic: Topic, relay: Relay, sym_key: [u8; KEY_SIZE]) -> Self {
        Self {
            topic,
            version: URI_VERSION,
            relay,
            sym_key,
        }
    }

    /// Parse a `wc:` URI string.
    ///
    /// Rejects a URI missing the scheme, topic, version, `relay-protocol`,
    /// or `symKey`; tolerates absent `relay-data` and unknown query keys.
    pub fn parse(uri: &str) -> PairlinkResult<Self> {
        let rest = uri
            .strip_prefix(&format!("{}:", URI_SCHEME))
            .ok_or_else(|| PairlinkError::InvalidUri("missing wc: scheme".to_string()))?;

        let (head, query) = rest
            .split_once('?')
            .ok_or_else(|| PairlinkError::InvalidUri("missing query string".to_string()))?;

        let (topic, version) = head
            .split_once('@')
            .ok_or_else(|| PairlinkError::InvalidUri("missing protocol version".to_string()))?;

        if topic.is_empty() {
            return Err(PairlinkError::InvalidUri("missing topic".to_string()));
        }

        let version: u32 = version
            .parse()
            .map_err(|_| PairlinkError::InvalidUri(format!("invalid version: {}", version)))?;

        let mut relay_protocol = None;
        let mut relay_data = None;
        let mut sym_key_hex = None;

        for pair in query.split('&') {
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            match key {
                "relay-protocol" => relay_protocol = Some(value.to_string()),
                "relay-data" => relay_data = Some(value.to_string()),
                "symKey" => sym_key_hex = Some(value.to_string()),
                _ => {}
            }
        }

        let relay_protocol = relay_protocol
            .filter(|p| !p.is_empty())
            .ok_or_else(|| PairlinkError::InvalidUri("missing relay-protocol".to_string()))?;

        let sym_key_hex = sym_key_hex
            .filter(|k| !k.is_empty())
            .ok_or_else(|| PairlinkError::InvalidUri("missing symKey".to_string()))?;

        let raw = hex::decode(&sym_key_hex)
            .map_err(|e| PairlinkError::InvalidUri(format!("symKey is not valid hex: {}", e)))?;
        let sym_key: [u8; KEY_SIZE] = raw.as_slice().try_into().map_err(|_| {
            PairlinkError::InvalidUri(format!("symKey must be {} bytes, got {}", KEY_SIZE, raw.len()))
        })?;

        Ok(Self {
            topic: Topic::from(topic),
            version,
            relay: Relay {
                protocol: relay_protocol,
                data: relay_data,
            },
            sym_key,
        })
    }
}

impl std::fmt::Display for PairingUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}@{}?relay-protocol={}",
            URI_SCHEME, self.topic, self.version, self.relay.protocol
        )?;
        if let Some(ref data) = self.relay.data {
            write!(f, "&relay-data={}", data)?;
        }
        write!(f, "&symKey={}", hex::encode(self.sym_key))
    }
}
