//! Crypto engine: key agreement, per-topic AEAD, topic derivation.
//!
//! Key material lives only in the [`Keychain`], a persisted map from tag to
//! raw key bytes. Two kinds of entries exist:
//!
//! - key pairs: tag = hex X25519 public key, value = 32-byte secret
//! - symmetric keys: tag = topic (hex SHA-256 of the key), value = 32-byte key
//!
//! # Wire format
//!
//! Encrypted payloads for a topic with a registered key are
//! `base64(nonce[12] || ciphertext + tag)` using ChaCha20-Poly1305 with a
//! random nonce per encode. Topics without a registered key fall back to a
//! reversible, non-confidential `hex(utf8 json)` encoding so a handshake's
//! first envelope can cross the relay before keys are agreed.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use parking_lot::RwLock;
use rand::RngCore;
use sha2::Sha256;
use tracing::warn;

use crate::error::{PairlinkError, PairlinkResult};
use crate::storage::{storage_key, DynStorage};
use crate::types::Topic;

/// Nonce size for ChaCha20-Poly1305 (12 bytes)
pub const NONCE_SIZE: usize = 12;

/// Symmetric key size (32 bytes)
pub const KEY_SIZE: usize = 32;

/// Persisted tag → key-material map.
///
/// Write-through: every mutation is persisted before returning. Restore on
/// construction tolerates a missing or malformed record by starting empty.
pub struct Keychain {
    keys: RwLock<HashMap<String, Vec<u8>>>,
    storage: DynStorage,
    storage_key: String,
}

impl Keychain {
    /// Create a keychain backed by the given storage, restoring any
    /// previously persisted entries.
    pub fn new(storage: DynStorage) -> Self {
        let storage_key = storage_key("core", "keychain");
        let keys = match storage.get_item(&storage_key) {
            Ok(Some(bytes)) => match serde_json::from_slice::<HashMap<String, String>>(&bytes) {
                Ok(hex_map) => hex_map
                    .into_iter()
                    .filter_map(|(tag, hex_key)| match hex::decode(&hex_key) {
                        Ok(raw) => Some((tag, raw)),
                        Err(_) => {
                            warn!(tag, "dropping keychain entry with malformed key material");
                            None
                        }
                    })
                    .collect(),
                Err(e) => {
                    warn!("keychain record malformed, starting empty: {}", e);
                    HashMap::new()
                }
            },
            Ok(None) => HashMap::new(),
            Err(e) => {
                warn!("keychain restore failed, starting empty: {}", e);
                HashMap::new()
            }
        };

        Self {
            keys: RwLock::new(keys),
            storage,
            storage_key,
        }
    }

    /// Insert or replace the key material for a tag
    pub fn set(&self, tag: &str, key: &[u8]) -> PairlinkResult<()> {
        self.keys.write().insert(tag.to_string(), key.to_vec());
        self.persist()
    }

    /// Get the key material for a tag
    pub fn get(&self, tag: &str) -> PairlinkResult<Vec<u8>> {
        self.keys
            .read()
            .get(tag)
            .cloned()
            .ok_or_else(|| PairlinkError::NoMatchingKey(tag.to_string()))
    }

    /// Whether a tag has registered key material
    pub fn has(&self, tag: &str) -> bool {
        self.keys.read().contains_key(tag)
    }

    /// Remove the key material for a tag (no-op if absent)
    pub fn del(&self, tag: &str) -> PairlinkResult<()> {
        self.keys.write().remove(tag);
        self.persist()
    }

    fn persist(&self) -> PairlinkResult<()> {
        let hex_map: HashMap<String, String> = self
            .keys
            .read()
            .iter()
            .map(|(tag, raw)| (tag.clone(), hex::encode(raw)))
            .collect();
        let bytes = serde_json::to_vec(&hex_map)
            .map_err(|e| PairlinkError::Serialization(e.to_string()))?;
        self.storage.set_item(&self.storage_key, &bytes)
    }
}

/// Crypto engine owning the keychain and all encode/decode paths
pub struct Crypto {
    keychain: Keychain,
}

impl Crypto {
    /// Create a crypto engine backed by the given storage
    pub fn new(storage: DynStorage) -> Self {
        Self {
            keychain: Keychain::new(storage),
        }
    }

    /// Generate an X25519 key pair, store the secret in the keychain, and
    /// return the hex-encoded public key.
    pub fn generate_key_pair(&self) -> PairlinkResult<String> {
        let mut secret_bytes = [0u8; KEY_SIZE];
        rand::rng().fill_bytes(&mut secret_bytes);

        let secret = x25519_dalek::StaticSecret::from(secret_bytes);
        let public = x25519_dalek::PublicKey::from(&secret);
        let public_hex = hex::encode(public.as_bytes());

        self.keychain.set(&public_hex, &secret_bytes)?;
        Ok(public_hex)
    }

    /// Derive and store a symmetric key from our key pair and the peer's
    /// public key; returns the resulting topic.
    ///
    /// X25519 Diffie-Hellman followed by HKDF-SHA256 (no salt, no info,
    /// 32-byte output). Both sides derive the same key and therefore the
    /// same topic.
    pub fn generate_shared_key(
        &self,
        self_public_key: &str,
        peer_public_key: &str,
        override_topic: Option<Topic>,
    ) -> PairlinkResult<Topic> {
        let secret_bytes = self.keychain.get(self_public_key)?;
        let secret_arr: [u8; KEY_SIZE] = secret_bytes
            .as_slice()
            .try_into()
            .map_err(|_| PairlinkError::Crypto("stored secret has wrong length".to_string()))?;

        let peer_bytes = hex::decode(peer_public_key)
            .map_err(|e| PairlinkError::Crypto(format!("invalid peer public key hex: {}", e)))?;
        let peer_arr: [u8; KEY_SIZE] = peer_bytes
            .as_slice()
            .try_into()
            .map_err(|_| PairlinkError::Crypto("peer public key has wrong length".to_string()))?;

        let secret = x25519_dalek::StaticSecret::from(secret_arr);
        let peer_public = x25519_dalek::PublicKey::from(peer_arr);
        let shared = secret.diffie_hellman(&peer_public);

        let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
        let mut sym_key = [0u8; KEY_SIZE];
        hk.expand(&[], &mut sym_key)
            .map_err(|e| PairlinkError::Crypto(format!("HKDF expand failed: {}", e)))?;

        self.set_sym_key(sym_key, override_topic)
    }

    /// Store a symmetric key directly (pairing URI case); returns its topic.
    ///
    /// The topic defaults to the hex SHA-256 of the key bytes unless an
    /// override is supplied (used when settling onto a pre-agreed topic).
    pub fn set_sym_key(
        &self,
        sym_key: [u8; KEY_SIZE],
        override_topic: Option<Topic>,
    ) -> PairlinkResult<Topic> {
        let topic = override_topic.unwrap_or_else(|| Topic::from_key(&sym_key));
        self.keychain.set(topic.as_str(), &sym_key)?;
        Ok(topic)
    }

    /// Whether a topic has a registered symmetric key
    pub fn has_keys(&self, topic: &Topic) -> bool {
        self.keychain.has(topic.as_str())
    }

    /// Encode a payload for a topic into its wire string.
    ///
    /// Topics with a registered key get a sealed AEAD envelope; keyless
    /// topics get the reversible hex fallback (handshake bootstrap).
    pub fn encode(&self, topic: &Topic, payload: &serde_json::Value) -> PairlinkResult<String> {
        let plaintext = serde_json::to_vec(payload)
            .map_err(|e| PairlinkError::Serialization(e.to_string()))?;

        if !self.keychain.has(topic.as_str()) {
            return Ok(hex::encode(&plaintext));
        }

        let sym_key = self.keychain.get(topic.as_str())?;
        let cipher = ChaCha20Poly1305::new_from_slice(&sym_key)
            .map_err(|e| PairlinkError::Crypto(format!("bad symmetric key: {}", e)))?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_slice())
            .map_err(|e| PairlinkError::Crypto(format!("Encryption failed: {}", e)))?;

        let mut sealed = nonce_bytes.to_vec();
        sealed.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(sealed))
    }

    /// Decode a wire string for a topic back into its payload.
    ///
    /// Inverse of [`encode`](Self::encode): AEAD open when the topic has a
    /// key, hex fallback otherwise.
    pub fn decode(&self, topic: &Topic, wire: &str) -> PairlinkResult<serde_json::Value> {
        let plaintext = if self.keychain.has(topic.as_str()) {
            let sym_key = self.keychain.get(topic.as_str())?;
            let cipher = ChaCha20Poly1305::new_from_slice(&sym_key)
                .map_err(|e| PairlinkError::Crypto(format!("bad symmetric key: {}", e)))?;

            let sealed = BASE64
                .decode(wire)
                .map_err(|e| PairlinkError::DecryptionFailed(format!("invalid base64: {}", e)))?;
            if sealed.len() < NONCE_SIZE {
                return Err(PairlinkError::DecryptionFailed(
                    "envelope too short to contain nonce".to_string(),
                ));
            }

            let nonce = Nonce::from_slice(&sealed[..NONCE_SIZE]);
            cipher
                .decrypt(nonce, &sealed[NONCE_SIZE..])
                .map_err(|e| PairlinkError::DecryptionFailed(format!("{}", e)))?
        } else {
            hex::decode(wire)
                .map_err(|e| PairlinkError::DecryptionFailed(format!("invalid hex: {}", e)))?
        };

        serde_json::from_slice(&plaintext).map_err(|e| PairlinkError::Serialization(e.to_string()))
    }

    /// Delete a key pair by its public key tag
    pub fn delete_key_pair(&self, public_key: &str) -> PairlinkResult<()> {
        self.keychain.del(public_key)
    }

    /// Delete a topic's symmetric key
    pub fn delete_sym_key(&self, topic: &Topic) -> PairlinkResult<()> {
        self.keychain.del(topic.as_str())
    }

    /// Generate a fresh random symmetric key (pairing creation)
    pub fn generate_sym_key() -> [u8; KEY_SIZE] {
        let mut key = [0u8; KEY_SIZE];
        rand::rng().fill_bytes(&mut key);
        key
    }
}
