//! Error types for the pairlink core

use thiserror::Error;

/// Main error type for pairlink core operations
#[derive(Error, Debug)]
pub enum PairlinkError {
    /// Keychain lookup miss (unknown key pair tag or topic)
    #[error("No matching key: {0}")]
    NoMatchingKey(String),

    /// Store lookup miss
    #[error("Not found: {0}")]
    NotFound(String),

    /// Proposal id is unknown or already consumed by a settlement
    #[error("Proposal not found: {0}")]
    ProposalNotFound(u64),

    /// Session negotiation incompatibility
    #[error("Namespaces mismatch: {0}")]
    NamespacesMismatch(String),

    /// Relay never acknowledged a publish after exhausting retries
    #[error("Publish failed: {0}")]
    PublishFailure(String),

    /// No pong received within the deadline
    #[error("Ping timed out on topic {0}")]
    PingTimeout(String),

    /// No response received within the deadline
    #[error("Request {0} timed out")]
    RequestTimeout(u64),

    /// Operation attempted or pending during/after explicit disconnect
    #[error("Transport closed")]
    TransportClosed,

    /// Inbound request for a method outside the negotiated set
    #[error("Unauthorized method: {0}")]
    UnauthorizedMethod(String),

    /// Malformed pairing URI
    #[error("Invalid pairing URI: {0}")]
    InvalidUri(String),

    /// Cryptographic operation failed
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Decryption failed (wrong key, tampered data, or malformed input)
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Error during storage operations
    #[error("Storage error: {0}")]
    Storage(String),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Network-related error (connection drop, send failure)
    #[error("Network error: {0}")]
    Network(String),

    /// The peer answered with a JSON-RPC error
    #[error("Peer error {code}: {message}")]
    PeerError {
        /// JSON-RPC error code
        code: i64,
        /// JSON-RPC error message
        message: String,
    },

    /// Invalid operation for the current state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

/// Result type alias using PairlinkError
pub type PairlinkResult<T> = Result<T, PairlinkError>;
