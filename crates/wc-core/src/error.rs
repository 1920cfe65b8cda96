//! Error types for the WalletConnect core

use crate::relayer::connection::TransportError;
use crate::storage::StorageError;
use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types
#[derive(Debug, Error)]
pub enum Error {
    /// Module used before `init`
    #[error("{0} was not initialized")]
    NotInitialized(&'static str),

    /// Keychain lookup miss
    #[error("no matching key: {0}")]
    NoMatchingKey(String),

    /// Topic lookup miss
    #[error("no matching topic in {context}: {topic}")]
    NoMatchingTopic { context: &'static str, topic: String },

    /// Id lookup miss
    #[error("no matching id in {context}: {id}")]
    NoMatchingId { context: &'static str, id: i64 },

    /// Stored record belongs to another topic
    #[error("mismatched topic for id {id}: stored {stored}, requested {requested}")]
    MismatchedTopic {
        id: i64,
        stored: String,
        requested: String,
    },

    /// Restore called while entries already exist in memory
    #[error("restore will override existing entries in {0}")]
    RestoreWillOverride(String),

    /// Request or connection deadline exceeded
    #[error("timeout: {0}")]
    Timeout(String),

    /// Envelope cannot be decrypted with available keys
    #[error("missing decrypt params: {0}")]
    MissingDecryptParams(String),

    /// Caller supplied inconsistent parameters
    #[error("invalid params: {0}")]
    InvalidParams(String),

    /// Pairing URI could not be parsed
    #[error("invalid pairing uri: {0}")]
    InvalidUri(String),

    /// Envelope bytes are malformed
    #[error("malformed envelope: {0}")]
    Envelope(String),

    /// AEAD tag did not verify
    #[error("authentication failed")]
    AuthenticationFailed,

    /// Pairing or record already expired
    #[error("expired: {0}")]
    Expired(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// JSON-RPC error returned by the relay or the peer
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// Connection went away while a request was in flight
    #[error("connection closed")]
    ConnectionClosed,
}

impl Error {
    /// Whether the failure is a lookup miss rather than a hard fault
    pub fn is_lookup_miss(&self) -> bool {
        matches!(
            self,
            Error::NoMatchingKey(_) | Error::NoMatchingTopic { .. } | Error::NoMatchingId { .. }
        )
    }
}
