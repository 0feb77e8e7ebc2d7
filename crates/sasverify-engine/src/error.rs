//! Error types for the verification engine.

use thiserror::Error;

/// Errors returned by local actions on a verification.
#[derive(Debug, Error)]
pub enum VerificationError {
    /// The action is not offered by the current state.
    #[error("cannot {action} in state {state}")]
    InvalidState {
        action: &'static str,
        state: &'static str,
    },

    /// The verification this handle belonged to no longer exists.
    #[error("verification is gone")]
    Gone,

    /// A request needs at least one device to go to.
    #[error("no devices to send the request to")]
    NoRecipients,

    /// The conversation message is not a verification request.
    #[error("event {event_id} in {room_id} is not a verification request")]
    NotARequest { room_id: String, event_id: String },

    #[error("unsupported verification method: {0}")]
    UnsupportedMethod(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("trust store error: {0}")]
    TrustStore(#[from] TrustStoreError),

    #[error("crypto error: {0}")]
    Crypto(#[from] sasverify_crypto::CryptoError),

    #[error(transparent)]
    Core(#[from] sasverify_core::Error),
}

/// Errors raised by a message delivery layer.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("failed to deliver message: {0}")]
    Delivery(String),

    #[error("transport closed")]
    Closed,

    #[error("unknown conversation: {0}")]
    UnknownConversation(String),

    #[error("unknown event {event_id} in {room_id}")]
    UnknownEvent { room_id: String, event_id: String },
}

/// Errors raised by a key / trust store.
#[derive(Debug, Error)]
pub enum TrustStoreError {
    #[error("unknown key {key_id} of {user_id}")]
    UnknownKey { user_id: String, key_id: String },

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, VerificationError>;
