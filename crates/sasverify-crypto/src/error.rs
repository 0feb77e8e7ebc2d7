//! Crypto error types.

/// Errors from SAS cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Invalid base64: {0}")]
    InvalidEncoding(#[from] base64::DecodeError),

    #[error("Key agreement produced a non-contributory shared secret")]
    NonContributory,

    #[error("Key derivation failed: {0}")]
    KeyDerivationFailed(String),

    #[error("No ephemeral key left in fixed key source")]
    KeySourceExhausted,
}
