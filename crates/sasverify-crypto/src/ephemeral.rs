//! Ephemeral key pairs for one SAS run.
//!
//! Each verification generates a fresh X25519 key pair, publishes the public
//! half in its `key` step and performs ECDH with the counterpart's public key.
//! The secret half is wiped when the pair is dropped.

use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::encoding;
use crate::error::CryptoError;
use crate::secret::SasSecret;

/// X25519 key pair used for exactly one verification.
pub struct EphemeralKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl std::fmt::Debug for EphemeralKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralKeyPair")
            .field("public", &self.public_key_base64())
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

impl EphemeralKeyPair {
    /// Generate a new random key pair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Reconstruct from raw 32-byte secret key bytes.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != 32 {
            return Err(CryptoError::InvalidKeyLength {
                expected: 32,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(bytes);
        let secret = StaticSecret::from(arr);
        let public = PublicKey::from(&secret);
        arr.zeroize();
        Ok(Self { secret, public })
    }

    /// Public key as sent in the `key` step.
    pub fn public_key_base64(&self) -> String {
        encoding::encode(self.public.as_bytes())
    }

    /// Perform ECDH with the counterpart's unpadded base64 public key.
    pub fn diffie_hellman(&self, their_public_base64: &str) -> Result<SasSecret, CryptoError> {
        let bytes = encoding::decode(their_public_base64)?;
        if bytes.len() != 32 {
            return Err(CryptoError::InvalidKeyLength {
                expected: 32,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        let their_public = PublicKey::from(arr);

        let shared = self.secret.diffie_hellman(&their_public);
        if !shared.was_contributory() {
            return Err(CryptoError::NonContributory);
        }
        Ok(SasSecret::from_bytes(*shared.as_bytes()))
    }
}

/// Source of ephemeral key pairs, the crypto driver handed to the engine.
pub trait EphemeralKeySource: Send + Sync {
    fn generate(&self) -> Result<EphemeralKeyPair, CryptoError>;
}

/// Key source backed by the operating system RNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsRngKeySource;

impl EphemeralKeySource for OsRngKeySource {
    fn generate(&self) -> Result<EphemeralKeyPair, CryptoError> {
        Ok(EphemeralKeyPair::generate())
    }
}

/// Key source handing out pre-defined secrets in order.
#[cfg(any(test, feature = "test-utils"))]
pub struct FixedKeySource {
    secrets: std::sync::Mutex<std::collections::VecDeque<[u8; 32]>>,
}

#[cfg(any(test, feature = "test-utils"))]
impl FixedKeySource {
    pub fn new(secrets: impl IntoIterator<Item = [u8; 32]>) -> Self {
        Self {
            secrets: std::sync::Mutex::new(secrets.into_iter().collect()),
        }
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl EphemeralKeySource for FixedKeySource {
    fn generate(&self) -> Result<EphemeralKeyPair, CryptoError> {
        let next = self
            .secrets
            .lock()
            .map_err(|_| CryptoError::KeySourceExhausted)?
            .pop_front()
            .ok_or(CryptoError::KeySourceExhausted)?;
        EphemeralKeyPair::from_secret_bytes(&next)
    }
}
