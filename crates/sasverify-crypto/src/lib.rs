//! SAS primitives for interactive key verification.
//!
//! ## Crypto primitives
//!
//! - **Ephemeral key pair**: X25519, one per verification, never persisted
//! - **Shared secret**: X25519 ECDH, rejected if non-contributory
//! - **SAS bytes**: HKDF-SHA256 over the shared secret, 6 bytes mapped to
//!   decimals and emoji
//! - **MAC**: HMAC-SHA256 keyed by HKDF-SHA256, unpadded or legacy base64
//! - **Commitment**: SHA-256 over the accepter's public key and the start step
//!
//! Secret material lives in zeroizing types and is wiped on drop.

pub mod commitment;
pub mod encoding;
pub mod ephemeral;
pub mod error;
pub mod secret;
pub mod short_code;

pub use commitment::{commitment, verify_commitment};
pub use encoding::constant_time_str_eq;
#[cfg(any(test, feature = "test-utils"))]
pub use ephemeral::FixedKeySource;
pub use ephemeral::{EphemeralKeyPair, EphemeralKeySource, OsRngKeySource};
pub use error::CryptoError;
pub use secret::{MacEncoding, SasSecret};
pub use short_code::{EMOJI_TABLE, SasEmoji, ShortCode, format_decimals, format_emojis};
