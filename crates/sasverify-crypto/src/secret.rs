//! Shared secret of a SAS run and everything derived from it.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::encoding;
use crate::error::CryptoError;
use crate::short_code::{SAS_BYTES, ShortCode};

/// How a MAC is rendered as text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacEncoding {
    /// Standard unpadded base64 (`hkdf-hmac-sha256.v2`).
    Unpadded,
    /// Historical in-place encoding (`hkdf-hmac-sha256`).
    Legacy,
}

/// X25519 shared secret. Wiped on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SasSecret {
    bytes: [u8; 32],
}

impl std::fmt::Debug for SasSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SasSecret([REDACTED])")
    }
}

impl SasSecret {
    pub(crate) const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self { bytes }
    }

    /// Derive the short authentication string bytes for `info`.
    pub fn short_code(&self, info: &str) -> Result<ShortCode, CryptoError> {
        let hk = Hkdf::<Sha256>::new(None, &self.bytes);
        let mut out = [0u8; SAS_BYTES];
        hk.expand(info.as_bytes(), &mut out)
            .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;
        Ok(ShortCode::from_bytes(out))
    }

    /// MAC `input` with a key derived from the secret and `info`.
    pub fn calculate_mac(
        &self,
        input: &str,
        info: &str,
        encoding: MacEncoding,
    ) -> Result<String, CryptoError> {
        let mut key = [0u8; 32];
        Hkdf::<Sha256>::new(None, &self.bytes)
            .expand(info.as_bytes(), &mut key)
            .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;

        let mac = <Hmac<Sha256> as Mac>::new_from_slice(&key)
            .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()));
        key.zeroize();
        let mut mac = mac?;
        mac.update(input.as_bytes());
        let tag = mac.finalize().into_bytes();

        Ok(match encoding {
            MacEncoding::Unpadded => encoding::encode(tag),
            MacEncoding::Legacy => encoding::encode_in_place_legacy(&tag),
        })
    }

    /// Check a MAC received from the counterpart.
    pub fn verify_mac(
        &self,
        input: &str,
        info: &str,
        encoding: MacEncoding,
        expected: &str,
    ) -> Result<bool, CryptoError> {
        let actual = self.calculate_mac(input, info, encoding)?;
        Ok(encoding::constant_time_str_eq(&actual, expected))
    }
}
