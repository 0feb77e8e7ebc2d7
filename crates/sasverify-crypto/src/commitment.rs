//! Commitment binding the accepter's ephemeral key to the start step.
//!
//! The accepter publishes the commitment before any public key is exchanged;
//! the starter checks it once the accepter's `key` step arrives.

use sha2::{Digest, Sha256};

use crate::encoding;

/// `unpadded_base64(sha256(public_key || canonical_start))`.
pub fn commitment(public_key_base64: &str, canonical_start: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(public_key_base64.as_bytes());
    hasher.update(canonical_start.as_bytes());
    encoding::encode(hasher.finalize())
}

/// Recompute and compare in constant time.
pub fn verify_commitment(public_key_base64: &str, canonical_start: &str, expected: &str) -> bool {
    encoding::constant_time_str_eq(&commitment(public_key_base64, canonical_start), expected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ephemeral::EphemeralKeyPair;

    #[test]
    fn matches_for_same_input() {
        let key = EphemeralKeyPair::generate().public_key_base64();
        let c = commitment(&key, r#"{"method":"m.sas.v1"}"#);
        assert!(verify_commitment(&key, r#"{"method":"m.sas.v1"}"#, &c));
    }

    #[test]
    fn detects_swapped_key() {
        let key = EphemeralKeyPair::generate().public_key_base64();
        let other = EphemeralKeyPair::generate().public_key_base64();
        let c = commitment(&key, "{}");
        assert!(!verify_commitment(&other, "{}", &c));
    }

    #[test]
    fn detects_changed_start() {
        let key = EphemeralKeyPair::generate().public_key_base64();
        let c = commitment(&key, r#"{"a":1}"#);
        assert!(!verify_commitment(&key, r#"{"a":2}"#, &c));
    }

    #[test]
    fn known_value() {
        // sha256("") in unpadded base64
        assert_eq!(commitment("", ""), "47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU");
    }
}
