//! MAC step construction and checking.

use std::collections::BTreeMap;

use sasverify_core::protocol::MacContent;
use sasverify_crypto::{CryptoError, MacEncoding, SasSecret};

use crate::request::DeviceIdentity;
use crate::trust::VerifiableKey;

/// Info prefix for every MAC going from `sender` to `receiver`.
pub fn base_info(sender: &DeviceIdentity, receiver: &DeviceIdentity, transaction_id: &str) -> String {
    format!(
        "MATRIX_KEY_VERIFICATION_MAC{}{}{}{}{}",
        sender.user_id, sender.device_id, receiver.user_id, receiver.device_id, transaction_id
    )
}

/// MAC our own keys for the counterpart.
pub fn create(
    secret: &SasSecret,
    encoding: MacEncoding,
    base_info: &str,
    own_keys: &[VerifiableKey],
) -> Result<MacContent, CryptoError> {
    let mut mac = BTreeMap::new();
    for key in own_keys {
        let info = format!("{base_info}{}", key.key_id);
        mac.insert(
            key.key_id.clone(),
            secret.calculate_mac(&key.value, &info, encoding)?,
        );
    }
    let key_ids = key_id_list(&mac);
    let keys = secret.calculate_mac(&key_ids, &format!("{base_info}KEY_IDS"), encoding)?;
    Ok(MacContent { keys, mac })
}

/// Why a received MAC step was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MacFailure {
    KeyIdList,
    Key(String),
    NothingVerified,
    Crypto(String),
}

impl std::fmt::Display for MacFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::KeyIdList => f.write_str("MAC over key ids does not match"),
            Self::Key(key_id) => write!(f, "MAC of key {key_id} does not match"),
            Self::NothingVerified => f.write_str("no known key was verified"),
            Self::Crypto(e) => write!(f, "MAC check failed: {e}"),
        }
    }
}

/// Check the counterpart's MAC step against the keys we know of their
/// device. Returns the keys that were verified.
///
/// Key ids we don't know are skipped, but at least one key must verify.
pub fn verify(
    secret: &SasSecret,
    encoding: MacEncoding,
    base_info: &str,
    content: &MacContent,
    their_keys: &[VerifiableKey],
) -> Result<Vec<VerifiableKey>, MacFailure> {
    let crypto = |e: CryptoError| MacFailure::Crypto(e.to_string());

    let key_ids = key_id_list(&content.mac);
    if !secret
        .verify_mac(&key_ids, &format!("{base_info}KEY_IDS"), encoding, &content.keys)
        .map_err(crypto)?
    {
        return Err(MacFailure::KeyIdList);
    }

    let mut verified = Vec::new();
    for (key_id, mac) in &content.mac {
        let Some(key) = their_keys.iter().find(|k| &k.key_id == key_id) else {
            tracing::debug!(key_id, "Skipping MAC of unknown key");
            continue;
        };
        let info = format!("{base_info}{key_id}");
        if !secret
            .verify_mac(&key.value, &info, encoding, mac)
            .map_err(crypto)?
        {
            return Err(MacFailure::Key(key_id.clone()));
        }
        verified.push(key.clone());
    }

    if verified.is_empty() {
        return Err(MacFailure::NothingVerified);
    }
    Ok(verified)
}

/// Key ids in sorted order, comma separated.
fn key_id_list(mac: &BTreeMap<String, String>) -> String {
    mac.keys().map(String::as_str).collect::<Vec<_>>().join(",")
}
