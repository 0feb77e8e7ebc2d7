//! Canonical JSON: object keys sorted, no insignificant whitespace.
//!
//! `serde_json::Value` keeps objects in a `BTreeMap` (the `preserve_order`
//! feature is never enabled in this workspace), so a round trip through
//! `Value` yields the canonical form.

use serde::Serialize;

use super::steps::{StartContent, TransactionRef};
use crate::error::Result;

pub fn canonical_json<T: Serialize>(value: &T) -> Result<String> {
    let value = serde_json::to_value(value)?;
    Ok(serde_json::to_string(&value)?)
}

/// Canonical form of a start step including its transaction reference, the
/// input both sides hash into the SAS commitment.
pub fn canonical_start_json(start: &StartContent, transaction: &TransactionRef) -> Result<String> {
    let mut value = serde_json::to_value(start)?;
    transaction.attach(&mut value);
    Ok(serde_json::to_string(&value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{
        HashAlgorithm, KeyAgreementProtocol, MessageAuthenticationCode,
        ShortAuthenticationString, VerificationMethod,
    };

    #[test]
    fn keys_are_sorted() {
        let value = serde_json::json!({ "b": 1, "a": { "d": 2, "c": 3 } });
        assert_eq!(canonical_json(&value).unwrap(), r#"{"a":{"c":3,"d":2},"b":1}"#);
    }

    #[test]
    fn start_includes_transaction() {
        let start = StartContent {
            from_device: "BOB".into(),
            method: VerificationMethod::Sas,
            hashes: vec![HashAlgorithm::Sha256],
            key_agreement_protocols: vec![KeyAgreementProtocol::Curve25519HkdfSha256],
            message_authentication_codes: vec![MessageAuthenticationCode::HkdfHmacSha256V2],
            short_authentication_string: vec![ShortAuthenticationString::Decimal],
        };
        let json = canonical_start_json(&start, &TransactionRef::Direct("t1".into())).unwrap();
        assert_eq!(
            json,
            concat!(
                r#"{"from_device":"BOB","hashes":["sha256"],"#,
                r#""key_agreement_protocols":["curve25519-hkdf-sha256"],"#,
                r#""message_authentication_codes":["hkdf-hmac-sha256.v2"],"#,
                r#""method":"m.sas.v1","short_authentication_string":["decimal"],"#,
                r#""transaction_id":"t1"}"#
            )
        );
    }
}
