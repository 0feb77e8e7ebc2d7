//! Algorithm negotiation between the start and accept steps.

use sasverify_core::config::VerificationConfig;
use sasverify_core::protocol::{
    AcceptContent, HashAlgorithm, KeyAgreementProtocol, MessageAuthenticationCode,
    ShortAuthenticationString, StartContent,
};
use sasverify_core::VerificationMethod;
use sasverify_crypto::MacEncoding;

/// Algorithms this device offers, in preference order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SasSettings {
    pub hashes: Vec<HashAlgorithm>,
    pub key_agreement_protocols: Vec<KeyAgreementProtocol>,
    pub message_authentication_codes: Vec<MessageAuthenticationCode>,
    pub short_authentication_strings: Vec<ShortAuthenticationString>,
}

impl Default for SasSettings {
    fn default() -> Self {
        Self::from_config(&VerificationConfig::default())
    }
}

impl SasSettings {
    pub fn from_config(config: &VerificationConfig) -> Self {
        Self {
            hashes: vec![HashAlgorithm::Sha256],
            key_agreement_protocols: vec![KeyAgreementProtocol::Curve25519HkdfSha256],
            message_authentication_codes: config.message_authentication_codes(),
            short_authentication_strings: config
                .short_authentication_strings
                .iter()
                .filter(|sas| !matches!(sas, ShortAuthenticationString::Unknown(_)))
                .cloned()
                .collect(),
        }
    }

    pub fn start_content(&self, from_device: &str) -> StartContent {
        StartContent {
            from_device: from_device.to_string(),
            method: VerificationMethod::Sas,
            hashes: self.hashes.clone(),
            key_agreement_protocols: self.key_agreement_protocols.clone(),
            message_authentication_codes: self.message_authentication_codes.clone(),
            short_authentication_string: self.short_authentication_strings.clone(),
        }
    }

    /// Pick one value of each list for the counterpart's start, the way the
    /// accepting side does. `None` if any list has nothing in common.
    pub fn negotiate(&self, start: &StartContent) -> Option<Negotiated> {
        if start.method != VerificationMethod::Sas {
            return None;
        }
        let hash = first_common(&self.hashes, &start.hashes)?;
        let key_agreement_protocol =
            first_common(&self.key_agreement_protocols, &start.key_agreement_protocols)?;
        let message_authentication_code = first_common(
            &self.message_authentication_codes,
            &start.message_authentication_codes,
        )?;
        let short_authentication_string: Vec<_> = self
            .short_authentication_strings
            .iter()
            .filter(|sas| start.short_authentication_string.contains(sas))
            .cloned()
            .collect();
        if short_authentication_string.is_empty() {
            return None;
        }
        Some(Negotiated {
            hash,
            key_agreement_protocol,
            message_authentication_code,
            short_authentication_string,
        })
    }

    /// Check an accept against the start we sent. Every chosen value must
    /// have been offered.
    pub fn accepted(&self, start: &StartContent, accept: &AcceptContent) -> Option<Negotiated> {
        let valid = self.hashes.contains(&accept.hash)
            && start.hashes.contains(&accept.hash)
            && self
                .key_agreement_protocols
                .contains(&accept.key_agreement_protocol)
            && start
                .key_agreement_protocols
                .contains(&accept.key_agreement_protocol)
            && self
                .message_authentication_codes
                .contains(&accept.message_authentication_code)
            && start
                .message_authentication_codes
                .contains(&accept.message_authentication_code)
            && !accept.short_authentication_string.is_empty()
            && accept
                .short_authentication_string
                .iter()
                .all(|sas| start.short_authentication_string.contains(sas));
        valid.then(|| Negotiated {
            hash: accept.hash.clone(),
            key_agreement_protocol: accept.key_agreement_protocol.clone(),
            message_authentication_code: accept.message_authentication_code.clone(),
            short_authentication_string: accept.short_authentication_string.clone(),
        })
    }
}

fn first_common<T: PartialEq + Clone>(ours: &[T], theirs: &[T]) -> Option<T> {
    ours.iter().find(|value| theirs.contains(value)).cloned()
}

/// Values both sides agreed on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    pub hash: HashAlgorithm,
    pub key_agreement_protocol: KeyAgreementProtocol,
    pub message_authentication_code: MessageAuthenticationCode,
    pub short_authentication_string: Vec<ShortAuthenticationString>,
}

impl Negotiated {
    pub fn accept_content(&self, commitment: String) -> AcceptContent {
        AcceptContent {
            commitment,
            hash: self.hash.clone(),
            key_agreement_protocol: self.key_agreement_protocol.clone(),
            message_authentication_code: self.message_authentication_code.clone(),
            short_authentication_string: self.short_authentication_string.clone(),
        }
    }

    pub fn mac_encoding(&self) -> Option<MacEncoding> {
        match &self.message_authentication_code {
            MessageAuthenticationCode::HkdfHmacSha256V2 => Some(MacEncoding::Unpadded),
            MessageAuthenticationCode::HkdfHmacSha256 => Some(MacEncoding::Legacy),
            MessageAuthenticationCode::Unknown(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn their_start(macs: Vec<MessageAuthenticationCode>) -> StartContent {
        StartContent {
            message_authentication_codes: macs,
            ..SasSettings::default().start_content("THEM")
        }
    }

    #[test]
    fn prefers_v2_mac() {
        let start = their_start(vec![
            MessageAuthenticationCode::HkdfHmacSha256,
            MessageAuthenticationCode::HkdfHmacSha256V2,
        ]);
        let negotiated = SasSettings::default().negotiate(&start).unwrap();
        assert_eq!(
            negotiated.message_authentication_code,
            MessageAuthenticationCode::HkdfHmacSha256V2
        );
        assert_eq!(negotiated.mac_encoding(), Some(MacEncoding::Unpadded));
    }

    #[test]
    fn falls_back_to_legacy_mac() {
        let start = their_start(vec![MessageAuthenticationCode::HkdfHmacSha256]);
        let negotiated = SasSettings::default().negotiate(&start).unwrap();
        assert_eq!(negotiated.mac_encoding(), Some(MacEncoding::Legacy));
    }

    #[test]
    fn legacy_refused_when_disabled() {
        let config = VerificationConfig {
            allow_legacy_mac: false,
            ..Default::default()
        };
        let start = their_start(vec![MessageAuthenticationCode::HkdfHmacSha256]);
        assert!(SasSettings::from_config(&config).negotiate(&start).is_none());
    }

    #[test]
    fn unknown_algorithms_fail() {
        let start = StartContent {
            key_agreement_protocols: vec!["curve448".into()],
            ..SasSettings::default().start_content("THEM")
        };
        assert!(SasSettings::default().negotiate(&start).is_none());
    }

    #[test]
    fn sas_methods_are_intersected() {
        let start = StartContent {
            short_authentication_string: vec![ShortAuthenticationString::Emoji, "braille".into()],
            ..SasSettings::default().start_content("THEM")
        };
        let negotiated = SasSettings::default().negotiate(&start).unwrap();
        assert_eq!(
            negotiated.short_authentication_string,
            vec![ShortAuthenticationString::Emoji]
        );
    }

    #[test]
    fn accept_must_pick_offered_values() {
        let settings = SasSettings::default();
        let start = settings.start_content("ME");
        let good = settings
            .negotiate(&start)
            .unwrap()
            .accept_content("c".into());
        assert!(settings.accepted(&start, &good).is_some());

        let bad = AcceptContent {
            message_authentication_code: "hmac-md5".into(),
            ..good.clone()
        };
        assert!(settings.accepted(&start, &bad).is_none());

        let empty_sas = AcceptContent {
            short_authentication_string: vec![],
            ..good
        };
        assert!(settings.accepted(&start, &empty_sas).is_none());
    }
}
