//! Identifiers negotiated during a verification.
//!
//! Every identifier keeps values it does not recognise as `Unknown(..)` so a
//! peer offering something newer still deserializes and can be refused with a
//! proper cancel code.

use serde::{Deserialize, Serialize};

macro_rules! string_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident => $value:literal, )+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(from = "String", into = "String")]
        pub enum $name {
            $( $(#[$vmeta])* $variant, )+
            /// A value this implementation does not know.
            Unknown(String),
        }

        impl $name {
            pub fn as_str(&self) -> &str {
                match self {
                    $( Self::$variant => $value, )+
                    Self::Unknown(value) => value.as_str(),
                }
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                match value.as_str() {
                    $( $value => Self::$variant, )+
                    _ => Self::Unknown(value),
                }
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::from(value.to_owned())
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                match value {
                    $name::Unknown(value) => value,
                    known => known.as_str().to_owned(),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

string_enum! {
    /// Interactive verification methods.
    pub enum VerificationMethod {
        Sas => "m.sas.v1",
    }
}

string_enum! {
    /// Hash used for the SAS commitment.
    pub enum HashAlgorithm {
        Sha256 => "sha256",
    }
}

string_enum! {
    /// Key agreement used to derive the SAS shared secret.
    pub enum KeyAgreementProtocol {
        Curve25519HkdfSha256 => "curve25519-hkdf-sha256",
    }
}

string_enum! {
    /// MAC used to authenticate the exchanged identity keys.
    pub enum MessageAuthenticationCode {
        /// Standard unpadded base64 output.
        HkdfHmacSha256V2 => "hkdf-hmac-sha256.v2",
        /// Legacy output with the historical base64 encoding.
        HkdfHmacSha256 => "hkdf-hmac-sha256",
    }
}

string_enum! {
    /// Human comparable encodings of the SAS bytes.
    pub enum ShortAuthenticationString {
        Decimal => "decimal",
        Emoji => "emoji",
    }
}

string_enum! {
    /// Reason codes carried by a cancel step.
    pub enum CancelCode {
        User => "m.user",
        Timeout => "m.timeout",
        UnknownTransaction => "m.unknown_transaction",
        UnknownMethod => "m.unknown_method",
        UnexpectedMessage => "m.unexpected_message",
        KeyMismatch => "m.key_mismatch",
        UserMismatch => "m.user_mismatch",
        InvalidMessage => "m.invalid_message",
        /// Another device of the same user answered the request first.
        Accepted => "m.accepted",
        MismatchedCommitment => "m.mismatched_commitment",
        MismatchedSas => "m.mismatched_sas",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_values_parse() {
        assert_eq!(
            MessageAuthenticationCode::from("hkdf-hmac-sha256.v2"),
            MessageAuthenticationCode::HkdfHmacSha256V2
        );
        assert_eq!(CancelCode::from("m.accepted"), CancelCode::Accepted);
        assert_eq!(VerificationMethod::Sas.as_str(), "m.sas.v1");
    }

    #[test]
    fn unknown_values_survive_serde() {
        let json = r#"["m.sas.v1","m.reciprocate.v1"]"#;
        let methods: Vec<VerificationMethod> = serde_json::from_str(json).unwrap();
        assert_eq!(
            methods,
            vec![
                VerificationMethod::Sas,
                VerificationMethod::Unknown("m.reciprocate.v1".into())
            ]
        );
        assert_eq!(serde_json::to_string(&methods).unwrap(), json);
    }

    #[test]
    fn cancel_code_display() {
        assert_eq!(CancelCode::MismatchedSas.to_string(), "m.mismatched_sas");
        assert_eq!(CancelCode::Unknown("x.custom".into()).to_string(), "x.custom");
    }
}
