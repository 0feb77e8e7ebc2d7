//! Bootstrap options for verifying a new device of our own user.
//!
//! A new device becomes trusted either by verifying with another of our
//! devices that is already cross-signed, or by unlocking the cross-signing
//! secrets with a recovery key. Only the first runs in this engine; the
//! recovery key variants are surfaced for the caller to act on.

use std::collections::BTreeSet;

/// What the client has finished loading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BootstrapReadiness {
    pub initial_sync_done: bool,
    pub device_keys_fetched: bool,
    pub cross_signing_keys_fetched: bool,
    /// A bootstrap is already running.
    pub bootstrap_running: bool,
}

/// A readiness condition that does not hold yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Precondition {
    InitialSync,
    DeviceKeys,
    CrossSigningKeys,
    NoBootstrapRunning,
}

/// A recovery key stored for the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryKeyInfo {
    pub key_id: String,
    /// Whether the key can also be derived from a passphrase.
    pub has_passphrase: bool,
}

/// Cross-signing situation of our user, as seen from this device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrossSigningStatus {
    /// The user has a cross-signing identity.
    pub enabled: bool,
    /// This device is signed by that identity.
    pub this_device_cross_signed: bool,
    /// Our other devices that are signed by that identity.
    pub cross_signed_devices: Vec<String>,
    pub recovery_key: Option<RecoveryKeyInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelfVerificationMethod {
    /// Interactive verification with one of the listed devices.
    CrossSignedDeviceVerification { device_ids: Vec<String> },
    RecoveryKey { key_id: String },
    RecoveryKeyWithPassphrase { key_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelfVerificationMethods {
    PreconditionsNotMet(BTreeSet<Precondition>),
    NoCrossSigningEnabled,
    AlreadyCrossSigned,
    CrossSigningEnabled(Vec<SelfVerificationMethod>),
}

impl SelfVerificationMethods {
    /// Devices to verify with, if device verification is on offer.
    pub fn device_ids(&self) -> Option<&[String]> {
        let Self::CrossSigningEnabled(methods) = self else {
            return None;
        };
        methods.iter().find_map(|method| match method {
            SelfVerificationMethod::CrossSignedDeviceVerification { device_ids } => {
                Some(device_ids.as_slice())
            }
            _ => None,
        })
    }
}

/// Which ways of verifying this device are available.
pub fn self_verification_methods(
    readiness: BootstrapReadiness,
    status: &CrossSigningStatus,
) -> SelfVerificationMethods {
    let missing: BTreeSet<Precondition> = [
        (!readiness.initial_sync_done, Precondition::InitialSync),
        (!readiness.device_keys_fetched, Precondition::DeviceKeys),
        (!readiness.cross_signing_keys_fetched, Precondition::CrossSigningKeys),
        (readiness.bootstrap_running, Precondition::NoBootstrapRunning),
    ]
    .into_iter()
    .filter_map(|(unmet, precondition)| unmet.then_some(precondition))
    .collect();
    if !missing.is_empty() {
        return SelfVerificationMethods::PreconditionsNotMet(missing);
    }

    if !status.enabled {
        return SelfVerificationMethods::NoCrossSigningEnabled;
    }
    if status.this_device_cross_signed {
        return SelfVerificationMethods::AlreadyCrossSigned;
    }

    let mut methods = Vec::new();
    if !status.cross_signed_devices.is_empty() {
        methods.push(SelfVerificationMethod::CrossSignedDeviceVerification {
            device_ids: status.cross_signed_devices.clone(),
        });
    }
    if let Some(recovery) = &status.recovery_key {
        methods.push(SelfVerificationMethod::RecoveryKey {
            key_id: recovery.key_id.clone(),
        });
        if recovery.has_passphrase {
            methods.push(SelfVerificationMethod::RecoveryKeyWithPassphrase {
                key_id: recovery.key_id.clone(),
            });
        }
    }
    SelfVerificationMethods::CrossSigningEnabled(methods)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready() -> BootstrapReadiness {
        BootstrapReadiness {
            initial_sync_done: true,
            device_keys_fetched: true,
            cross_signing_keys_fetched: true,
            bootstrap_running: false,
        }
    }

    fn enabled() -> CrossSigningStatus {
        CrossSigningStatus {
            enabled: true,
            ..CrossSigningStatus::default()
        }
    }

    #[test]
    fn lists_every_unmet_precondition() {
        let readiness = BootstrapReadiness {
            device_keys_fetched: true,
            bootstrap_running: true,
            ..BootstrapReadiness::default()
        };
        let result = self_verification_methods(readiness, &enabled());
        let expected: BTreeSet<_> = [
            Precondition::InitialSync,
            Precondition::CrossSigningKeys,
            Precondition::NoBootstrapRunning,
        ]
        .into();
        assert_eq!(result, SelfVerificationMethods::PreconditionsNotMet(expected));
    }

    #[test]
    fn preconditions_checked_before_cross_signing() {
        let result = self_verification_methods(
            BootstrapReadiness::default(),
            &CrossSigningStatus::default(),
        );
        assert!(matches!(result, SelfVerificationMethods::PreconditionsNotMet(_)));
    }

    #[test]
    fn no_identity() {
        let result = self_verification_methods(ready(), &CrossSigningStatus::default());
        assert_eq!(result, SelfVerificationMethods::NoCrossSigningEnabled);
    }

    #[test]
    fn already_signed() {
        let status = CrossSigningStatus {
            this_device_cross_signed: true,
            cross_signed_devices: vec!["OTHER".into()],
            ..enabled()
        };
        assert_eq!(
            self_verification_methods(ready(), &status),
            SelfVerificationMethods::AlreadyCrossSigned
        );
    }

    #[test]
    fn offers_devices_and_recovery_key() {
        let status = CrossSigningStatus {
            cross_signed_devices: vec!["PHONE".into(), "LAPTOP".into()],
            recovery_key: Some(RecoveryKeyInfo {
                key_id: "key1".into(),
                has_passphrase: true,
            }),
            ..enabled()
        };
        let result = self_verification_methods(ready(), &status);
        assert_eq!(
            result,
            SelfVerificationMethods::CrossSigningEnabled(vec![
                SelfVerificationMethod::CrossSignedDeviceVerification {
                    device_ids: vec!["PHONE".into(), "LAPTOP".into()],
                },
                SelfVerificationMethod::RecoveryKey {
                    key_id: "key1".into()
                },
                SelfVerificationMethod::RecoveryKeyWithPassphrase {
                    key_id: "key1".into()
                },
            ])
        );
        assert_eq!(result.device_ids().unwrap(), ["PHONE", "LAPTOP"]);
    }

    #[test]
    fn recovery_key_without_passphrase() {
        let status = CrossSigningStatus {
            recovery_key: Some(RecoveryKeyInfo {
                key_id: "key1".into(),
                has_passphrase: false,
            }),
            ..enabled()
        };
        let result = self_verification_methods(ready(), &status);
        assert_eq!(
            result,
            SelfVerificationMethods::CrossSigningEnabled(vec![SelfVerificationMethod::RecoveryKey {
                key_id: "key1".into()
            }])
        );
        assert!(result.device_ids().is_none());
    }
}
