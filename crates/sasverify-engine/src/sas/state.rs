//! Observable state of a SAS run.

use sasverify_crypto::SasEmoji;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SasState {
    /// We sent the start step and wait for the counterpart to accept.
    OwnSasStart,
    /// The counterpart started; [`accept`](super::SasVerification::accept)
    /// is available.
    TheirSasStart,
    /// An accept step was exchanged.
    Accept { is_our_own: bool },
    /// Public keys are being exchanged; `is_our_own` tells whose key went
    /// out last.
    WaitForKeys { is_our_own: bool },
    /// Both keys are known; the user compares what both devices show.
    ComparisonByUser {
        decimals: [u16; 3],
        emojis: [SasEmoji; 7],
    },
    /// Our MAC is sent; waiting for the counterpart's.
    WaitForMacs,
}

impl SasState {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::OwnSasStart => "own_sas_start",
            Self::TheirSasStart => "their_sas_start",
            Self::Accept { .. } => "accept",
            Self::WaitForKeys { .. } => "wait_for_keys",
            Self::ComparisonByUser { .. } => "comparison_by_user",
            Self::WaitForMacs => "wait_for_macs",
        }
    }
}

impl std::fmt::Display for SasState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
