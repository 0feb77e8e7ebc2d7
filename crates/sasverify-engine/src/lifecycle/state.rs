//! Observable state of a verification lifecycle.

use sasverify_core::VerificationMethod;
use sasverify_core::protocol::CancelContent;

use crate::sas::SasVerification;

#[derive(Debug, Clone)]
pub enum VerificationState {
    /// We sent the request and wait for a ready step.
    OwnRequest,
    /// The counterpart sent the request; `ready()` is available.
    TheirRequest,
    /// Both sides are ready; `start(method)` is available.
    Ready { methods: Vec<VerificationMethod> },
    /// A method is running.
    Start {
        method: VerificationMethod,
        /// Device that sent the start step in effect.
        sender_device: String,
        sas: SasVerification,
    },
    /// One done step was sent; waiting for the other.
    WaitForDone { is_our_own: bool },
    Done,
    Cancel {
        content: CancelContent,
        is_our_own: bool,
    },
    /// Another device of ours answered the request.
    AcceptedByOtherDevice,
    /// Our progress could not be restored.
    Undefined,
}

impl VerificationState {
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Done | Self::Cancel { .. } | Self::AcceptedByOtherDevice | Self::Undefined
        )
    }

    /// Still waiting for the request to be answered.
    pub const fn is_request_phase(&self) -> bool {
        matches!(self, Self::OwnRequest | Self::TheirRequest)
    }

    pub const fn name(&self) -> &'static str {
        match self {
            Self::OwnRequest => "own_request",
            Self::TheirRequest => "their_request",
            Self::Ready { .. } => "ready",
            Self::Start { .. } => "start",
            Self::WaitForDone { .. } => "wait_for_done",
            Self::Done => "done",
            Self::Cancel { .. } => "cancel",
            Self::AcceptedByOtherDevice => "accepted_by_other_device",
            Self::Undefined => "undefined",
        }
    }

    /// The SAS run, while a method is active.
    pub const fn sas(&self) -> Option<&SasVerification> {
        match self {
            Self::Start { sas, .. } => Some(sas),
            _ => None,
        }
    }

    pub const fn cancel_content(&self) -> Option<&CancelContent> {
        match self {
            Self::Cancel { content, .. } => Some(content),
            _ => None,
        }
    }
}

impl std::fmt::Display for VerificationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sasverify_core::CancelCode;

    #[test]
    fn terminal_states() {
        assert!(VerificationState::Done.is_terminal());
        assert!(VerificationState::Undefined.is_terminal());
        assert!(VerificationState::AcceptedByOtherDevice.is_terminal());
        assert!(
            VerificationState::Cancel {
                content: CancelContent::new(CancelCode::User, "bye"),
                is_our_own: true,
            }
            .is_terminal()
        );
        assert!(!VerificationState::WaitForDone { is_our_own: true }.is_terminal());
        assert!(!VerificationState::OwnRequest.is_terminal());
    }

    #[test]
    fn request_phase() {
        assert!(VerificationState::TheirRequest.is_request_phase());
        assert!(!VerificationState::Ready { methods: vec![] }.is_request_phase());
    }
}
