//! SAS (short authentication string) method.
//!
//! The [`SasMachine`](machine::SasMachine) holds the protocol state and the
//! secret material; [`SasVerification`] is the handle a UI drives it with.
//! Every action goes through the owning lifecycle so that steps stay
//! serialised with inbound traffic.

pub mod mac;
pub mod machine;
pub mod negotiation;
pub mod state;

use std::sync::Weak;

use tokio::sync::watch;

pub use negotiation::SasSettings;
pub use state::SasState;

use crate::error::{Result, VerificationError};
use crate::lifecycle::{SasAction, Shared, Verification};

/// Handle on the SAS run of a verification.
#[derive(Clone)]
pub struct SasVerification {
    lifecycle: Weak<Shared>,
    generation: u64,
    state: watch::Receiver<SasState>,
}

impl std::fmt::Debug for SasVerification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SasVerification")
            .field("generation", &self.generation)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl SasVerification {
    pub(crate) const fn new(
        lifecycle: Weak<Shared>,
        generation: u64,
        state: watch::Receiver<SasState>,
    ) -> Self {
        Self {
            lifecycle,
            generation,
            state,
        }
    }

    pub fn state(&self) -> SasState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SasState> {
        self.state.clone()
    }

    /// Accept the counterpart's start step.
    pub async fn accept(&self) -> Result<()> {
        self.lifecycle()?
            .sas_action(self.generation, SasAction::Accept)
            .await
    }

    /// Both devices show the same SAS.
    pub async fn confirm_match(&self) -> Result<()> {
        self.lifecycle()?
            .sas_action(self.generation, SasAction::ConfirmMatch)
            .await
    }

    /// The devices show different SAS. Cancels the verification.
    pub async fn no_match(&self) -> Result<()> {
        self.lifecycle()?
            .sas_action(self.generation, SasAction::NoMatch)
            .await
    }

    fn lifecycle(&self) -> Result<Verification> {
        self.lifecycle
            .upgrade()
            .map(Verification::from_shared)
            .ok_or(VerificationError::Gone)
    }
}
