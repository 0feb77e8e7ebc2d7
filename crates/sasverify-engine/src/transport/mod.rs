//! Transport bindings.
//!
//! A verification runs either over direct device messages or inside a
//! conversation. Both bindings implement [`StepTransport`] for the outbound
//! side. Inbound conversation steps are fed by a drive loop per
//! verification; inbound direct steps are routed by the service.

pub mod conversation;
pub mod direct;

use async_trait::async_trait;
use sasverify_core::VerificationStep;

use crate::error::TransportError;

pub use conversation::{
    ConversationStepTransport, ConversationTransport, PendingEvent, TimelineEntry,
};
pub use direct::{DirectStepTransport, DirectTransport, ReceivedDirectMessage};

/// Outbound half of a binding, as seen by the lifecycle.
#[async_trait]
pub trait StepTransport: Send + Sync {
    /// Send one step of this verification to the counterpart.
    async fn send_step(&self, step: VerificationStep) -> Result<(), TransportError>;

    /// The counterpart picked `device_id` to answer from.
    async fn counterpart_chosen(&self, _device_id: &str) -> Result<(), TransportError> {
        Ok(())
    }
}
