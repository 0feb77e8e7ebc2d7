//! Direct binding: steps travel as device-to-device messages.
//!
//! The request may go out to several devices of the counterpart. The first
//! one to answer is kept; every other device is told `m.accepted` and no
//! longer receives steps.
//!
//! Inbound messages are not read per verification: whoever listens on the
//! [`DirectTransport`] feeds looks up the verification by transaction id
//! and hands the message to [`dispatch`], so steps of every transaction are
//! applied in the order they arrived.

use std::sync::Arc;

use async_trait::async_trait;
use sasverify_core::protocol::{DirectBody, DirectMessage};
use sasverify_core::{CancelCode, VerificationStep};
use tokio::sync::{RwLock, broadcast};
use tracing::debug;

use super::StepTransport;
use crate::error::TransportError;
use crate::lifecycle::Verification;

/// A direct message as delivered to this device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedDirectMessage {
    pub sender: String,
    pub sender_device: String,
    pub message: DirectMessage,
}

/// Device-to-device message delivery.
#[async_trait]
pub trait DirectTransport: Send + Sync {
    /// Send `message` to the given devices of `user_id`.
    async fn send(
        &self,
        user_id: &str,
        device_ids: &[String],
        message: DirectMessage,
    ) -> Result<(), TransportError>;

    /// Messages that arrived unencrypted.
    fn subscribe_plain(&self) -> broadcast::Receiver<ReceivedDirectMessage>;

    /// Messages that arrived encrypted, after decryption.
    fn subscribe_decrypted(&self) -> broadcast::Receiver<ReceivedDirectMessage>;
}

/// Outbound side of a direct verification.
pub struct DirectStepTransport {
    transport: Arc<dyn DirectTransport>,
    their_user_id: String,
    transaction_id: String,
    recipients: RwLock<Vec<String>>,
}

impl DirectStepTransport {
    pub fn new(
        transport: Arc<dyn DirectTransport>,
        their_user_id: impl Into<String>,
        transaction_id: impl Into<String>,
        recipients: Vec<String>,
    ) -> Self {
        Self {
            transport,
            their_user_id: their_user_id.into(),
            transaction_id: transaction_id.into(),
            recipients: RwLock::new(recipients),
        }
    }

    pub async fn recipients(&self) -> Vec<String> {
        self.recipients.read().await.clone()
    }
}

#[async_trait]
impl StepTransport for DirectStepTransport {
    async fn send_step(&self, step: VerificationStep) -> Result<(), TransportError> {
        let recipients = self.recipients.read().await.clone();
        self.transport
            .send(
                &self.their_user_id,
                &recipients,
                DirectMessage::step(&self.transaction_id, step),
            )
            .await
    }

    async fn counterpart_chosen(&self, device_id: &str) -> Result<(), TransportError> {
        let others: Vec<String> = {
            let mut recipients = self.recipients.write().await;
            let others = recipients
                .iter()
                .filter(|d| d.as_str() != device_id)
                .cloned()
                .collect();
            *recipients = vec![device_id.to_string()];
            others
        };
        if others.is_empty() {
            return Ok(());
        }
        debug!(
            transaction_id = %self.transaction_id,
            device_id,
            others = others.len(),
            "Telling other devices the request was accepted"
        );
        self.transport
            .send(
                &self.their_user_id,
                &others,
                DirectMessage::step(
                    &self.transaction_id,
                    VerificationStep::cancel(
                        CancelCode::Accepted,
                        "verification was accepted by another device",
                    ),
                ),
            )
            .await
    }
}

/// Hand one received message to the lifecycle.
pub async fn dispatch(verification: &Verification, received: ReceivedDirectMessage) {
    if received.message.transaction_id != verification.transaction().id()
        || received.sender != verification.their_user_id()
    {
        debug!(
            transaction_id = %verification.transaction(),
            sender = %received.sender,
            "Ignoring message from unexpected sender"
        );
        return;
    }
    match received.message.body {
        DirectBody::Step(step) => {
            verification
                .handle_step(Some(&received.sender_device), step)
                .await;
        }
        DirectBody::Request(_) => {
            debug!(transaction_id = %verification.transaction(), "Ignoring repeated request");
        }
    }
}
