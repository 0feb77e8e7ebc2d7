//! Conversation binding: steps travel as messages in a shared room.
//!
//! Steps reference the request message's event id. A verification may be
//! picked up long after the request was sent, so the drive loop first reads
//! the room history from the request onwards, then follows live events.
//! Our own messages need care: in history they restore our progress, live
//! they are echoes, and ready or start from another of our devices means
//! that device took over.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use sasverify_core::VerificationStep;
use sasverify_core::protocol::{ConversationMessage, RoomEvent};
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

use super::StepTransport;
use crate::error::TransportError;
use crate::lifecycle::{Verification, VerificationState};
use crate::request::DeviceIdentity;

/// An event in history whose content is still being decrypted.
#[derive(Debug, Clone)]
pub struct PendingEvent {
    pub event_id: String,
    /// Becomes `Some` once decrypted. Dropped if decryption gives up.
    pub resolved: watch::Receiver<Option<RoomEvent>>,
}

#[derive(Debug, Clone)]
pub enum TimelineEntry {
    Event(RoomEvent),
    Pending(PendingEvent),
}

impl TimelineEntry {
    pub fn event_id(&self) -> &str {
        match self {
            Self::Event(event) => &event.event_id,
            Self::Pending(pending) => &pending.event_id,
        }
    }
}

/// Message delivery into conversations.
#[async_trait]
pub trait ConversationTransport: Send + Sync {
    /// Send `message` into `room_id`, returning the new event id.
    async fn send(
        &self,
        room_id: &str,
        message: ConversationMessage,
    ) -> Result<String, TransportError>;

    /// Live events of every room.
    fn subscribe(&self) -> broadcast::Receiver<RoomEvent>;

    /// History of `room_id` starting at `event_id`, oldest first.
    async fn read_from(
        &self,
        room_id: &str,
        event_id: &str,
    ) -> Result<Vec<TimelineEntry>, TransportError>;
}

/// Outbound side of a conversation verification.
pub struct ConversationStepTransport {
    transport: Arc<dyn ConversationTransport>,
    room_id: String,
    request_event_id: String,
}

impl ConversationStepTransport {
    pub fn new(
        transport: Arc<dyn ConversationTransport>,
        room_id: impl Into<String>,
        request_event_id: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            room_id: room_id.into(),
            request_event_id: request_event_id.into(),
        }
    }
}

#[async_trait]
impl StepTransport for ConversationStepTransport {
    async fn send_step(&self, step: VerificationStep) -> Result<(), TransportError> {
        self.transport
            .send(
                &self.room_id,
                ConversationMessage::Step {
                    relates_to: self.request_event_id.clone(),
                    step,
                },
            )
            .await
            .map(|_| ())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    History,
    Live,
}

/// Replay history, then feed live steps for `verification` until it is
/// finished.
///
/// `live` must be subscribed before history is read so nothing falls in
/// between.
pub async fn drive(
    verification: Verification,
    transport: Arc<dyn ConversationTransport>,
    room_id: String,
    own: DeviceIdentity,
    mut live: broadcast::Receiver<RoomEvent>,
) {
    let request_event_id = verification.transaction().id().to_string();
    let mut seen = HashSet::new();
    let mut state = verification.subscribe();

    match transport.read_from(&room_id, &request_event_id).await {
        Ok(history) => {
            for entry in history {
                if verification.state().is_terminal() {
                    break;
                }
                let event = match entry {
                    TimelineEntry::Event(event) => Some(event),
                    TimelineEntry::Pending(pending) => resolve(&verification, pending).await,
                };
                if let Some(event) = event
                    && event.room_id == room_id
                    && seen.insert(event.event_id.clone())
                {
                    handle_event(&verification, &own, event, Source::History).await;
                }
            }
        }
        Err(e) => {
            warn!(
                transaction_id = %request_event_id,
                room_id,
                error = %e,
                "Failed to read history"
            );
        }
    }
    verification.finish_replay().await;

    loop {
        if state.borrow_and_update().is_terminal() {
            break;
        }
        tokio::select! {
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            received = live.recv() => match received {
                Ok(event) => {
                    if event.room_id == room_id && seen.insert(event.event_id.clone()) {
                        handle_event(&verification, &own, event, Source::Live).await;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(transaction_id = %request_event_id, skipped, "Live feed lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    debug!(transaction_id = %request_event_id, "Conversation drive loop finished");
}

/// Wait for a pending history event. `None` if decryption gave up or the
/// verification finished first.
async fn resolve(verification: &Verification, pending: PendingEvent) -> Option<RoomEvent> {
    let PendingEvent {
        event_id,
        mut resolved,
    } = pending;
    debug!(transaction_id = %verification.transaction(), event_id, "Waiting for pending event");
    let mut state = verification.subscribe();
    loop {
        if let Some(event) = resolved.borrow_and_update().clone() {
            return Some(event);
        }
        tokio::select! {
            changed = resolved.changed() => {
                if changed.is_err() {
                    debug!(event_id, "Pending event dropped");
                    return resolved.borrow().clone();
                }
            }
            () = async {
                let _ = state.wait_for(VerificationState::is_terminal).await;
            } => return None,
        }
    }
}

async fn handle_event(
    verification: &Verification,
    own: &DeviceIdentity,
    event: RoomEvent,
    source: Source,
) {
    let Some(ConversationMessage::Step { relates_to, step }) = event.message else {
        return;
    };
    if relates_to != verification.transaction().id() {
        return;
    }

    if event.sender == own.user_id {
        if let Some(device) = step.from_device()
            && device != own.device_id
        {
            let device = device.to_string();
            verification.accepted_by_other_device(&device).await;
            return;
        }
        match source {
            Source::History => verification.replay_own_step(step).await,
            Source::Live => {
                debug!(
                    transaction_id = %verification.transaction(),
                    step = step.name(),
                    "Skipping own echo"
                );
            }
        }
        return;
    }

    if event.sender != verification.their_user_id() {
        debug!(
            transaction_id = %verification.transaction(),
            sender = %event.sender,
            "Ignoring step from third party"
        );
        return;
    }
    verification.handle_step(None, step).await;
}
