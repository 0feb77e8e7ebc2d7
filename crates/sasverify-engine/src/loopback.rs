//! In-memory transports.
//!
//! A [`LoopbackNetwork`] connects any number of devices. Direct messages go
//! to the addressed devices' feeds; conversation messages are appended to a
//! shared room history and broadcast live. Used by the demo binary and the
//! tests, with hooks to tamper with traffic and to fail sends.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use sasverify_core::protocol::{ConversationMessage, DirectMessage, RoomEvent};
use tokio::sync::{broadcast, watch};
use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::error::TransportError;
use crate::request::DeviceIdentity;
use crate::transport::{
    ConversationTransport, DirectTransport, PendingEvent, ReceivedDirectMessage, TimelineEntry,
};

const CHANNEL_CAPACITY: usize = 256;

/// Rewrites or drops a direct message in flight. Return `false` to drop.
pub type DirectInterceptor = Box<dyn FnMut(&mut ReceivedDirectMessage) -> bool + Send>;

struct DeviceFeeds {
    plain: broadcast::Sender<ReceivedDirectMessage>,
    decrypted: broadcast::Sender<ReceivedDirectMessage>,
}

#[derive(Default)]
struct NetworkState {
    devices: HashMap<DeviceIdentity, DeviceFeeds>,
    /// Devices whose inbound direct messages arrive encrypted.
    encrypted: Vec<DeviceIdentity>,
    rooms: HashMap<String, Vec<TimelineEntry>>,
    next_event: u64,
    interceptor: Option<DirectInterceptor>,
}

fn feeds<'a>(state: &'a mut NetworkState, device: &DeviceIdentity) -> &'a DeviceFeeds {
    state
        .devices
        .entry(device.clone())
        .or_insert_with(|| DeviceFeeds {
            plain: broadcast::channel(CHANNEL_CAPACITY).0,
            decrypted: broadcast::channel(CHANNEL_CAPACITY).0,
        })
}

/// Shared in-memory network.
#[derive(Clone)]
pub struct LoopbackNetwork {
    state: Arc<Mutex<NetworkState>>,
    live: broadcast::Sender<RoomEvent>,
    clock: Arc<dyn Clock>,
}

impl Default for LoopbackNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let (live, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            state: Arc::new(Mutex::new(NetworkState::default())),
            live,
            clock,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach a device and return its endpoint.
    pub fn endpoint(&self, device: DeviceIdentity) -> LoopbackEndpoint {
        feeds(&mut self.lock(), &device);
        LoopbackEndpoint {
            network: self.clone(),
            device,
            fail_sends: Arc::new(Mutex::new(false)),
        }
    }

    /// Deliver direct messages for `device` on its decrypted feed.
    pub fn set_encrypted(&self, device: &DeviceIdentity, encrypted: bool) {
        let mut state = self.lock();
        state.encrypted.retain(|d| d != device);
        if encrypted {
            state.encrypted.push(device.clone());
        }
    }

    pub fn set_interceptor(&self, interceptor: Option<DirectInterceptor>) {
        self.lock().interceptor = interceptor;
    }

    /// Deliver a direct message to `recipient` as if it came over the wire.
    pub fn inject_direct(&self, recipient: &DeviceIdentity, message: ReceivedDirectMessage) {
        let state = self.lock();
        Self::deliver(&state, recipient, message);
    }

    fn deliver(state: &NetworkState, recipient: &DeviceIdentity, message: ReceivedDirectMessage) {
        let Some(feeds) = state.devices.get(recipient) else {
            debug!(%recipient, "No such loopback device");
            return;
        };
        let feed = if state.encrypted.contains(recipient) {
            &feeds.decrypted
        } else {
            &feeds.plain
        };
        // No receiver just means nobody is listening yet.
        let _ = feed.send(message);
    }

    /// Append an event to a room's history and broadcast it live.
    pub fn push_event(&self, event: RoomEvent) {
        let mut state = self.lock();
        state
            .rooms
            .entry(event.room_id.clone())
            .or_default()
            .push(TimelineEntry::Event(event.clone()));
        drop(state);
        let _ = self.live.send(event);
    }

    /// Append an event whose content is not decrypted yet. Resolve it by
    /// sending `Some(event)` on the returned sender, or drop the sender to
    /// give up.
    pub fn push_pending(&self, room_id: &str, event_id: &str) -> watch::Sender<Option<RoomEvent>> {
        let (tx, rx) = watch::channel(None);
        self.lock()
            .rooms
            .entry(room_id.to_string())
            .or_default()
            .push(TimelineEntry::Pending(PendingEvent {
                event_id: event_id.to_string(),
                resolved: rx,
            }));
        tx
    }

    /// Next unique event id.
    pub fn next_event_id(&self) -> String {
        let mut state = self.lock();
        state.next_event += 1;
        format!("$event{}", state.next_event)
    }

    /// Build an event sent by `sender` without delivering it.
    pub fn event(&self, room_id: &str, sender: &str, message: ConversationMessage) -> RoomEvent {
        RoomEvent {
            room_id: room_id.to_string(),
            event_id: self.next_event_id(),
            sender: sender.to_string(),
            origin_server_ts: self.clock.now_millis(),
            message: Some(message),
        }
    }
}

/// One device's view of a [`LoopbackNetwork`].
#[derive(Clone)]
pub struct LoopbackEndpoint {
    network: LoopbackNetwork,
    device: DeviceIdentity,
    fail_sends: Arc<Mutex<bool>>,
}

impl LoopbackEndpoint {
    pub const fn device(&self) -> &DeviceIdentity {
        &self.device
    }

    pub const fn network(&self) -> &LoopbackNetwork {
        &self.network
    }

    /// Make every send from this endpoint fail.
    pub fn set_fail_sends(&self, fail: bool) {
        *self.fail_sends.lock().unwrap_or_else(PoisonError::into_inner) = fail;
    }

    fn check_send(&self) -> Result<(), TransportError> {
        if *self.fail_sends.lock().unwrap_or_else(PoisonError::into_inner) {
            return Err(TransportError::Delivery(format!(
                "sends from {} are disabled",
                self.device
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl DirectTransport for LoopbackEndpoint {
    async fn send(
        &self,
        user_id: &str,
        device_ids: &[String],
        message: DirectMessage,
    ) -> Result<(), TransportError> {
        self.check_send()?;
        let mut state = self.network.lock();
        for device_id in device_ids {
            let recipient = DeviceIdentity::new(user_id, device_id.as_str());
            let mut received = ReceivedDirectMessage {
                sender: self.device.user_id.clone(),
                sender_device: self.device.device_id.clone(),
                message: message.clone(),
            };
            if let Some(interceptor) = state.interceptor.as_mut()
                && !interceptor(&mut received)
            {
                debug!(%recipient, "Direct message dropped by interceptor");
                continue;
            }
            LoopbackNetwork::deliver(&state, &recipient, received);
        }
        Ok(())
    }

    fn subscribe_plain(&self) -> broadcast::Receiver<ReceivedDirectMessage> {
        feeds(&mut self.network.lock(), &self.device).plain.subscribe()
    }

    fn subscribe_decrypted(&self) -> broadcast::Receiver<ReceivedDirectMessage> {
        feeds(&mut self.network.lock(), &self.device).decrypted.subscribe()
    }
}

#[async_trait]
impl ConversationTransport for LoopbackEndpoint {
    async fn send(
        &self,
        room_id: &str,
        message: ConversationMessage,
    ) -> Result<String, TransportError> {
        self.check_send()?;
        let event = self.network.event(room_id, &self.device.user_id, message);
        let event_id = event.event_id.clone();
        self.network.push_event(event);
        Ok(event_id)
    }

    fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        self.network.live.subscribe()
    }

    async fn read_from(
        &self,
        room_id: &str,
        event_id: &str,
    ) -> Result<Vec<TimelineEntry>, TransportError> {
        let state = self.network.lock();
        let timeline = state
            .rooms
            .get(room_id)
            .ok_or_else(|| TransportError::UnknownConversation(room_id.to_string()))?;
        let start = timeline
            .iter()
            .position(|entry| entry.event_id() == event_id)
            .ok_or_else(|| TransportError::UnknownEvent {
                room_id: room_id.to_string(),
                event_id: event_id.to_string(),
            })?;
        Ok(timeline[start..].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sasverify_core::protocol::RequestContent;
    use sasverify_core::{CancelCode, VerificationMethod, VerificationStep};

    fn alice() -> DeviceIdentity {
        DeviceIdentity::new("@alice:x", "A1")
    }

    fn bob() -> DeviceIdentity {
        DeviceIdentity::new("@bob:x", "B1")
    }

    fn cancel() -> DirectMessage {
        DirectMessage::step("tx", VerificationStep::cancel(CancelCode::User, "bye"))
    }

    #[tokio::test]
    async fn direct_message_reaches_addressed_device() {
        let network = LoopbackNetwork::new();
        let a = network.endpoint(alice());
        let b = network.endpoint(bob());
        let mut rx = b.subscribe_plain();

        DirectTransport::send(&a, "@bob:x", &["B1".into()], cancel())
            .await
            .unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received.sender, "@alice:x");
        assert_eq!(received.sender_device, "A1");
        assert_eq!(received.message, cancel());
    }

    #[tokio::test]
    async fn encrypted_device_gets_decrypted_feed() {
        let network = LoopbackNetwork::new();
        let a = network.endpoint(alice());
        let b = network.endpoint(bob());
        network.set_encrypted(&bob(), true);
        let mut plain = b.subscribe_plain();
        let mut decrypted = b.subscribe_decrypted();

        DirectTransport::send(&a, "@bob:x", &["B1".into()], cancel())
            .await
            .unwrap();
        assert!(decrypted.recv().await.is_ok());
        assert!(plain.try_recv().is_err());
    }

    #[tokio::test]
    async fn failing_endpoint_reports_error() {
        let network = LoopbackNetwork::new();
        let a = network.endpoint(alice());
        a.set_fail_sends(true);
        let result = DirectTransport::send(&a, "@bob:x", &["B1".into()], cancel()).await;
        assert!(matches!(result, Err(TransportError::Delivery(_))));
    }

    #[tokio::test]
    async fn interceptor_can_drop() {
        let network = LoopbackNetwork::new();
        let a = network.endpoint(alice());
        let b = network.endpoint(bob());
        let mut rx = b.subscribe_plain();
        network.set_interceptor(Some(Box::new(|_| false)));

        DirectTransport::send(&a, "@bob:x", &["B1".into()], cancel())
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn history_starts_at_event() {
        let network = LoopbackNetwork::new();
        let a = network.endpoint(alice());
        let request = ConversationMessage::Request {
            to: "@bob:x".into(),
            content: RequestContent {
                from_device: "A1".into(),
                methods: vec![VerificationMethod::Sas],
                timestamp: 0,
            },
        };
        network.push_event(network.event("!room", "@alice:x", request.clone()));
        let id = ConversationTransport::send(&a, "!room", request).await.unwrap();

        let history = a.read_from("!room", &id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].event_id(), id);

        assert!(matches!(
            a.read_from("!other", &id).await,
            Err(TransportError::UnknownConversation(_))
        ));
    }
}
