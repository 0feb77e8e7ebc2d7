//! Verification orchestration.
//!
//! [`VerificationService`] creates verifications for local requests and for
//! requests arriving over either transport, registers them, and spawns the
//! drive loop and watchdog of each one. Its direct listener also applies
//! direct steps to the registered direct verification, in arrival order;
//! conversation requests are picked up by a separate listener.
//! An instance is dropped from the registry as soon as it finishes.

use std::future::Future;
use std::sync::Arc;

use sasverify_core::config::VerificationConfig;
use sasverify_core::protocol::{
    ConversationMessage, DirectBody, DirectMessage, RequestContent, RoomEvent,
};
use sasverify_core::{CancelCode, TransactionRef};
use sasverify_crypto::EphemeralKeySource;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{Result, VerificationError};
use crate::lifecycle::{
    SUPPORTED_METHODS, TimeoutPolicy, Verification, VerificationDeps, watchdog,
};
use crate::registry::{DirectInsert, VerificationRegistry};
use crate::request::{DeviceIdentity, VerificationRequest, is_request_active};
use crate::sas::SasSettings;
use crate::self_verification::{
    BootstrapReadiness, CrossSigningStatus, SelfVerificationMethods, self_verification_methods,
};
use crate::transport::{
    ConversationStepTransport, ConversationTransport, DirectStepTransport, DirectTransport,
    ReceivedDirectMessage, StepTransport, TimelineEntry, conversation, direct,
};
use crate::trust::TrustStore;

const INCOMING_CAPACITY: usize = 64;

/// External collaborators of the service.
#[derive(Clone)]
pub struct Collaborators {
    pub direct: Arc<dyn DirectTransport>,
    pub conversation: Arc<dyn ConversationTransport>,
    pub trust: Arc<dyn TrustStore>,
    pub key_source: Arc<dyn EphemeralKeySource>,
    pub clock: Arc<dyn Clock>,
}

struct ServiceInner {
    own: DeviceIdentity,
    config: VerificationConfig,
    settings: SasSettings,
    collaborators: Collaborators,
    registry: VerificationRegistry,
    /// Verifications created for incoming requests.
    incoming: broadcast::Sender<Verification>,
}

struct InboundFeeds {
    plain: broadcast::Receiver<ReceivedDirectMessage>,
    decrypted: broadcast::Receiver<ReceivedDirectMessage>,
    live: broadcast::Receiver<RoomEvent>,
}

/// Owns every verification of one device.
#[derive(Clone)]
pub struct VerificationService {
    inner: Arc<ServiceInner>,
}

impl VerificationService {
    pub fn new(own: DeviceIdentity, config: VerificationConfig, collaborators: Collaborators) -> Self {
        let settings = SasSettings::from_config(&config);
        Self::with_sas_settings(own, config, settings, collaborators)
    }

    /// Like [`new`](Self::new), but offer and accept exactly `settings`
    /// instead of what `config` derives.
    pub fn with_sas_settings(
        own: DeviceIdentity,
        config: VerificationConfig,
        settings: SasSettings,
        collaborators: Collaborators,
    ) -> Self {
        let (incoming, _) = broadcast::channel(INCOMING_CAPACITY);
        Self {
            inner: Arc::new(ServiceInner {
                own,
                settings,
                config,
                collaborators,
                registry: VerificationRegistry::new(),
                incoming,
            }),
        }
    }

    pub fn own(&self) -> &DeviceIdentity {
        &self.inner.own
    }

    pub fn registry(&self) -> &VerificationRegistry {
        &self.inner.registry
    }

    /// Verifications created for incoming requests, as they appear.
    pub fn subscribe_incoming(&self) -> broadcast::Receiver<Verification> {
        self.inner.incoming.subscribe()
    }

    /// Listen for incoming requests and route direct steps until `shutdown`
    /// turns `true`. Direct verifications only progress while this runs.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        let feeds = self.inbound_feeds();
        self.serve(feeds, shutdown).await;
    }

    /// Subscribe to the inbound feeds now and listen on a spawned task.
    /// Requests sent after this returns are not missed.
    pub fn spawn(&self, shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        let feeds = self.inbound_feeds();
        let service = self.clone();
        tokio::spawn(async move { service.serve(feeds, shutdown).await })
    }

    fn inbound_feeds(&self) -> InboundFeeds {
        let collaborators = &self.inner.collaborators;
        InboundFeeds {
            plain: collaborators.direct.subscribe_plain(),
            decrypted: collaborators.direct.subscribe_decrypted(),
            live: collaborators.conversation.subscribe(),
        }
    }

    async fn serve(&self, feeds: InboundFeeds, shutdown: watch::Receiver<bool>) {
        let InboundFeeds {
            plain,
            decrypted,
            live,
        } = feeds;
        info!(own = %self.inner.own, "Verification service running");
        tokio::join!(
            self.serve_direct(plain, decrypted, shutdown.clone()),
            self.serve_conversations(live, shutdown),
        );
        info!(own = %self.inner.own, "Verification service stopped");
    }

    /// Direct requests and steps, one at a time in arrival order.
    async fn serve_direct(
        &self,
        mut plain: broadcast::Receiver<ReceivedDirectMessage>,
        mut decrypted: broadcast::Receiver<ReceivedDirectMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let (mut plain_open, mut decrypted_open) = (true, true);
        loop {
            if *shutdown.borrow_and_update() || !(plain_open || decrypted_open) {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                received = plain.recv(), if plain_open => {
                    if let Some(received) = take(received, &mut plain_open) {
                        self.on_direct(received).await;
                    }
                }
                received = decrypted.recv(), if decrypted_open => {
                    if let Some(received) = take(received, &mut decrypted_open) {
                        self.on_direct(received).await;
                    }
                }
            }
        }
        debug!(own = %self.inner.own, "Direct listener stopped");
    }

    /// Conversation requests. Their steps are fed by each verification's
    /// drive loop.
    async fn serve_conversations(
        &self,
        mut live: broadcast::Receiver<RoomEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut live_open = true;
        while live_open {
            if *shutdown.borrow_and_update() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                received = live.recv() => {
                    if let Some(event) = take(received, &mut live_open) {
                        self.on_room_event(event).await;
                    }
                }
            }
        }
        debug!(own = %self.inner.own, "Conversation listener stopped");
    }

    async fn on_direct(&self, received: ReceivedDirectMessage) {
        let ReceivedDirectMessage {
            sender,
            sender_device,
            message,
        } = received;
        let DirectMessage {
            transaction_id,
            body,
        } = message;
        let content = match body {
            DirectBody::Request(content) => content,
            DirectBody::Step(step) => {
                let Some(verification) =
                    self.inner.registry.direct_transaction(&transaction_id).await
                else {
                    debug!(%transaction_id, step = step.name(), "Ignoring step for unknown transaction");
                    return;
                };
                let received = ReceivedDirectMessage {
                    sender,
                    sender_device,
                    message: DirectMessage::step(transaction_id, step),
                };
                direct::dispatch(&verification, received).await;
                return;
            }
        };
        if sender == self.inner.own.user_id && sender_device == self.inner.own.device_id {
            return;
        }
        if !self.is_active(content.timestamp) {
            debug!(%transaction_id, %sender, "Ignoring stale request");
            return;
        }

        let transport = Arc::new(DirectStepTransport::new(
            Arc::clone(&self.inner.collaborators.direct),
            sender.clone(),
            transaction_id.clone(),
            vec![sender_device],
        ));
        let verification = Verification::new(
            VerificationRequest {
                content,
                is_own: false,
                their_user_id: sender,
                transaction: TransactionRef::Direct(transaction_id),
            },
            self.deps(transport),
        );

        match self
            .inner
            .registry
            .insert_direct_if_vacant(verification.clone())
            .await
        {
            DirectInsert::Inserted => {
                self.spawn_direct(verification.clone());
                let _ = self.inner.incoming.send(verification);
            }
            DirectInsert::Occupied(existing) => {
                info!(
                    transaction_id = %verification.transaction(),
                    active = %existing.transaction(),
                    "Rejecting request, another direct verification is active"
                );
                if let Err(e) = verification
                    .cancel(CancelCode::User, "another verification is in progress")
                    .await
                {
                    debug!(transaction_id = %verification.transaction(), error = %e, "Rejection not delivered");
                }
            }
            DirectInsert::Duplicate(_) => {
                debug!(transaction_id = %verification.transaction(), "Ignoring repeated request");
            }
        }
    }

    async fn on_room_event(&self, event: RoomEvent) {
        let Some(ConversationMessage::Request { to, content }) = &event.message else {
            return;
        };
        if event.sender == self.inner.own.user_id || *to != self.inner.own.user_id {
            return;
        }
        if !self.is_active(content.timestamp) {
            debug!(event_id = %event.event_id, room_id = %event.room_id, "Ignoring stale request");
            return;
        }
        if self
            .inner
            .registry
            .conversation(&event.room_id, &event.event_id)
            .await
            .is_some()
        {
            return;
        }
        let live = self.inner.collaborators.conversation.subscribe();
        let verification = self.conversation_verification(
            &event.room_id,
            &event.event_id,
            content.clone(),
            false,
            event.sender.clone(),
        );
        if self.register_conversation(&event.room_id, &verification, live).await {
            let _ = self.inner.incoming.send(verification);
        }
    }

    /// Send a request to `device_ids` of `their_user_id`. Any running direct
    /// verification is cancelled.
    pub async fn create_device_verification(
        &self,
        their_user_id: &str,
        device_ids: Vec<String>,
    ) -> Result<Verification> {
        if device_ids.is_empty() {
            return Err(VerificationError::NoRecipients);
        }
        let transaction_id = uuid::Uuid::new_v4().to_string();
        let content = self.request_content();
        let direct = &self.inner.collaborators.direct;
        let transport = Arc::new(DirectStepTransport::new(
            Arc::clone(direct),
            their_user_id,
            transaction_id.clone(),
            device_ids.clone(),
        ));
        let verification = Verification::new(
            VerificationRequest {
                content: content.clone(),
                is_own: true,
                their_user_id: their_user_id.to_string(),
                transaction: TransactionRef::Direct(transaction_id.clone()),
            },
            self.deps(transport),
        );

        if let Some(displaced) = self
            .inner
            .registry
            .replace_direct(verification.clone())
            .await
        {
            info!(
                transaction_id = %displaced.transaction(),
                "Cancelling direct verification replaced by a new request"
            );
            if let Err(e) = displaced
                .cancel(CancelCode::User, "replaced by a new verification")
                .await
            {
                debug!(transaction_id = %displaced.transaction(), error = %e, "Cancel not delivered");
            }
        }
        self.spawn_direct(verification.clone());

        let request = DirectMessage {
            transaction_id: transaction_id.clone(),
            body: DirectBody::Request(content),
        };
        if let Err(e) = direct.send(their_user_id, &device_ids, request).await {
            warn!(%transaction_id, error = %e, "Failed to send request");
            verification
                .abort(CancelCode::User, format!("failed to send request: {e}"))
                .await;
            return Err(e.into());
        }
        info!(%transaction_id, their_user_id, devices = device_ids.len(), "Direct verification requested");
        Ok(verification)
    }

    /// Send a request to `their_user_id` inside `room_id`.
    pub async fn create_user_verification(
        &self,
        room_id: &str,
        their_user_id: &str,
    ) -> Result<Verification> {
        let content = self.request_content();
        let conversation = &self.inner.collaborators.conversation;
        let live = conversation.subscribe();
        let event_id = conversation
            .send(
                room_id,
                ConversationMessage::Request {
                    to: their_user_id.to_string(),
                    content: content.clone(),
                },
            )
            .await?;
        info!(transaction_id = %event_id, room_id, their_user_id, "Conversation verification requested");
        let verification = self.conversation_verification(
            room_id,
            &event_id,
            content,
            true,
            their_user_id.to_string(),
        );
        self.register_conversation(room_id, &verification, live).await;
        Ok(verification)
    }

    /// The running direct verification.
    pub async fn active_device_verification(&self) -> Option<Verification> {
        self.inner.registry.direct().await
    }

    /// The verification for the request `event_id` in `room_id`. Resumed
    /// from the room history if it is not running yet. `None` if the request
    /// is not ours to answer.
    pub async fn active_user_verification(
        &self,
        room_id: &str,
        event_id: &str,
    ) -> Result<Option<Verification>> {
        if let Some(verification) = self.inner.registry.conversation(room_id, event_id).await {
            return Ok(Some(verification));
        }
        let conversation = &self.inner.collaborators.conversation;
        let live = conversation.subscribe();
        let history = conversation.read_from(room_id, event_id).await?;
        let not_a_request = || VerificationError::NotARequest {
            room_id: room_id.to_string(),
            event_id: event_id.to_string(),
        };
        let first = history.into_iter().next().ok_or_else(not_a_request)?;
        let event = resolve_entry(first).await.ok_or_else(not_a_request)?;
        let Some(ConversationMessage::Request { to, content }) = event.message else {
            return Err(not_a_request());
        };

        let own = &self.inner.own;
        let (is_own, their_user_id) = if event.sender == own.user_id {
            if content.from_device != own.device_id {
                debug!(transaction_id = event_id, room_id, "Request was sent by another own device");
                return Ok(None);
            }
            (true, to)
        } else if to == own.user_id {
            (false, event.sender)
        } else {
            return Ok(None);
        };
        debug!(transaction_id = event_id, room_id, is_own, "Resuming verification from history");
        let verification =
            self.conversation_verification(room_id, event_id, content, is_own, their_user_id);
        if !self.register_conversation(room_id, &verification, live).await {
            return Ok(self.inner.registry.conversation(room_id, event_id).await);
        }
        Ok(Some(verification))
    }

    /// Every registered conversation verification.
    pub async fn active_user_verifications(&self) -> Vec<Verification> {
        self.inner.registry.conversations().await
    }

    /// Which ways of verifying this device are available.
    pub fn self_verification_methods(
        &self,
        readiness: BootstrapReadiness,
        status: &CrossSigningStatus,
    ) -> SelfVerificationMethods {
        self_verification_methods(readiness, status)
    }

    /// Verify this device with our already cross-signed `device_ids`.
    pub async fn start_self_verification(&self, device_ids: Vec<String>) -> Result<Verification> {
        let own_user = self.inner.own.user_id.clone();
        let device_ids = device_ids
            .into_iter()
            .filter(|d| *d != self.inner.own.device_id)
            .collect();
        self.create_device_verification(&own_user, device_ids).await
    }

    fn request_content(&self) -> RequestContent {
        RequestContent {
            from_device: self.inner.own.device_id.clone(),
            methods: SUPPORTED_METHODS.to_vec(),
            timestamp: self.inner.collaborators.clock.now_millis(),
        }
    }

    fn is_active(&self, timestamp: u64) -> bool {
        is_request_active(
            timestamp,
            self.inner.collaborators.clock.now_millis(),
            self.inner.config.request_timeout(),
            self.inner.config.max_future_skew(),
        )
    }

    fn deps(&self, transport: Arc<dyn StepTransport>) -> VerificationDeps {
        let collaborators = &self.inner.collaborators;
        VerificationDeps {
            own: self.inner.own.clone(),
            transport,
            trust: Arc::clone(&collaborators.trust),
            key_source: Arc::clone(&collaborators.key_source),
            settings: self.inner.settings.clone(),
        }
    }

    fn conversation_verification(
        &self,
        room_id: &str,
        event_id: &str,
        content: RequestContent,
        is_own: bool,
        their_user_id: String,
    ) -> Verification {
        let transport = Arc::new(ConversationStepTransport::new(
            Arc::clone(&self.inner.collaborators.conversation),
            room_id,
            event_id,
        ));
        Verification::new(
            VerificationRequest {
                content,
                is_own,
                their_user_id,
                transaction: TransactionRef::Conversation(event_id.to_string()),
            },
            self.deps(transport),
        )
    }

    /// Register and spawn a conversation verification. `false` if another
    /// instance already holds the slot.
    async fn register_conversation(
        &self,
        room_id: &str,
        verification: &Verification,
        live: broadcast::Receiver<RoomEvent>,
    ) -> bool {
        if let Err(existing) = self
            .inner
            .registry
            .insert_conversation(room_id, verification.clone())
            .await
        {
            debug!(transaction_id = %existing.transaction(), room_id, "Verification already registered");
            return false;
        }
        let drive = conversation::drive(
            verification.clone(),
            Arc::clone(&self.inner.collaborators.conversation),
            room_id.to_string(),
            self.inner.own.clone(),
            live,
        );
        self.spawn_tasks(verification.clone(), TimeoutPolicy::RequestThenInactivity, drive);
        true
    }

    /// Direct steps are applied by the listening loop, so the drive task only
    /// waits for the end.
    fn spawn_direct(&self, verification: Verification) {
        let finished = verification.clone();
        let drive = async move {
            finished.finished().await;
        };
        self.spawn_tasks(verification, TimeoutPolicy::FixedFromRequest, drive);
    }

    fn spawn_tasks<F>(&self, verification: Verification, policy: TimeoutPolicy, drive: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(watchdog::run(
            verification.clone(),
            policy,
            self.inner.config.request_timeout(),
            Arc::clone(&self.inner.collaborators.clock),
        ));
        let registry = self.inner.registry.clone();
        tokio::spawn(async move {
            drive.await;
            registry.remove(&verification).await;
        });
    }
}

/// Unwrap one item of an inbound feed, clearing `open` once it closed.
fn take<T>(received: std::result::Result<T, broadcast::error::RecvError>, open: &mut bool) -> Option<T> {
    match received {
        Ok(item) => Some(item),
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
            warn!(skipped, "Inbound feed lagged");
            None
        }
        Err(broadcast::error::RecvError::Closed) => {
            *open = false;
            None
        }
    }
}

/// The event behind a history entry, waiting for decryption if needed.
async fn resolve_entry(entry: TimelineEntry) -> Option<RoomEvent> {
    match entry {
        TimelineEntry::Event(event) => Some(event),
        TimelineEntry::Pending(mut pending) => pending
            .resolved
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|event| (*event).clone()),
    }
}
