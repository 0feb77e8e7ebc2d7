//! Verification lifecycle.
//!
//! Request, ready, start, done and cancel handling shared by every
//! transport. One [`Verification`] exists per transaction. Inbound steps and
//! local actions take the same lock, so they are applied one at a time in
//! arrival order. State changes are published on a `watch` channel.

mod state;
pub mod watchdog;

use std::sync::Arc;

use sasverify_core::protocol::{CancelContent, ReadyContent, StartContent};
use sasverify_core::{CancelCode, TransactionRef, VerificationMethod, VerificationStep};
use sasverify_crypto::EphemeralKeySource;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

pub use state::VerificationState;
pub use watchdog::TimeoutPolicy;

use crate::error::{Result, TransportError, VerificationError};
use crate::request::{DeviceIdentity, VerificationRequest};
use crate::sas::SasVerification;
use crate::sas::machine::{SasContext, SasMachine, SasTurn, SasVerdict};
use crate::sas::negotiation::SasSettings;
use crate::transport::StepTransport;
use crate::trust::{TrustStore, VerifiableKey};

/// Methods this engine can run.
pub const SUPPORTED_METHODS: &[VerificationMethod] = &[VerificationMethod::Sas];

/// Collaborators a verification needs.
#[derive(Clone)]
pub struct VerificationDeps {
    pub own: DeviceIdentity,
    pub transport: Arc<dyn StepTransport>,
    pub trust: Arc<dyn TrustStore>,
    pub key_source: Arc<dyn EphemeralKeySource>,
    pub settings: SasSettings,
}

/// Local SAS actions, relayed from [`SasVerification`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SasAction {
    Accept,
    ConfirmMatch,
    NoMatch,
}

impl SasAction {
    const fn name(self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::ConfirmMatch => "confirm",
            Self::NoMatch => "reject",
        }
    }
}

/// Whether a step send was triggered locally or by an inbound step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Local,
    Inbound,
}

pub(crate) struct Shared {
    own: DeviceIdentity,
    request: VerificationRequest,
    transport: Arc<dyn StepTransport>,
    trust: Arc<dyn TrustStore>,
    key_source: Arc<dyn EphemeralKeySource>,
    settings: SasSettings,
    state: watch::Sender<VerificationState>,
    /// Bumped on every inbound step.
    activity: watch::Sender<u64>,
    inner: Mutex<Inner>,
}

struct Inner {
    their_device: Option<String>,
    methods: Vec<VerificationMethod>,
    sas: Option<SasMachine>,
    next_generation: u64,
    own_done: bool,
    their_done: bool,
    /// Own SAS steps were found in history; the SAS state cannot be rebuilt.
    sas_lost: bool,
}

/// Handle on one verification. Cheap to clone.
#[derive(Clone)]
pub struct Verification {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Verification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Verification")
            .field("transaction", &self.shared.request.transaction)
            .field("their_user_id", &self.shared.request.their_user_id)
            .field("state", &self.shared.state.borrow().name())
            .finish()
    }
}

impl Verification {
    /// Create a verification in `OwnRequest` or `TheirRequest`, depending on
    /// who sent `request`.
    pub fn new(request: VerificationRequest, deps: VerificationDeps) -> Self {
        let initial = if request.is_own {
            VerificationState::OwnRequest
        } else {
            VerificationState::TheirRequest
        };
        let their_device = (!request.is_own).then(|| request.content.from_device.clone());
        let methods = request
            .content
            .methods
            .iter()
            .filter(|m| SUPPORTED_METHODS.contains(m))
            .cloned()
            .collect();
        let (state, _) = watch::channel(initial);
        let (activity, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                own: deps.own,
                request,
                transport: deps.transport,
                trust: deps.trust,
                key_source: deps.key_source,
                settings: deps.settings,
                state,
                activity,
                inner: Mutex::new(Inner {
                    their_device,
                    methods,
                    sas: None,
                    next_generation: 1,
                    own_done: false,
                    their_done: false,
                    sas_lost: false,
                }),
            }),
        }
    }

    pub(crate) const fn from_shared(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    pub fn state(&self) -> VerificationState {
        self.shared.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<VerificationState> {
        self.shared.state.subscribe()
    }

    pub fn request(&self) -> &VerificationRequest {
        &self.shared.request
    }

    pub fn transaction(&self) -> &TransactionRef {
        &self.shared.request.transaction
    }

    pub fn their_user_id(&self) -> &str {
        &self.shared.request.their_user_id
    }

    /// Device answering for the counterpart, once known.
    pub async fn their_device_id(&self) -> Option<String> {
        self.shared.inner.lock().await.their_device.clone()
    }

    /// Whether both handles refer to the same verification.
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Wait until the verification reached a terminal state and return it.
    pub async fn finished(&self) -> VerificationState {
        let mut rx = self.subscribe();
        let finished = rx
            .wait_for(VerificationState::is_terminal)
            .await
            .map(|state| state.clone());
        finished.unwrap_or_else(|_| self.state())
    }

    pub(crate) fn activity(&self) -> watch::Receiver<u64> {
        self.shared.activity.subscribe()
    }

    /// Answer their request.
    pub async fn ready(&self) -> Result<()> {
        let mut inner = self.shared.inner.lock().await;
        let state = self.state();
        if !matches!(state, VerificationState::TheirRequest) {
            return Err(invalid_state("ready", &state));
        }
        if inner.methods.is_empty() {
            let requested: Vec<String> = self
                .shared
                .request
                .content
                .methods
                .iter()
                .map(ToString::to_string)
                .collect();
            self.cancel_locked(
                &mut inner,
                CancelContent::new(CancelCode::UnknownMethod, "no supported method requested"),
                Origin::Local,
            )
            .await?;
            return Err(VerificationError::UnsupportedMethod(requested.join(",")));
        }
        let methods = inner.methods.clone();
        self.transition(
            &mut inner,
            VerificationState::Ready {
                methods: methods.clone(),
            },
        );
        self.send(
            VerificationStep::Ready(ReadyContent {
                from_device: self.shared.own.device_id.clone(),
                methods,
            }),
            Origin::Local,
        )
        .await?;
        Ok(())
    }

    /// Start `method` once both sides are ready.
    pub async fn start(&self, method: VerificationMethod) -> Result<()> {
        let mut inner = self.shared.inner.lock().await;
        let state = self.state();
        let VerificationState::Ready { methods } = &state else {
            return Err(invalid_state("start", &state));
        };
        if !methods.contains(&method) {
            return Err(VerificationError::UnsupportedMethod(method.to_string()));
        }
        let Some(ctx) = self.sas_context(&inner) else {
            return Err(invalid_state("start", &state));
        };
        let generation = inner.next_generation;
        inner.next_generation += 1;
        let (machine, start) = SasMachine::own_start(
            generation,
            ctx,
            self.shared.settings.clone(),
            Arc::clone(&self.shared.key_source),
        )?;
        let sas = SasVerification::new(Arc::downgrade(&self.shared), generation, machine.subscribe());
        inner.sas = Some(machine);
        self.transition(
            &mut inner,
            VerificationState::Start {
                method,
                sender_device: self.shared.own.device_id.clone(),
                sas,
            },
        );
        self.send(VerificationStep::Start(start), Origin::Local)
            .await?;
        Ok(())
    }

    /// Cancel from any non-terminal state. A no-op once terminal.
    pub async fn cancel(&self, code: CancelCode, reason: impl Into<String>) -> Result<()> {
        let mut inner = self.shared.inner.lock().await;
        self.cancel_locked(&mut inner, CancelContent::new(code, reason), Origin::Local)
            .await?;
        Ok(())
    }

    /// Cancel without telling the counterpart.
    pub(crate) async fn abort(&self, code: CancelCode, reason: impl Into<String>) {
        let mut inner = self.shared.inner.lock().await;
        if self.shared.state.borrow().is_terminal() {
            return;
        }
        self.transition(
            &mut inner,
            VerificationState::Cancel {
                content: CancelContent::new(code, reason),
                is_our_own: true,
            },
        );
    }

    /// Another of our devices answered the request.
    pub(crate) async fn accepted_by_other_device(&self, device_id: &str) {
        let mut inner = self.shared.inner.lock().await;
        if self.shared.state.borrow().is_terminal() {
            return;
        }
        info!(
            transaction_id = %self.shared.request.transaction,
            device_id,
            "Request answered by another own device"
        );
        self.transition(&mut inner, VerificationState::AcceptedByOtherDevice);
    }

    /// Apply one step received from the counterpart.
    ///
    /// `sender_device` is known for direct messages; conversation steps only
    /// name their device in ready and start.
    pub(crate) async fn handle_step(&self, sender_device: Option<&str>, step: VerificationStep) {
        let mut inner = self.shared.inner.lock().await;
        let state = self.state();
        let transaction_id = &self.shared.request.transaction;
        if state.is_terminal() {
            debug!(%transaction_id, step = step.name(), state = state.name(), "Ignoring step for finished verification");
            return;
        }
        self.shared.activity.send_modify(|n| *n += 1);

        let sender = sender_device.or_else(|| step.from_device());
        if let (Some(expected), Some(sender)) = (inner.their_device.as_deref(), sender)
            && expected != sender
        {
            debug!(%transaction_id, step = step.name(), sender, expected, "Ignoring step from other device");
            return;
        }

        if inner.sas_lost
            && matches!(
                step,
                VerificationStep::Start(_)
                    | VerificationStep::Accept(_)
                    | VerificationStep::Key(_)
                    | VerificationStep::Mac(_)
            )
        {
            debug!(%transaction_id, step = step.name(), "Ignoring SAS step, own SAS state was lost");
            return;
        }

        debug!(%transaction_id, step = step.name(), state = state.name(), "Handling step");
        match (step, &state) {
            (VerificationStep::Cancel(content), _) => {
                let next = if matches!(state, VerificationState::TheirRequest)
                    && content.code == CancelCode::Accepted
                {
                    VerificationState::AcceptedByOtherDevice
                } else {
                    info!(%transaction_id, code = %content.code, reason = %content.reason, "Cancelled by counterpart");
                    VerificationState::Cancel {
                        content,
                        is_our_own: false,
                    }
                };
                self.transition(&mut inner, next);
            }
            (VerificationStep::Ready(ready), VerificationState::OwnRequest) => {
                self.on_ready(&mut inner, ready).await;
            }
            (
                VerificationStep::Start(start),
                VerificationState::OwnRequest | VerificationState::Ready { .. },
            ) => {
                self.on_start(&mut inner, start).await;
            }
            (VerificationStep::Start(start), VerificationState::Start { .. }) => {
                self.on_concurrent_start(&mut inner, &state, start).await;
            }
            (VerificationStep::Accept(accept), VerificationState::Start { .. }) => {
                let turn = match inner.sas.as_mut() {
                    Some(machine) => machine.handle_accept(&accept),
                    None => unexpected_turn("accept", &state),
                };
                let _ = self.apply_turn(&mut inner, turn, Origin::Inbound).await;
            }
            (VerificationStep::Key(key), VerificationState::Start { .. }) => {
                let turn = match inner.sas.as_mut() {
                    Some(machine) => machine.handle_key(&key),
                    None => unexpected_turn("key", &state),
                };
                let _ = self.apply_turn(&mut inner, turn, Origin::Inbound).await;
            }
            (VerificationStep::Mac(content), VerificationState::Start { .. }) => {
                let their_keys = match self.their_keys(&inner).await {
                    Ok(keys) => keys,
                    Err(e) => {
                        let _ = self
                            .cancel_locked(
                                &mut inner,
                                CancelContent::new(CancelCode::User, format!("failed to read keys: {e}")),
                                Origin::Inbound,
                            )
                            .await;
                        return;
                    }
                };
                let turn = match inner.sas.as_mut() {
                    Some(machine) => machine.handle_mac(&content, &their_keys),
                    None => unexpected_turn("mac", &state),
                };
                let _ = self.apply_turn(&mut inner, turn, Origin::Inbound).await;
            }
            (VerificationStep::Done, VerificationState::Start { .. }) => {
                inner.their_done = true;
            }
            (VerificationStep::Done, VerificationState::WaitForDone { .. }) => {
                inner.their_done = true;
                self.transition(&mut inner, VerificationState::Done);
            }
            (VerificationStep::Done, _) if inner.sas_lost => {
                inner.their_done = true;
            }
            (step, _) => {
                let reason = format!("unexpected {} in state {}", step.name(), state.name());
                warn!(%transaction_id, step = step.name(), state = state.name(), "Unexpected step");
                let _ = self
                    .cancel_locked(
                        &mut inner,
                        CancelContent::new(CancelCode::UnexpectedMessage, reason),
                        Origin::Inbound,
                    )
                    .await;
            }
        }
    }

    /// Apply one of our own steps found in the conversation history.
    pub(crate) async fn replay_own_step(&self, step: VerificationStep) {
        let mut inner = self.shared.inner.lock().await;
        let state = self.state();
        if state.is_terminal() {
            return;
        }
        debug!(transaction_id = %self.shared.request.transaction, step = step.name(), "Replaying own step");
        match step {
            VerificationStep::Ready(ready) if matches!(state, VerificationState::TheirRequest) => {
                let methods = intersect(&inner.methods, &ready.methods);
                self.transition(&mut inner, VerificationState::Ready { methods });
            }
            VerificationStep::Start(_)
            | VerificationStep::Accept(_)
            | VerificationStep::Key(_)
            | VerificationStep::Mac(_) => {
                inner.sas_lost = true;
                if let Some(machine) = inner.sas.as_mut() {
                    machine.release();
                }
            }
            VerificationStep::Done => inner.own_done = true,
            VerificationStep::Cancel(content) => {
                self.transition(
                    &mut inner,
                    VerificationState::Cancel {
                        content,
                        is_our_own: true,
                    },
                );
            }
            VerificationStep::Ready(_) => {}
        }
    }

    /// History is fully replayed. Settle what could not be restored.
    pub(crate) async fn finish_replay(&self) {
        let mut inner = self.shared.inner.lock().await;
        if self.shared.state.borrow().is_terminal() || !inner.sas_lost {
            return;
        }
        let next = match (inner.own_done, inner.their_done) {
            (true, true) => VerificationState::Done,
            (true, false) => VerificationState::WaitForDone { is_our_own: true },
            _ => VerificationState::Undefined,
        };
        self.transition(&mut inner, next);
    }

    /// Run a SAS action on behalf of [`SasVerification`].
    pub(crate) async fn sas_action(&self, generation: u64, action: SasAction) -> Result<()> {
        let mut inner = self.shared.inner.lock().await;
        let state = self.state();
        if !matches!(state, VerificationState::Start { .. }) {
            return Err(invalid_state(action.name(), &state));
        }
        if inner.sas.as_ref().map(SasMachine::generation) != Some(generation) {
            return Err(VerificationError::Gone);
        }

        let keys = if action == SasAction::ConfirmMatch {
            let own = self
                .shared
                .trust
                .get_keys(&self.shared.own.user_id, &self.shared.own.device_id)
                .await?;
            Some((own, self.their_keys(&inner).await?))
        } else {
            None
        };

        let Some(machine) = inner.sas.as_mut() else {
            return Err(VerificationError::Gone);
        };
        let turn = match (action, keys) {
            (SasAction::Accept, _) => machine.accept()?,
            (SasAction::NoMatch, _) => machine.no_match()?,
            (SasAction::ConfirmMatch, Some((own, their))) => machine.confirm_match(&own, &their)?,
            (SasAction::ConfirmMatch, None) => return Err(invalid_state(action.name(), &state)),
        };
        self.apply_turn(&mut inner, turn, Origin::Local).await?;
        Ok(())
    }

    async fn on_ready(&self, inner: &mut Inner, ready: ReadyContent) {
        let methods = intersect(&inner.methods, &ready.methods);
        if methods.is_empty() {
            let _ = self
                .cancel_locked(
                    inner,
                    CancelContent::new(CancelCode::UnknownMethod, "no common verification method"),
                    Origin::Inbound,
                )
                .await;
            return;
        }
        self.choose_device(inner, &ready.from_device).await;
        inner.methods.clone_from(&methods);
        self.transition(inner, VerificationState::Ready { methods });
    }

    async fn on_start(
        &self,
        inner: &mut Inner,
        start: StartContent,
    ) {
        if !inner.methods.contains(&start.method) {
            let _ = self
                .cancel_locked(
                    inner,
                    CancelContent::new(
                        CancelCode::UnknownMethod,
                        format!("unsupported method {}", start.method),
                    ),
                    Origin::Inbound,
                )
                .await;
            return;
        }
        if inner.their_device.is_none() {
            self.choose_device(inner, &start.from_device).await;
        }
        self.adopt_their_start(inner, start).await;
    }

    /// Both sides sent a start. The side whose user and device id sort lower
    /// keeps its start; the other adopts it.
    async fn on_concurrent_start(
        &self,
        inner: &mut Inner,
        state: &VerificationState,
        start: StartContent,
    ) {
        let ours_pending = inner
            .sas
            .as_ref()
            .is_some_and(|m| m.we_started() && m.state() == crate::sas::SasState::OwnSasStart);
        if !ours_pending {
            let turn = unexpected_turn("start", state);
            let _ = self.apply_turn(inner, turn, Origin::Inbound).await;
            return;
        }
        let own = (&self.shared.own.user_id, &self.shared.own.device_id);
        let their = (&self.shared.request.their_user_id, &start.from_device);
        if own < their {
            debug!(transaction_id = %self.shared.request.transaction, "Concurrent start, keeping ours");
            return;
        }
        debug!(transaction_id = %self.shared.request.transaction, "Concurrent start, adopting theirs");
        if let Some(mut old) = inner.sas.take() {
            old.release();
        }
        self.adopt_their_start(inner, start).await;
    }

    async fn adopt_their_start(&self, inner: &mut Inner, start: StartContent) {
        let Some(ctx) = self.sas_context(inner) else {
            return;
        };
        let generation = inner.next_generation;
        inner.next_generation += 1;
        let method = start.method.clone();
        let sender_device = start.from_device.clone();
        match SasMachine::their_start(
            generation,
            ctx,
            self.shared.settings.clone(),
            Arc::clone(&self.shared.key_source),
            start,
        ) {
            Ok(machine) => {
                let sas = SasVerification::new(
                    Arc::downgrade(&self.shared),
                    generation,
                    machine.subscribe(),
                );
                inner.sas = Some(machine);
                self.transition(
                    inner,
                    VerificationState::Start {
                        method,
                        sender_device,
                        sas,
                    },
                );
            }
            Err(cancel) => {
                let _ = self.cancel_locked(inner, cancel, Origin::Inbound).await;
            }
        }
    }

    async fn choose_device(&self, inner: &mut Inner, device_id: &str) {
        inner.their_device = Some(device_id.to_string());
        if let Err(e) = self.shared.transport.counterpart_chosen(device_id).await {
            warn!(
                transaction_id = %self.shared.request.transaction,
                device_id,
                error = %e,
                "Failed to notify other devices"
            );
        }
    }

    fn sas_context(&self, inner: &Inner) -> Option<SasContext> {
        let their_device = inner.their_device.clone()?;
        Some(SasContext {
            own: self.shared.own.clone(),
            their: DeviceIdentity::new(self.shared.request.their_user_id.clone(), their_device),
            transaction: self.shared.request.transaction.clone(),
        })
    }

    async fn their_keys(
        &self,
        inner: &Inner,
    ) -> std::result::Result<Vec<VerifiableKey>, crate::error::TrustStoreError> {
        let Some(device) = inner.their_device.as_deref() else {
            return Ok(Vec::new());
        };
        self.shared
            .trust
            .get_keys(&self.shared.request.their_user_id, device)
            .await
    }

    async fn apply_turn(
        &self,
        inner: &mut Inner,
        turn: SasTurn,
        origin: Origin,
    ) -> std::result::Result<(), TransportError> {
        let mut result = Ok(());
        for step in turn.outbound {
            if let Err(e) = self.send(step, origin).await {
                result = Err(e);
            }
        }
        match turn.verdict {
            SasVerdict::Continue => {}
            SasVerdict::Verified(keys) => {
                if let Err(e) = self.on_sas_verified(inner, &keys, origin).await {
                    result = Err(e);
                }
            }
            SasVerdict::Cancel(content) => {
                if let Err(e) = self.cancel_locked(inner, content, origin).await {
                    result = Err(e);
                }
            }
        }
        result
    }

    async fn on_sas_verified(
        &self,
        inner: &mut Inner,
        keys: &[VerifiableKey],
        origin: Origin,
    ) -> std::result::Result<(), TransportError> {
        let transaction_id = &self.shared.request.transaction;
        if let Err(e) = self
            .shared
            .trust
            .set_trusted(&self.shared.request.their_user_id, keys)
            .await
        {
            warn!(%transaction_id, error = %e, "Failed to persist trust");
            return self
                .cancel_locked(
                    inner,
                    CancelContent::new(CancelCode::User, format!("failed to persist trust: {e}")),
                    origin,
                )
                .await;
        }
        info!(%transaction_id, keys = keys.len(), "Counterpart keys verified");
        if let Some(machine) = inner.sas.as_mut() {
            machine.release();
        }
        inner.own_done = true;
        let next = if inner.their_done {
            VerificationState::Done
        } else {
            VerificationState::WaitForDone { is_our_own: true }
        };
        self.transition(inner, next);
        self.send(VerificationStep::Done, origin).await
    }

    async fn cancel_locked(
        &self,
        inner: &mut Inner,
        content: CancelContent,
        origin: Origin,
    ) -> std::result::Result<(), TransportError> {
        if self.shared.state.borrow().is_terminal() {
            return Ok(());
        }
        info!(
            transaction_id = %self.shared.request.transaction,
            code = %content.code,
            reason = %content.reason,
            "Cancelling verification"
        );
        self.transition(
            inner,
            VerificationState::Cancel {
                content: content.clone(),
                is_our_own: true,
            },
        );
        self.send(VerificationStep::Cancel(content), origin).await
    }

    async fn send(
        &self,
        step: VerificationStep,
        origin: Origin,
    ) -> std::result::Result<(), TransportError> {
        let name = step.name();
        let result = self.shared.transport.send_step(step).await;
        if let Err(e) = &result {
            warn!(
                transaction_id = %self.shared.request.transaction,
                step = name,
                local = origin == Origin::Local,
                error = %e,
                "Failed to send step"
            );
        }
        result
    }

    fn transition(&self, inner: &mut Inner, next: VerificationState) {
        info!(
            transaction_id = %self.shared.request.transaction,
            from = self.shared.state.borrow().name(),
            to = next.name(),
            "Verification state changed"
        );
        if next.is_terminal()
            && let Some(machine) = inner.sas.as_mut()
        {
            machine.release();
        }
        self.shared.state.send_replace(next);
    }
}

fn intersect(ours: &[VerificationMethod], theirs: &[VerificationMethod]) -> Vec<VerificationMethod> {
    ours.iter().filter(|m| theirs.contains(m)).cloned().collect()
}

fn invalid_state(action: &'static str, state: &VerificationState) -> VerificationError {
    VerificationError::InvalidState {
        action,
        state: state.name(),
    }
}

fn unexpected_turn(step: &str, state: &VerificationState) -> SasTurn {
    SasTurn {
        outbound: Vec::new(),
        verdict: SasVerdict::Cancel(CancelContent::new(
            CancelCode::UnexpectedMessage,
            format!("unexpected {step} in state {}", state.name()),
        )),
    }
}
