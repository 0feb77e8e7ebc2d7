//! The SAS key agreement state machine.
//!
//! Synchronous: every input returns the steps to send and a verdict, and the
//! owning lifecycle performs the I/O. Secret material lives in zeroizing
//! types and is dropped by [`SasMachine::release`].

use std::sync::Arc;

use sasverify_core::protocol::{
    AcceptContent, CancelContent, KeyContent, MacContent, StartContent, canonical_start_json,
};
use sasverify_core::{CancelCode, TransactionRef, VerificationStep};
use sasverify_crypto::{
    EphemeralKeyPair, EphemeralKeySource, MacEncoding, SasSecret, ShortCode, commitment,
    verify_commitment,
};
use tokio::sync::watch;
use tracing::debug;

use super::mac;
use super::negotiation::{Negotiated, SasSettings};
use super::state::SasState;
use crate::error::VerificationError;
use crate::request::DeviceIdentity;
use crate::trust::VerifiableKey;

/// Who is talking to whom, and about which transaction.
#[derive(Debug, Clone)]
pub struct SasContext {
    pub own: DeviceIdentity,
    pub their: DeviceIdentity,
    pub transaction: TransactionRef,
}

#[derive(Debug)]
pub enum SasVerdict {
    Continue,
    /// The counterpart's MAC checked out for these keys.
    Verified(Vec<VerifiableKey>),
    Cancel(CancelContent),
}

/// Result of feeding one input into the machine.
#[derive(Debug)]
pub struct SasTurn {
    pub outbound: Vec<VerificationStep>,
    pub verdict: SasVerdict,
}

impl SasTurn {
    const fn idle() -> Self {
        Self {
            outbound: Vec::new(),
            verdict: SasVerdict::Continue,
        }
    }

    fn send(step: VerificationStep) -> Self {
        Self {
            outbound: vec![step],
            verdict: SasVerdict::Continue,
        }
    }

    fn cancel(code: CancelCode, reason: impl Into<String>) -> Self {
        Self {
            outbound: Vec::new(),
            verdict: SasVerdict::Cancel(CancelContent::new(code, reason)),
        }
    }
}

impl From<CancelContent> for SasTurn {
    fn from(content: CancelContent) -> Self {
        Self {
            outbound: Vec::new(),
            verdict: SasVerdict::Cancel(content),
        }
    }
}

pub struct SasMachine {
    generation: u64,
    ctx: SasContext,
    settings: SasSettings,
    key_source: Arc<dyn EphemeralKeySource>,
    we_started: bool,
    canonical_start: String,
    start: StartContent,
    negotiated: Option<Negotiated>,
    their_commitment: Option<String>,
    key_pair: Option<EphemeralKeyPair>,
    secret: Option<SasSecret>,
    pending_mac: Option<MacContent>,
    state: watch::Sender<SasState>,
}

impl std::fmt::Debug for SasMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SasMachine")
            .field("generation", &self.generation)
            .field("transaction", &self.ctx.transaction)
            .field("we_started", &self.we_started)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl SasMachine {
    /// Machine for a start step we are about to send.
    pub fn own_start(
        generation: u64,
        ctx: SasContext,
        settings: SasSettings,
        key_source: Arc<dyn EphemeralKeySource>,
    ) -> Result<(Self, StartContent), VerificationError> {
        let start = settings.start_content(&ctx.own.device_id);
        let canonical_start = canonical_start_json(&start, &ctx.transaction)?;
        let machine = Self::new(
            generation,
            ctx,
            settings,
            key_source,
            true,
            canonical_start,
            start.clone(),
            SasState::OwnSasStart,
        );
        Ok((machine, start))
    }

    /// Machine for a start step the counterpart sent. Refused when no
    /// algorithm set can be agreed on.
    pub fn their_start(
        generation: u64,
        ctx: SasContext,
        settings: SasSettings,
        key_source: Arc<dyn EphemeralKeySource>,
        start: StartContent,
    ) -> Result<Self, CancelContent> {
        if settings.negotiate(&start).is_none() {
            return Err(CancelContent::new(
                CancelCode::UnknownMethod,
                "no common SAS algorithms",
            ));
        }
        let canonical_start = canonical_start_json(&start, &ctx.transaction)
            .map_err(|e| CancelContent::new(CancelCode::InvalidMessage, e.to_string()))?;
        Ok(Self::new(
            generation,
            ctx,
            settings,
            key_source,
            false,
            canonical_start,
            start,
            SasState::TheirSasStart,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn new(
        generation: u64,
        ctx: SasContext,
        settings: SasSettings,
        key_source: Arc<dyn EphemeralKeySource>,
        we_started: bool,
        canonical_start: String,
        start: StartContent,
        initial: SasState,
    ) -> Self {
        let (state, _) = watch::channel(initial);
        Self {
            generation,
            ctx,
            settings,
            key_source,
            we_started,
            canonical_start,
            start,
            negotiated: None,
            their_commitment: None,
            key_pair: None,
            secret: None,
            pending_mac: None,
            state,
        }
    }

    pub const fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> SasState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SasState> {
        self.state.subscribe()
    }

    pub const fn we_started(&self) -> bool {
        self.we_started
    }

    fn set_state(&self, state: SasState) {
        debug!(
            transaction_id = %self.ctx.transaction,
            from = %self.state.borrow().name(),
            to = state.name(),
            "SAS state change"
        );
        self.state.send_replace(state);
    }

    fn invalid_state(&self, action: &'static str) -> VerificationError {
        VerificationError::InvalidState {
            action,
            state: self.state.borrow().name(),
        }
    }

    fn unexpected(&self, step: &str) -> SasTurn {
        SasTurn::cancel(
            CancelCode::UnexpectedMessage,
            format!("unexpected {step} in SAS state {}", self.state.borrow().name()),
        )
    }

    fn generate_key_pair(&mut self) -> Result<String, CancelContent> {
        let pair = self.key_source.generate().map_err(|e| {
            CancelContent::new(CancelCode::User, format!("failed to generate key: {e}"))
        })?;
        let public = pair.public_key_base64();
        self.key_pair = Some(pair);
        Ok(public)
    }

    /// Accept the counterpart's start.
    pub fn accept(&mut self) -> Result<SasTurn, VerificationError> {
        if *self.state.borrow() != SasState::TheirSasStart {
            return Err(self.invalid_state("accept"));
        }
        let Some(negotiated) = self.settings.negotiate(&self.start) else {
            return Ok(SasTurn::cancel(
                CancelCode::UnknownMethod,
                "no common SAS algorithms",
            ));
        };
        let public = match self.generate_key_pair() {
            Ok(public) => public,
            Err(cancel) => return Ok(cancel.into()),
        };
        let accept = negotiated.accept_content(commitment(&public, &self.canonical_start));
        self.negotiated = Some(negotiated);
        self.set_state(SasState::Accept { is_our_own: true });
        Ok(SasTurn::send(VerificationStep::Accept(accept)))
    }

    /// The counterpart accepted our start.
    pub fn handle_accept(&mut self, accept: &AcceptContent) -> SasTurn {
        if *self.state.borrow() != SasState::OwnSasStart {
            return self.unexpected("accept");
        }
        let Some(negotiated) = self.settings.accepted(&self.start, accept) else {
            return SasTurn::cancel(
                CancelCode::UnknownMethod,
                "accept chose algorithms that were not offered",
            );
        };
        self.negotiated = Some(negotiated);
        self.their_commitment = Some(accept.commitment.clone());
        self.set_state(SasState::Accept { is_our_own: false });

        let public = match self.generate_key_pair() {
            Ok(public) => public,
            Err(cancel) => return cancel.into(),
        };
        self.set_state(SasState::WaitForKeys { is_our_own: true });
        SasTurn::send(VerificationStep::Key(KeyContent { key: public }))
    }

    /// The counterpart's ephemeral public key arrived.
    pub fn handle_key(&mut self, key: &KeyContent) -> SasTurn {
        let state = self.state.borrow().clone();
        match state {
            // Starter: their key must match the commitment from their accept.
            SasState::WaitForKeys { is_our_own: true } if self.we_started => {
                let Some(expected) = self.their_commitment.as_deref() else {
                    return self.unexpected("key");
                };
                if !verify_commitment(&key.key, &self.canonical_start, expected) {
                    return SasTurn::cancel(
                        CancelCode::MismatchedCommitment,
                        "key does not match the commitment",
                    );
                }
                match self.derive(&key.key) {
                    Ok(code) => {
                        self.show(&code);
                        SasTurn::idle()
                    }
                    Err(cancel) => cancel.into(),
                }
            }
            // Accepter: answer with our own key.
            SasState::Accept { is_our_own: true } if !self.we_started => {
                let Some(own) = self.key_pair.as_ref().map(EphemeralKeyPair::public_key_base64)
                else {
                    return self.unexpected("key");
                };
                self.set_state(SasState::WaitForKeys { is_our_own: false });
                match self.derive(&key.key) {
                    Ok(code) => {
                        self.show(&code);
                        SasTurn::send(VerificationStep::Key(KeyContent { key: own }))
                    }
                    Err(cancel) => cancel.into(),
                }
            }
            _ => self.unexpected("key"),
        }
    }

    /// The counterpart's MAC arrived. Checked right away if the user already
    /// confirmed, otherwise held until they do.
    pub fn handle_mac(&mut self, content: &MacContent, their_keys: &[VerifiableKey]) -> SasTurn {
        let state = self.state.borrow().clone();
        match state {
            SasState::ComparisonByUser { .. } if self.pending_mac.is_none() => {
                debug!(transaction_id = %self.ctx.transaction, "Holding MAC until user confirms");
                self.pending_mac = Some(content.clone());
                SasTurn::idle()
            }
            SasState::WaitForMacs => SasTurn {
                outbound: Vec::new(),
                verdict: self.check_mac(content, their_keys),
            },
            _ => self.unexpected("mac"),
        }
    }

    /// Whether a MAC step from the counterpart is waiting for confirmation.
    pub const fn has_pending_mac(&self) -> bool {
        self.pending_mac.is_some()
    }

    /// The user saw the same SAS on both devices.
    pub fn confirm_match(
        &mut self,
        own_keys: &[VerifiableKey],
        their_keys: &[VerifiableKey],
    ) -> Result<SasTurn, VerificationError> {
        if !matches!(*self.state.borrow(), SasState::ComparisonByUser { .. }) {
            return Err(self.invalid_state("confirm"));
        }
        let (Some(secret), Some(encoding)) = (self.secret.as_ref(), self.mac_encoding()) else {
            return Err(self.invalid_state("confirm"));
        };
        let info = mac::base_info(&self.ctx.own, &self.ctx.their, self.ctx.transaction.id());
        let content = match mac::create(secret, encoding, &info, own_keys) {
            Ok(content) => content,
            Err(e) => {
                return Ok(SasTurn::cancel(
                    CancelCode::User,
                    format!("failed to calculate MAC: {e}"),
                ));
            }
        };
        self.set_state(SasState::WaitForMacs);

        let verdict = match self.pending_mac.take() {
            Some(pending) => self.check_mac(&pending, their_keys),
            None => SasVerdict::Continue,
        };
        Ok(SasTurn {
            outbound: vec![VerificationStep::Mac(content)],
            verdict,
        })
    }

    /// The user saw different SAS on the two devices.
    pub fn no_match(&mut self) -> Result<SasTurn, VerificationError> {
        if !matches!(*self.state.borrow(), SasState::ComparisonByUser { .. }) {
            return Err(self.invalid_state("reject"));
        }
        Ok(SasTurn::cancel(
            CancelCode::MismatchedSas,
            "short authentication strings do not match",
        ))
    }

    /// Wipe the ephemeral key pair and shared secret.
    pub fn release(&mut self) {
        self.key_pair = None;
        self.secret = None;
        self.pending_mac = None;
    }

    pub const fn is_released(&self) -> bool {
        self.key_pair.is_none() && self.secret.is_none()
    }

    fn mac_encoding(&self) -> Option<MacEncoding> {
        self.negotiated.as_ref().and_then(Negotiated::mac_encoding)
    }

    fn check_mac(&self, content: &MacContent, their_keys: &[VerifiableKey]) -> SasVerdict {
        let (Some(secret), Some(encoding)) = (self.secret.as_ref(), self.mac_encoding()) else {
            return SasVerdict::Cancel(CancelContent::new(
                CancelCode::UnexpectedMessage,
                "MAC before key agreement",
            ));
        };
        let info = mac::base_info(&self.ctx.their, &self.ctx.own, self.ctx.transaction.id());
        match mac::verify(secret, encoding, &info, content, their_keys) {
            Ok(verified) => SasVerdict::Verified(verified),
            Err(failure) => {
                SasVerdict::Cancel(CancelContent::new(CancelCode::KeyMismatch, failure.to_string()))
            }
        }
    }

    fn derive(&mut self, their_key: &str) -> Result<ShortCode, CancelContent> {
        let Some(pair) = self.key_pair.as_ref() else {
            return Err(CancelContent::new(
                CancelCode::UnexpectedMessage,
                "no key pair for this verification",
            ));
        };
        let secret = pair.diffie_hellman(their_key).map_err(|e| {
            CancelContent::new(CancelCode::InvalidMessage, format!("invalid public key: {e}"))
        })?;
        let own_key = pair.public_key_base64();

        let (starter, start_key, accepter, accept_key) = if self.we_started {
            (&self.ctx.own, own_key.as_str(), &self.ctx.their, their_key)
        } else {
            (&self.ctx.their, their_key, &self.ctx.own, own_key.as_str())
        };
        let info = format!(
            "MATRIX_KEY_VERIFICATION_SAS|{}|{}|{}|{}|{}|{}|{}",
            starter.user_id,
            starter.device_id,
            start_key,
            accepter.user_id,
            accepter.device_id,
            accept_key,
            self.ctx.transaction.id()
        );
        let code = secret
            .short_code(&info)
            .map_err(|e| CancelContent::new(CancelCode::User, e.to_string()))?;
        self.secret = Some(secret);
        Ok(code)
    }

    fn show(&self, code: &ShortCode) {
        self.set_state(SasState::ComparisonByUser {
            decimals: code.decimals(),
            emojis: code.emojis(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sasverify_core::protocol::MessageAuthenticationCode;
    use sasverify_crypto::{FixedKeySource, OsRngKeySource};

    fn alice() -> DeviceIdentity {
        DeviceIdentity::new("@alice:x", "ALICE")
    }

    fn bob() -> DeviceIdentity {
        DeviceIdentity::new("@bob:x", "BOB")
    }

    fn ctx(own: DeviceIdentity, their: DeviceIdentity) -> SasContext {
        SasContext {
            own,
            their,
            transaction: TransactionRef::Direct("tx1".into()),
        }
    }

    fn alice_keys() -> Vec<VerifiableKey> {
        vec![VerifiableKey::device("ALICE", "alice-key")]
    }

    fn bob_keys() -> Vec<VerifiableKey> {
        vec![VerifiableKey::device("BOB", "bob-key")]
    }

    fn only_step(turn: SasTurn) -> VerificationStep {
        assert!(matches!(turn.verdict, SasVerdict::Continue), "{turn:?}");
        assert_eq!(turn.outbound.len(), 1);
        turn.outbound.into_iter().next().unwrap()
    }

    /// Alice starts, Bob accepts; runs up to both showing the SAS.
    fn run_to_comparison(
        alice_source: Arc<dyn EphemeralKeySource>,
        bob_source: Arc<dyn EphemeralKeySource>,
    ) -> (SasMachine, SasMachine) {
        let (mut a, start) =
            SasMachine::own_start(1, ctx(alice(), bob()), SasSettings::default(), alice_source)
                .unwrap();
        let mut b = SasMachine::their_start(
            1,
            ctx(bob(), alice()),
            SasSettings::default(),
            bob_source,
            start,
        )
        .unwrap();

        let VerificationStep::Accept(accept) = only_step(b.accept().unwrap()) else {
            panic!("expected accept");
        };
        let VerificationStep::Key(a_key) = only_step(a.handle_accept(&accept)) else {
            panic!("expected key");
        };
        let VerificationStep::Key(b_key) = only_step(b.handle_key(&a_key)) else {
            panic!("expected key");
        };
        assert!(matches!(a.handle_key(&b_key).verdict, SasVerdict::Continue));
        (a, b)
    }

    #[test]
    fn both_sides_show_same_sas() {
        let (a, b) = run_to_comparison(Arc::new(OsRngKeySource), Arc::new(OsRngKeySource));
        assert!(matches!(a.state(), SasState::ComparisonByUser { .. }));
        assert_eq!(a.state(), b.state());
    }

    #[test]
    fn full_run_verifies_both_ways() {
        let (mut a, mut b) = run_to_comparison(Arc::new(OsRngKeySource), Arc::new(OsRngKeySource));

        let a_turn = a.confirm_match(&alice_keys(), &bob_keys()).unwrap();
        assert!(matches!(a_turn.verdict, SasVerdict::Continue));
        let VerificationStep::Mac(a_mac) = &a_turn.outbound[0] else {
            panic!("expected mac");
        };

        // Bob has not confirmed yet, so Alice's MAC is held.
        assert!(matches!(b.handle_mac(a_mac, &alice_keys()).verdict, SasVerdict::Continue));
        assert!(b.has_pending_mac());

        let b_turn = b.confirm_match(&bob_keys(), &alice_keys()).unwrap();
        let SasVerdict::Verified(keys) = b_turn.verdict else {
            panic!("expected verified");
        };
        assert_eq!(keys, alice_keys());

        let VerificationStep::Mac(b_mac) = &b_turn.outbound[0] else {
            panic!("expected mac");
        };
        let SasVerdict::Verified(keys) = a.handle_mac(b_mac, &bob_keys()).verdict else {
            panic!("expected verified");
        };
        assert_eq!(keys, bob_keys());
    }

    #[test]
    fn swapped_key_breaks_commitment() {
        let (mut a, start) = SasMachine::own_start(
            1,
            ctx(alice(), bob()),
            SasSettings::default(),
            Arc::new(OsRngKeySource),
        )
        .unwrap();
        let mut b = SasMachine::their_start(
            1,
            ctx(bob(), alice()),
            SasSettings::default(),
            Arc::new(OsRngKeySource),
            start,
        )
        .unwrap();
        let VerificationStep::Accept(accept) = only_step(b.accept().unwrap()) else {
            panic!("expected accept");
        };
        only_step(a.handle_accept(&accept));

        let attacker = EphemeralKeyPair::generate();
        let turn = a.handle_key(&KeyContent {
            key: attacker.public_key_base64(),
        });
        let SasVerdict::Cancel(cancel) = turn.verdict else {
            panic!("expected cancel");
        };
        assert_eq!(cancel.code, CancelCode::MismatchedCommitment);
    }

    #[test]
    fn fixed_keys_give_fixed_sas() {
        let fixed = |byte: u8| -> Arc<dyn EphemeralKeySource> {
            Arc::new(FixedKeySource::new([[byte; 32]]))
        };
        let (first, _) = run_to_comparison(fixed(5), fixed(6));
        let (second, _) = run_to_comparison(fixed(5), fixed(6));
        assert!(matches!(first.state(), SasState::ComparisonByUser { .. }));
        assert_eq!(first.state(), second.state());
    }

    #[test]
    fn no_match_cancels_with_mismatched_sas() {
        let (mut a, _) = run_to_comparison(Arc::new(OsRngKeySource), Arc::new(OsRngKeySource));
        let SasVerdict::Cancel(cancel) = a.no_match().unwrap().verdict else {
            panic!("expected cancel");
        };
        assert_eq!(cancel.code, CancelCode::MismatchedSas);
    }

    #[test]
    fn unexpected_step_names_state() {
        let (mut a, _) = SasMachine::own_start(
            1,
            ctx(alice(), bob()),
            SasSettings::default(),
            Arc::new(OsRngKeySource),
        )
        .unwrap();
        let turn = a.handle_key(&KeyContent { key: "AAAA".into() });
        let SasVerdict::Cancel(cancel) = turn.verdict else {
            panic!("expected cancel");
        };
        assert_eq!(cancel.code, CancelCode::UnexpectedMessage);
        assert!(cancel.reason.contains("own_sas_start"));
    }

    #[test]
    fn accept_only_from_their_start() {
        let (mut a, _) = SasMachine::own_start(
            1,
            ctx(alice(), bob()),
            SasSettings::default(),
            Arc::new(OsRngKeySource),
        )
        .unwrap();
        assert!(matches!(
            a.accept(),
            Err(VerificationError::InvalidState { action: "accept", .. })
        ));
    }

    #[test]
    fn their_start_without_common_mac_is_refused() {
        let start = StartContent {
            message_authentication_codes: vec![MessageAuthenticationCode::Unknown("x".into())],
            ..SasSettings::default().start_content("ALICE")
        };
        let result = SasMachine::their_start(
            1,
            ctx(bob(), alice()),
            SasSettings::default(),
            Arc::new(OsRngKeySource),
            start,
        );
        assert_eq!(result.unwrap_err().code, CancelCode::UnknownMethod);
    }

    #[test]
    fn release_wipes_material() {
        let (mut a, _) = run_to_comparison(Arc::new(OsRngKeySource), Arc::new(OsRngKeySource));
        assert!(!a.is_released());
        a.release();
        assert!(a.is_released());
        assert!(a.confirm_match(&alice_keys(), &bob_keys()).is_err());
    }
}
