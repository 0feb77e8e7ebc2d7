//! Shared fixtures: devices wired to one loopback network.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sasverify_core::VerificationMethod;
use sasverify_core::config::VerificationConfig;
use sasverify_crypto::{EphemeralKeySource, OsRngKeySource, SasEmoji};
use sasverify_engine::loopback::{LoopbackEndpoint, LoopbackNetwork};
use sasverify_engine::{
    Clock, Collaborators, DeviceIdentity, MemoryTrustStore, SasSettings, SasState, SasVerification,
    SystemClock, TrustStore, TrustStoreError, VerifiableKey, Verification, VerificationService,
    VerificationState,
};
use tokio::sync::{broadcast, watch};

pub const WAIT: Duration = Duration::from_secs(5);

pub fn alice() -> DeviceIdentity {
    DeviceIdentity::new("@alice:example.org", "ALICE1")
}

pub fn alice_other() -> DeviceIdentity {
    DeviceIdentity::new("@alice:example.org", "ALICE2")
}

pub fn bob() -> DeviceIdentity {
    DeviceIdentity::new("@bob:example.org", "BOB1")
}

pub fn bob_other() -> DeviceIdentity {
    DeviceIdentity::new("@bob:example.org", "BOB2")
}

/// Identity key every device publishes.
pub fn identity_key(device: &DeviceIdentity) -> String {
    format!("{}-identity-key", device.device_id)
}

pub fn all_devices() -> Vec<DeviceIdentity> {
    vec![alice(), alice_other(), bob(), bob_other()]
}

pub struct Peer {
    pub identity: DeviceIdentity,
    pub store: Arc<MemoryTrustStore>,
    pub endpoint: LoopbackEndpoint,
    pub service: VerificationService,
    pub incoming: broadcast::Receiver<Verification>,
    _shutdown: watch::Sender<bool>,
}

pub struct PeerOptions {
    pub key_source: Arc<dyn EphemeralKeySource>,
    pub clock: Arc<dyn Clock>,
    pub fail_trust_writes: bool,
    /// Trust store writes never complete.
    pub stall_trust_writes: bool,
    /// SAS algorithms to offer and accept instead of the configured ones.
    pub sas_settings: Option<SasSettings>,
}

impl Default for PeerOptions {
    fn default() -> Self {
        Self {
            key_source: Arc::new(OsRngKeySource),
            clock: Arc::new(SystemClock),
            fail_trust_writes: false,
            stall_trust_writes: false,
            sas_settings: None,
        }
    }
}

pub async fn peer(network: &LoopbackNetwork, identity: DeviceIdentity) -> Peer {
    peer_with(network, identity, PeerOptions::default()).await
}

pub async fn peer_with(
    network: &LoopbackNetwork,
    identity: DeviceIdentity,
    options: PeerOptions,
) -> Peer {
    let store = Arc::new(MemoryTrustStore::new());
    for device in all_devices() {
        store
            .add_device_key(&device.user_id, &device.device_id, &identity_key(&device))
            .await;
    }
    let trust: Arc<dyn TrustStore> = if options.fail_trust_writes {
        Arc::new(ReadOnlyTrustStore(Arc::clone(&store)))
    } else if options.stall_trust_writes {
        Arc::new(StallingTrustStore(Arc::clone(&store)))
    } else {
        Arc::clone(&store) as Arc<dyn TrustStore>
    };
    let endpoint = network.endpoint(identity.clone());
    let config = VerificationConfig::default();
    let sas_settings = options
        .sas_settings
        .unwrap_or_else(|| SasSettings::from_config(&config));
    let service = VerificationService::with_sas_settings(
        identity.clone(),
        config,
        sas_settings,
        Collaborators {
            direct: Arc::new(endpoint.clone()),
            conversation: Arc::new(endpoint.clone()),
            trust,
            key_source: options.key_source,
            clock: options.clock,
        },
    );
    let (shutdown, shutdown_rx) = watch::channel(false);
    service.spawn(shutdown_rx);
    let incoming = service.subscribe_incoming();
    Peer {
        identity,
        store,
        endpoint,
        service,
        incoming,
        _shutdown: shutdown,
    }
}

impl Peer {
    /// Next verification created for an incoming request.
    pub async fn next_incoming(&mut self) -> Verification {
        tokio::time::timeout(WAIT, self.incoming.recv())
            .await
            .expect("no incoming request")
            .unwrap()
    }

    pub async fn trusts(&self, device: &DeviceIdentity) -> bool {
        self.store
            .is_trusted(&device.user_id, &format!("ed25519:{}", device.device_id))
            .await
    }
}

/// Trust store whose writes always fail.
struct ReadOnlyTrustStore(Arc<MemoryTrustStore>);

#[async_trait]
impl TrustStore for ReadOnlyTrustStore {
    async fn get_keys(
        &self,
        user_id: &str,
        device_id: &str,
    ) -> Result<Vec<VerifiableKey>, TrustStoreError> {
        self.0.get_keys(user_id, device_id).await
    }

    async fn set_trusted(
        &self,
        _user_id: &str,
        _keys: &[VerifiableKey],
    ) -> Result<(), TrustStoreError> {
        Err(TrustStoreError::Unavailable("read-only".into()))
    }
}

/// Trust store whose writes hang.
struct StallingTrustStore(Arc<MemoryTrustStore>);

#[async_trait]
impl TrustStore for StallingTrustStore {
    async fn get_keys(
        &self,
        user_id: &str,
        device_id: &str,
    ) -> Result<Vec<VerifiableKey>, TrustStoreError> {
        self.0.get_keys(user_id, device_id).await
    }

    async fn set_trusted(
        &self,
        _user_id: &str,
        _keys: &[VerifiableKey],
    ) -> Result<(), TrustStoreError> {
        std::future::pending().await
    }
}

pub async fn wait_state(
    verification: &Verification,
    predicate: impl FnMut(&VerificationState) -> bool,
) -> VerificationState {
    let mut rx = verification.subscribe();
    tokio::time::timeout(WAIT, async {
        rx.wait_for(predicate).await.map(|state| state.clone())
    })
    .await
    .expect("timed out waiting for state")
    .unwrap()
}

pub async fn finished(verification: &Verification) -> VerificationState {
    tokio::time::timeout(WAIT, verification.finished())
        .await
        .expect("verification did not finish")
}

pub async fn wait_sas(verification: &Verification) -> SasVerification {
    let state = wait_state(verification, |s| s.sas().is_some() || s.is_terminal()).await;
    state
        .sas()
        .cloned()
        .unwrap_or_else(|| panic!("verification ended in {state}"))
}

pub async fn wait_comparison(sas: &SasVerification) -> ([u16; 3], [SasEmoji; 7]) {
    let mut rx = sas.subscribe();
    let state = tokio::time::timeout(WAIT, async {
        rx.wait_for(|s| matches!(s, SasState::ComparisonByUser { .. }))
            .await
            .map(|state| state.clone())
    })
    .await
    .expect("timed out waiting for comparison")
    .unwrap();
    match state {
        SasState::ComparisonByUser { decimals, emojis } => (decimals, emojis),
        other => panic!("unexpected SAS state {other}"),
    }
}

/// Ready, start and accept. Returns the SAS handles of requester and
/// responder.
pub async fn start_sas(
    requester: &Verification,
    responder: &Verification,
) -> (SasVerification, SasVerification) {
    responder.ready().await.unwrap();
    wait_state(requester, |s| matches!(s, VerificationState::Ready { .. })).await;
    requester.start(VerificationMethod::Sas).await.unwrap();
    let responder_sas = wait_sas(responder).await;
    responder_sas.accept().await.unwrap();
    let requester_sas = wait_sas(requester).await;
    (requester_sas, responder_sas)
}

pub fn cancel_code(state: &VerificationState) -> sasverify_core::CancelCode {
    state
        .cancel_content()
        .unwrap_or_else(|| panic!("expected cancel, got {state}"))
        .code
        .clone()
}
