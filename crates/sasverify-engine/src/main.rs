//! `sasverify` Demo
//!
//! Runs one interactive verification between two in-memory devices and
//! prints what each side would show the user.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::info;

use sasverify_core::VerificationMethod;
use sasverify_core::config::load_config;
use sasverify_core::tracing_init::init_tracing;
use sasverify_crypto::{EphemeralKeyPair, OsRngKeySource, format_decimals, format_emojis};
use sasverify_engine::loopback::LoopbackNetwork;
use sasverify_engine::{
    Collaborators, DeviceIdentity, MemoryTrustStore, SasState, SasVerification, SystemClock,
    Verification, VerificationService, VerificationState,
};

const ROOM_ID: &str = "!demo:example.org";

#[derive(Parser, Debug)]
#[command(name = "sasverify-demo")]
#[command(version, about = "Interactive SAS verification between two loopback devices")]
struct Args {
    /// Binding to run the verification over.
    #[arg(
        long,
        default_value = "direct",
        env = "SASVERIFY_DEMO_MODE",
        value_parser = ["direct", "conversation"]
    )]
    mode: String,

    /// Let the responder report that the codes differ.
    #[arg(long)]
    mismatch: bool,

    /// Directory holding `.sasverify/settings.json`.
    #[arg(long, env = "SASVERIFY_PROJECT_DIR")]
    project_dir: Option<PathBuf>,

    /// Write the responder's trust store here when done.
    #[arg(long)]
    trust_store: Option<PathBuf>,

    /// Seconds to wait for each protocol step.
    #[arg(long, default_value_t = 10)]
    step_timeout: u64,
}

struct Device {
    identity: DeviceIdentity,
    trust: Arc<MemoryTrustStore>,
    service: VerificationService,
}

#[tokio::main]
#[allow(clippy::print_stdout)]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(args.project_dir.as_deref()).context("Failed to load config")?;
    init_tracing(&config.logging);
    let step_timeout = Duration::from_secs(args.step_timeout);

    // Direct mode verifies a second device of the same user; conversation
    // mode verifies another user inside a shared room.
    let (initiator_id, responder_id) = if args.mode == "direct" {
        (
            DeviceIdentity::new("@alice:example.org", "NEWDEVICE"),
            DeviceIdentity::new("@alice:example.org", "OLDDEVICE"),
        )
    } else {
        (
            DeviceIdentity::new("@alice:example.org", "ALICEDEVICE"),
            DeviceIdentity::new("@bob:example.org", "BOBDEVICE"),
        )
    };

    let network = LoopbackNetwork::new();
    let identity_keys = [
        (initiator_id.clone(), EphemeralKeyPair::generate().public_key_base64()),
        (responder_id.clone(), EphemeralKeyPair::generate().public_key_base64()),
    ];
    let initiator = device(&network, &initiator_id, &identity_keys, &config.verification).await;
    let responder = device(&network, &responder_id, &identity_keys, &config.verification).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    for service in [&initiator.service, &responder.service] {
        service.spawn(shutdown_rx.clone());
    }
    let mut incoming = responder.service.subscribe_incoming();

    let ours = if args.mode == "direct" {
        initiator
            .service
            .create_device_verification(
                &responder.identity.user_id,
                vec![responder.identity.device_id.clone()],
            )
            .await?
    } else {
        initiator
            .service
            .create_user_verification(ROOM_ID, &responder.identity.user_id)
            .await?
    };
    info!(transaction_id = %ours.transaction(), mode = %args.mode, "Request sent");

    let theirs = tokio::time::timeout(step_timeout, incoming.recv())
        .await
        .context("No request arrived")??;
    theirs.ready().await?;

    wait_state(&ours, step_timeout, |s| matches!(s, VerificationState::Ready { .. })).await?;
    ours.start(VerificationMethod::Sas).await?;

    let their_sas = wait_sas(&theirs, step_timeout).await?;
    their_sas.accept().await?;
    let our_sas = wait_sas(&ours, step_timeout).await?;

    let our_code = wait_comparison(&our_sas, step_timeout).await?;
    let their_code = wait_comparison(&their_sas, step_timeout).await?;
    println!("{:<10} {}", initiator.identity.device_id, our_code);
    println!("{:<10} {}", responder.identity.device_id, their_code);

    if args.mismatch {
        their_sas.no_match().await?;
    } else {
        our_sas.confirm_match().await?;
        their_sas.confirm_match().await?;
    }

    let our_end = tokio::time::timeout(step_timeout, ours.finished())
        .await
        .context("Initiator did not finish")?;
    let their_end = tokio::time::timeout(step_timeout, theirs.finished())
        .await
        .context("Responder did not finish")?;
    println!();
    println!("{}: {our_end}", initiator.identity);
    println!("{}: {their_end}", responder.identity);

    for dev in [&initiator, &responder] {
        let other = if dev.identity == initiator.identity {
            &responder.identity
        } else {
            &initiator.identity
        };
        let trusted = dev.trust.trusted_keys(&other.user_id).await;
        println!("{} trusts {:?}", dev.identity, trusted);
    }

    if let Some(path) = &args.trust_store {
        responder
            .trust
            .save(path)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!("Trust store written to {}", path.display());
    }

    let _ = shutdown_tx.send(true);
    Ok(())
}

async fn device(
    network: &LoopbackNetwork,
    identity: &DeviceIdentity,
    identity_keys: &[(DeviceIdentity, String)],
    config: &sasverify_core::config::VerificationConfig,
) -> Device {
    let trust = Arc::new(MemoryTrustStore::new());
    for (known, key) in identity_keys {
        trust
            .add_device_key(&known.user_id, &known.device_id, key)
            .await;
    }
    let endpoint = Arc::new(network.endpoint(identity.clone()));
    let service = VerificationService::new(
        identity.clone(),
        config.clone(),
        Collaborators {
            direct: endpoint.clone(),
            conversation: endpoint,
            trust: trust.clone(),
            key_source: Arc::new(OsRngKeySource),
            clock: Arc::new(SystemClock),
        },
    );
    Device {
        identity: identity.clone(),
        trust,
        service,
    }
}

async fn wait_state(
    verification: &Verification,
    timeout: Duration,
    predicate: impl FnMut(&VerificationState) -> bool,
) -> anyhow::Result<VerificationState> {
    let mut rx = verification.subscribe();
    let state = tokio::time::timeout(timeout, async {
        rx.wait_for(predicate).await.map(|state| state.clone())
    })
    .await
    .context("Timed out waiting for state")??;
    Ok(state)
}

async fn wait_sas(verification: &Verification, timeout: Duration) -> anyhow::Result<SasVerification> {
    let state = wait_state(verification, timeout, |s| s.sas().is_some() || s.is_terminal()).await?;
    state
        .sas()
        .cloned()
        .with_context(|| format!("Verification ended in {state}"))
}

async fn wait_comparison(sas: &SasVerification, timeout: Duration) -> anyhow::Result<String> {
    let mut rx = sas.subscribe();
    let state = tokio::time::timeout(timeout, async {
        rx.wait_for(|s| matches!(s, SasState::ComparisonByUser { .. }))
            .await
            .map(|state| state.clone())
    })
    .await
    .context("Timed out waiting for the short code")??;
    match state {
        SasState::ComparisonByUser { decimals, emojis } => Ok(format!(
            "{}  {}",
            format_decimals(&decimals),
            format_emojis(&emojis)
        )),
        other => anyhow::bail!("unexpected SAS state {other}"),
    }
}
