//! Deadline enforcement for a verification.
//!
//! Runs next to the drive loop and cancels with `m.timeout` when the
//! deadline of the binding's policy passes. Ends as soon as the verification
//! reaches a terminal state.

use std::sync::Arc;
use std::time::Duration;

use sasverify_core::CancelCode;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::{Verification, VerificationState};
use crate::clock::Clock;

/// How a binding bounds the lifetime of a verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPolicy {
    /// One deadline, `timeout` after the request was sent, for the whole
    /// lifecycle.
    FixedFromRequest,
    /// `timeout` after the request for the request phase, then `timeout`
    /// of inactivity, re-armed by every inbound step.
    RequestThenInactivity,
}

/// Watch `verification` until it finishes or times out.
pub async fn run(
    verification: Verification,
    policy: TimeoutPolicy,
    timeout: Duration,
    clock: Arc<dyn Clock>,
) {
    let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
    let deadline = verification.request().timestamp().saturating_add(timeout_ms);
    let remaining = Duration::from_millis(deadline.saturating_sub(clock.now_millis()));

    match policy {
        TimeoutPolicy::FixedFromRequest => {
            tokio::select! {
                () = tokio::time::sleep(remaining) => expire(&verification).await,
                () = until(verification.subscribe(), VerificationState::is_terminal) => {}
            }
        }
        TimeoutPolicy::RequestThenInactivity => {
            tokio::select! {
                () = tokio::time::sleep(remaining) => {
                    expire(&verification).await;
                    return;
                }
                () = until(verification.subscribe(), |s| !s.is_request_phase()) => {}
            }

            let mut activity = verification.activity();
            loop {
                if verification.state().is_terminal() {
                    break;
                }
                tokio::select! {
                    () = tokio::time::sleep(timeout) => {
                        expire(&verification).await;
                        break;
                    }
                    changed = activity.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    () = until(verification.subscribe(), VerificationState::is_terminal) => break,
                }
            }
        }
    }
    debug!(transaction_id = %verification.transaction(), "Watchdog finished");
}

async fn until(
    mut state: watch::Receiver<VerificationState>,
    predicate: impl FnMut(&VerificationState) -> bool,
) {
    let _ = state.wait_for(predicate).await;
}

async fn expire(verification: &Verification) {
    if verification.state().is_terminal() {
        return;
    }
    warn!(
        transaction_id = %verification.transaction(),
        state = verification.state().name(),
        "Verification timed out"
    );
    if let Err(e) = verification
        .cancel(CancelCode::Timeout, "verification timed out")
        .await
    {
        debug!(transaction_id = %verification.transaction(), error = %e, "Timeout cancel not delivered");
    }
}
