//! Verification requests and the identities taking part in them.

use std::time::Duration;

use sasverify_core::TransactionRef;
use sasverify_core::protocol::RequestContent;

/// A user's device.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceIdentity {
    pub user_id: String,
    pub device_id: String,
}

impl DeviceIdentity {
    pub fn new(user_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            device_id: device_id.into(),
        }
    }
}

impl std::fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.user_id, self.device_id)
    }
}

/// The request a verification was created from. Never changes afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationRequest {
    pub content: RequestContent,
    /// Whether this device sent the request.
    pub is_own: bool,
    /// User on the other side of the verification.
    pub their_user_id: String,
    pub transaction: TransactionRef,
}

impl VerificationRequest {
    pub const fn timestamp(&self) -> u64 {
        self.content.timestamp
    }
}

/// Whether a request sent at `timestamp` may still be answered at `now`.
///
/// Requests older than `timeout` or further than `max_future_skew` in the
/// future are stale.
pub fn is_request_active(
    timestamp: u64,
    now: u64,
    timeout: Duration,
    max_future_skew: Duration,
) -> bool {
    let timeout = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
    let skew = u64::try_from(max_future_skew.as_millis()).unwrap_or(u64::MAX);
    if timestamp > now {
        timestamp - now <= skew
    } else {
        now - timestamp < timeout
    }
}
