//! `sasverify` Engine Library
//!
//! Interactive key verification between two devices:
//! - Request / ready / start / done / cancel lifecycle shared by every method
//! - SAS key agreement with decimal and emoji comparison
//! - Direct (device to device) and conversation transport bindings
//! - Registry and service owning the running verifications
//! - Self-verification bootstrap options
//! - In-memory trust store and loopback transports

pub mod clock;
pub mod error;
pub mod lifecycle;
pub mod loopback;
pub mod registry;
pub mod request;
pub mod sas;
pub mod self_verification;
pub mod service;
pub mod transport;
pub mod trust;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Result, TransportError, TrustStoreError, VerificationError};
pub use lifecycle::{TimeoutPolicy, Verification, VerificationDeps, VerificationState};
pub use request::{DeviceIdentity, VerificationRequest};
pub use sas::{SasSettings, SasState, SasVerification};
pub use service::{Collaborators, VerificationService};
pub use trust::{MemoryTrustStore, TrustStore, VerifiableKey};
