//! `sasverify` Core Library
//!
//! Shared functionality for the verification engine:
//! - Protocol step types exchanged between verifying devices
//! - Canonical JSON used for commitments
//! - Configuration resolution and hierarchy
//! - Common error types and tracing setup

pub mod config;
pub mod error;
pub mod protocol;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
pub use protocol::{CancelCode, TransactionRef, VerificationMethod, VerificationStep};
