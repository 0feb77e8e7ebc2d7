//! Verification protocol messages.
//!
//! Transport agnostic shapes of every step; the engine binds them either to
//! direct device messages or to messages inside a conversation.

mod algorithms;
mod canonical;
mod steps;

pub use algorithms::{
    CancelCode, HashAlgorithm, KeyAgreementProtocol, MessageAuthenticationCode,
    ShortAuthenticationString, VerificationMethod,
};
pub use canonical::{canonical_json, canonical_start_json};
pub use steps::{
    AcceptContent, CancelContent, ConversationMessage, DirectBody, DirectMessage, KeyContent,
    MacContent, ReadyContent, RequestContent, RoomEvent, StartContent, TransactionRef,
    VerificationStep,
};
