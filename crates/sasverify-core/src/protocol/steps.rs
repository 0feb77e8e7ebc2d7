//! Verification steps and the envelopes that carry them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::algorithms::{
    CancelCode, HashAlgorithm, KeyAgreementProtocol, MessageAuthenticationCode,
    ShortAuthenticationString, VerificationMethod,
};

/// Content of a verification request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContent {
    pub from_device: String,
    pub methods: Vec<VerificationMethod>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyContent {
    pub from_device: String,
    pub methods: Vec<VerificationMethod>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartContent {
    pub from_device: String,
    pub method: VerificationMethod,
    #[serde(default)]
    pub hashes: Vec<HashAlgorithm>,
    #[serde(default)]
    pub key_agreement_protocols: Vec<KeyAgreementProtocol>,
    #[serde(default)]
    pub message_authentication_codes: Vec<MessageAuthenticationCode>,
    #[serde(default)]
    pub short_authentication_string: Vec<ShortAuthenticationString>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptContent {
    /// Unpadded base64 SHA-256 over the accepter's public key and the start step.
    pub commitment: String,
    pub hash: HashAlgorithm,
    pub key_agreement_protocol: KeyAgreementProtocol,
    pub message_authentication_code: MessageAuthenticationCode,
    pub short_authentication_string: Vec<ShortAuthenticationString>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyContent {
    /// Unpadded base64 ephemeral public key.
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacContent {
    /// MAC over the sorted, comma separated key ids of `mac`.
    pub keys: String,
    /// Key id to MAC of that key.
    pub mac: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelContent {
    pub code: CancelCode,
    pub reason: String,
}

impl CancelContent {
    pub fn new(code: CancelCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

/// One step of a running verification. The request is not a step; it
/// creates the transaction every step belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content")]
pub enum VerificationStep {
    #[serde(rename = "m.key.verification.ready")]
    Ready(ReadyContent),
    #[serde(rename = "m.key.verification.start")]
    Start(StartContent),
    #[serde(rename = "m.key.verification.accept")]
    Accept(AcceptContent),
    #[serde(rename = "m.key.verification.key")]
    Key(KeyContent),
    #[serde(rename = "m.key.verification.mac")]
    Mac(MacContent),
    #[serde(rename = "m.key.verification.cancel")]
    Cancel(CancelContent),
    #[serde(rename = "m.key.verification.done")]
    Done,
}

impl VerificationStep {
    /// Short name used in logs and cancel reasons.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Ready(_) => "ready",
            Self::Start(_) => "start",
            Self::Accept(_) => "accept",
            Self::Key(_) => "key",
            Self::Mac(_) => "mac",
            Self::Cancel(_) => "cancel",
            Self::Done => "done",
        }
    }

    pub fn cancel(code: CancelCode, reason: impl Into<String>) -> Self {
        Self::Cancel(CancelContent::new(code, reason))
    }

    /// Device id carried in the step itself, if this kind of step has one.
    pub fn from_device(&self) -> Option<&str> {
        match self {
            Self::Ready(ready) => Some(&ready.from_device),
            Self::Start(start) => Some(&start.from_device),
            _ => None,
        }
    }
}

/// Correlation id binding every step to one verification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionRef {
    /// Bare transaction id used by direct device messages.
    Direct(String),
    /// Event id of the request message inside a conversation.
    Conversation(String),
}

impl TransactionRef {
    pub fn id(&self) -> &str {
        match self {
            Self::Direct(id) | Self::Conversation(id) => id,
        }
    }

    /// Add the reference to a serialized step the way it travels on the wire.
    pub fn attach(&self, content: &mut serde_json::Value) {
        let Some(object) = content.as_object_mut() else {
            return;
        };
        match self {
            Self::Direct(id) => {
                object.insert("transaction_id".into(), serde_json::Value::from(id.as_str()));
            }
            Self::Conversation(event_id) => {
                object.insert(
                    "m.relates_to".into(),
                    serde_json::json!({ "rel_type": "m.reference", "event_id": event_id }),
                );
            }
        }
    }
}

impl std::fmt::Display for TransactionRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

/// Body of a direct (device to device) message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DirectBody {
    Step(VerificationStep),
    Request(RequestContent),
}

/// A message exchanged between two devices directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectMessage {
    pub transaction_id: String,
    pub body: DirectBody,
}

impl DirectMessage {
    pub fn step(transaction_id: impl Into<String>, step: VerificationStep) -> Self {
        Self {
            transaction_id: transaction_id.into(),
            body: DirectBody::Step(step),
        }
    }
}

/// A verification message sent into a shared conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationMessage {
    Request {
        /// User the request is addressed to.
        to: String,
        content: RequestContent,
    },
    Step {
        /// Event id of the request this step belongs to.
        relates_to: String,
        step: VerificationStep,
    },
}

/// A message as seen in a conversation's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomEvent {
    pub room_id: String,
    pub event_id: String,
    pub sender: String,
    pub origin_server_ts: u64,
    /// `None` for messages unrelated to verification.
    pub message: Option<ConversationMessage>,
}
