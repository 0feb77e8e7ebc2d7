//! In-memory registry of running verifications.
//!
//! Holds at most one direct verification plus any number of conversation
//! verifications keyed by room and request event id.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::lifecycle::Verification;

/// Outcome of [`VerificationRegistry::insert_direct_if_vacant`].
#[derive(Debug)]
pub enum DirectInsert {
    Inserted,
    /// Another direct verification is running.
    Occupied(Verification),
    /// A verification with the same transaction id is already registered.
    Duplicate(Verification),
}

#[derive(Default)]
struct Slots {
    direct: Option<Verification>,
    conversations: HashMap<(String, String), Verification>,
}

/// Thread-safe registry of active verifications.
#[derive(Clone, Default)]
pub struct VerificationRegistry {
    slots: Arc<RwLock<Slots>>,
}

impl VerificationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The direct verification, unless it already finished.
    pub async fn direct(&self) -> Option<Verification> {
        self.slots
            .read()
            .await
            .direct
            .as_ref()
            .filter(|v| !v.state().is_terminal())
            .cloned()
    }

    /// The direct verification with `transaction_id`, finished or not.
    pub async fn direct_transaction(&self, transaction_id: &str) -> Option<Verification> {
        self.slots
            .read()
            .await
            .direct
            .as_ref()
            .filter(|v| v.transaction().id() == transaction_id)
            .cloned()
    }

    /// Install `verification` as the direct verification and return the one
    /// it displaced, if that one is still running.
    pub async fn replace_direct(&self, verification: Verification) -> Option<Verification> {
        info!(transaction_id = %verification.transaction(), "Direct verification registered");
        let displaced = self.slots.write().await.direct.replace(verification);
        displaced.filter(|v| !v.state().is_terminal())
    }

    /// Install `verification` unless a running direct verification exists.
    pub async fn insert_direct_if_vacant(&self, verification: Verification) -> DirectInsert {
        let mut slots = self.slots.write().await;
        if let Some(existing) = slots.direct.as_ref()
            && !existing.state().is_terminal()
        {
            if existing.transaction() == verification.transaction() {
                return DirectInsert::Duplicate(existing.clone());
            }
            return DirectInsert::Occupied(existing.clone());
        }
        info!(transaction_id = %verification.transaction(), "Direct verification registered");
        slots.direct = Some(verification);
        DirectInsert::Inserted
    }

    pub async fn conversation(&self, room_id: &str, event_id: &str) -> Option<Verification> {
        self.slots
            .read()
            .await
            .conversations
            .get(&(room_id.to_string(), event_id.to_string()))
            .cloned()
    }

    /// Register a conversation verification. Returns the already registered
    /// one instead if the key is taken.
    pub async fn insert_conversation(
        &self,
        room_id: &str,
        verification: Verification,
    ) -> Result<(), Verification> {
        let key = (room_id.to_string(), verification.transaction().id().to_string());
        let mut slots = self.slots.write().await;
        if let Some(existing) = slots.conversations.get(&key) {
            return Err(existing.clone());
        }
        info!(
            transaction_id = %verification.transaction(),
            room_id,
            "Conversation verification registered"
        );
        slots.conversations.insert(key, verification);
        Ok(())
    }

    /// Every registered conversation verification.
    pub async fn conversations(&self) -> Vec<Verification> {
        self.slots
            .read()
            .await
            .conversations
            .values()
            .cloned()
            .collect()
    }

    /// Drop `verification` if it is still the registered instance for its
    /// slot.
    pub async fn remove(&self, verification: &Verification) -> bool {
        let mut slots = self.slots.write().await;
        if slots
            .direct
            .as_ref()
            .is_some_and(|v| v.same_as(verification))
        {
            slots.direct = None;
            debug!(transaction_id = %verification.transaction(), "Direct verification removed");
            return true;
        }
        let before = slots.conversations.len();
        slots.conversations.retain(|_, v| !v.same_as(verification));
        let removed = slots.conversations.len() != before;
        if removed {
            debug!(transaction_id = %verification.transaction(), "Conversation verification removed");
        }
        removed
    }

    /// Count of registered verifications.
    pub async fn len(&self) -> usize {
        let slots = self.slots.read().await;
        usize::from(slots.direct.is_some()) + slots.conversations.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::VerificationDeps;
    use crate::request::{DeviceIdentity, VerificationRequest};
    use crate::sas::SasSettings;
    use crate::transport::StepTransport;
    use crate::trust::MemoryTrustStore;
    use async_trait::async_trait;
    use sasverify_core::protocol::RequestContent;
    use sasverify_core::{CancelCode, TransactionRef, VerificationMethod, VerificationStep};
    use sasverify_crypto::OsRngKeySource;

    struct NullTransport;

    #[async_trait]
    impl StepTransport for NullTransport {
        async fn send_step(
            &self,
            _step: VerificationStep,
        ) -> Result<(), crate::error::TransportError> {
            Ok(())
        }
    }

    fn verification(transaction: TransactionRef) -> Verification {
        let request = VerificationRequest {
            content: RequestContent {
                from_device: "A1".into(),
                methods: vec![VerificationMethod::Sas],
                timestamp: 0,
            },
            is_own: true,
            their_user_id: "@bob:x".into(),
            transaction,
        };
        Verification::new(
            request,
            VerificationDeps {
                own: DeviceIdentity::new("@alice:x", "A1"),
                transport: Arc::new(NullTransport),
                trust: Arc::new(MemoryTrustStore::new()),
                key_source: Arc::new(OsRngKeySource),
                settings: SasSettings::default(),
            },
        )
    }

    #[tokio::test]
    async fn replace_direct_returns_running_predecessor() {
        let registry = VerificationRegistry::new();
        let first = verification(TransactionRef::Direct("t1".into()));
        let second = verification(TransactionRef::Direct("t2".into()));

        assert!(registry.replace_direct(first.clone()).await.is_none());
        let displaced = registry.replace_direct(second.clone()).await.unwrap();
        assert!(displaced.same_as(&first));
        assert!(registry.direct().await.unwrap().same_as(&second));
        assert!(registry.direct_transaction("t1").await.is_none());
        assert!(registry.direct_transaction("t2").await.is_some());
    }

    #[tokio::test]
    async fn finished_direct_is_not_displaced() {
        let registry = VerificationRegistry::new();
        let first = verification(TransactionRef::Direct("t1".into()));
        registry.replace_direct(first.clone()).await;
        first.cancel(CancelCode::User, "done").await.unwrap();

        assert!(registry.direct().await.is_none());
        let second = verification(TransactionRef::Direct("t2".into()));
        assert!(registry.replace_direct(second).await.is_none());
    }

    #[tokio::test]
    async fn insert_if_vacant_refuses_second() {
        let registry = VerificationRegistry::new();
        let first = verification(TransactionRef::Direct("t1".into()));
        let again = verification(TransactionRef::Direct("t1".into()));
        let other = verification(TransactionRef::Direct("t2".into()));

        assert!(matches!(
            registry.insert_direct_if_vacant(first).await,
            DirectInsert::Inserted
        ));
        assert!(matches!(
            registry.insert_direct_if_vacant(again).await,
            DirectInsert::Duplicate(_)
        ));
        assert!(matches!(
            registry.insert_direct_if_vacant(other).await,
            DirectInsert::Occupied(_)
        ));
    }

    #[tokio::test]
    async fn conversation_slots_are_keyed_by_room_and_event() {
        let registry = VerificationRegistry::new();
        let first = verification(TransactionRef::Conversation("$req".into()));
        let clash = verification(TransactionRef::Conversation("$req".into()));

        registry.insert_conversation("!room", first.clone()).await.unwrap();
        assert!(registry.insert_conversation("!room", clash.clone()).await.is_err());
        registry.insert_conversation("!other", clash).await.unwrap();

        assert!(registry.conversation("!room", "$req").await.unwrap().same_as(&first));
        assert_eq!(registry.conversations().await.len(), 2);
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn remove_only_matching_instance() {
        let registry = VerificationRegistry::new();
        let direct = verification(TransactionRef::Direct("t1".into()));
        let stranger = verification(TransactionRef::Direct("t1".into()));
        registry.replace_direct(direct.clone()).await;

        assert!(!registry.remove(&stranger).await);
        assert!(registry.remove(&direct).await);
        assert!(registry.is_empty().await);
    }
}
