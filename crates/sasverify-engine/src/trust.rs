//! Keys that can be verified and the store recording trust in them.
//!
//! A successful SAS run is the only thing that marks keys trusted. The
//! engine asks the store for the keys it knows of a device, MACs or checks
//! them, and hands the verified ones back.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::TrustStoreError;

/// What kind of key a [`VerifiableKey`] is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyKind {
    /// Identity key of a single device.
    Device,
    /// Cross-signing master key of a user. The store may countersign the
    /// rest of the user's keys once this one is trusted.
    CrossSigningMaster,
}

/// A public key as it takes part in the MAC exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiableKey {
    /// Algorithm-prefixed id, e.g. `ed25519:DEVICEID`.
    pub key_id: String,
    /// Unpadded base64 public key.
    pub value: String,
    pub kind: KeyKind,
}

impl VerifiableKey {
    pub fn device(device_id: &str, value: impl Into<String>) -> Self {
        Self {
            key_id: format!("ed25519:{device_id}"),
            value: value.into(),
            kind: KeyKind::Device,
        }
    }

    pub fn master(value: impl Into<String>) -> Self {
        let value = value.into();
        Self {
            key_id: format!("ed25519:{value}"),
            value,
            kind: KeyKind::CrossSigningMaster,
        }
    }
}

/// Persistent key and trust records, consumed by the engine.
#[async_trait]
pub trait TrustStore: Send + Sync {
    /// Keys of `device_id` plus the user's cross-signing master key, if known.
    async fn get_keys(
        &self,
        user_id: &str,
        device_id: &str,
    ) -> Result<Vec<VerifiableKey>, TrustStoreError>;

    /// Mark keys of `user_id` as verified.
    async fn set_trusted(
        &self,
        user_id: &str,
        keys: &[VerifiableKey],
    ) -> Result<(), TrustStoreError>;
}

/// A stored key with its trust flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnownKey {
    pub key: VerifiableKey,
    /// Owning device, `None` for user level keys.
    pub device_id: Option<String>,
    pub trusted: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreData {
    /// user id -> key id -> key
    users: BTreeMap<String, BTreeMap<String, KnownKey>>,
}

/// In-memory trust store, optionally backed by a JSON file.
#[derive(Debug, Default)]
pub struct MemoryTrustStore {
    data: RwLock<StoreData>,
}

impl MemoryTrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the store from a JSON file. Returns an empty store if the file
    /// doesn't exist.
    pub fn load(path: &Path) -> Result<Self, TrustStoreError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let data: StoreData = serde_json::from_str(&raw)?;
        Ok(Self {
            data: RwLock::new(data),
        })
    }

    /// Save the store to a JSON file.
    pub async fn save(&self, path: &Path) -> Result<(), TrustStoreError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let json = serde_json::to_string_pretty(&*self.data.read().await)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Record the identity key of a device.
    pub async fn add_device_key(&self, user_id: &str, device_id: &str, value: &str) {
        let key = VerifiableKey::device(device_id, value);
        self.insert(user_id, Some(device_id.to_string()), key).await;
    }

    /// Record the cross-signing master key of a user.
    pub async fn set_master_key(&self, user_id: &str, value: &str) {
        self.insert(user_id, None, VerifiableKey::master(value)).await;
    }

    async fn insert(&self, user_id: &str, device_id: Option<String>, key: VerifiableKey) {
        let mut data = self.data.write().await;
        data.users.entry(user_id.to_string()).or_default().insert(
            key.key_id.clone(),
            KnownKey {
                key,
                device_id,
                trusted: false,
            },
        );
    }

    pub async fn is_trusted(&self, user_id: &str, key_id: &str) -> bool {
        self.data
            .read()
            .await
            .users
            .get(user_id)
            .and_then(|keys| keys.get(key_id))
            .is_some_and(|known| known.trusted)
    }

    /// Ids of every trusted key of `user_id`.
    pub async fn trusted_keys(&self, user_id: &str) -> Vec<String> {
        self.data
            .read()
            .await
            .users
            .get(user_id)
            .map(|keys| {
                keys.values()
                    .filter(|known| known.trusted)
                    .map(|known| known.key.key_id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl TrustStore for MemoryTrustStore {
    async fn get_keys(
        &self,
        user_id: &str,
        device_id: &str,
    ) -> Result<Vec<VerifiableKey>, TrustStoreError> {
        let data = self.data.read().await;
        Ok(data
            .users
            .get(user_id)
            .map(|keys| {
                keys.values()
                    .filter(|known| match known.key.kind {
                        KeyKind::Device => known.device_id.as_deref() == Some(device_id),
                        KeyKind::CrossSigningMaster => true,
                    })
                    .map(|known| known.key.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn set_trusted(
        &self,
        user_id: &str,
        keys: &[VerifiableKey],
    ) -> Result<(), TrustStoreError> {
        let mut data = self.data.write().await;
        let known = data.users.get_mut(user_id);
        let Some(known) = known else {
            return Err(TrustStoreError::UnknownKey {
                user_id: user_id.to_string(),
                key_id: keys.first().map(|k| k.key_id.clone()).unwrap_or_default(),
            });
        };
        if let Some(unknown) = keys.iter().find(|key| {
            known
                .get(&key.key_id)
                .is_none_or(|entry| entry.key.value != key.value)
        }) {
            return Err(TrustStoreError::UnknownKey {
                user_id: user_id.to_string(),
                key_id: unknown.key_id.clone(),
            });
        }
        for key in keys {
            if let Some(entry) = known.get_mut(&key.key_id) {
                entry.trusted = true;
            }
        }
        tracing::info!(user_id, count = keys.len(), "Keys marked trusted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_keys_returns_device_and_master() {
        let store = MemoryTrustStore::new();
        store.add_device_key("@bob:x", "BOB1", "k1").await;
        store.add_device_key("@bob:x", "BOB2", "k2").await;
        store.set_master_key("@bob:x", "master").await;

        let keys = store.get_keys("@bob:x", "BOB1").await.unwrap();
        let ids: Vec<_> = keys.iter().map(|k| k.key_id.as_str()).collect();
        assert_eq!(ids, vec!["ed25519:BOB1", "ed25519:master"]);
    }

    #[tokio::test]
    async fn set_trusted_marks_keys() {
        let store = MemoryTrustStore::new();
        store.add_device_key("@bob:x", "BOB1", "k1").await;
        let keys = store.get_keys("@bob:x", "BOB1").await.unwrap();

        assert!(!store.is_trusted("@bob:x", "ed25519:BOB1").await);
        store.set_trusted("@bob:x", &keys).await.unwrap();
        assert!(store.is_trusted("@bob:x", "ed25519:BOB1").await);
        assert_eq!(store.trusted_keys("@bob:x").await, vec!["ed25519:BOB1"]);
    }

    #[tokio::test]
    async fn set_trusted_rejects_changed_value() {
        let store = MemoryTrustStore::new();
        store.add_device_key("@bob:x", "BOB1", "k1").await;
        let forged = VerifiableKey::device("BOB1", "other");

        let result = store.set_trusted("@bob:x", &[forged]).await;
        assert!(matches!(result, Err(TrustStoreError::UnknownKey { .. })));
        assert!(!store.is_trusted("@bob:x", "ed25519:BOB1").await);
    }

    #[tokio::test]
    async fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("trust.json");

        let store = MemoryTrustStore::new();
        store.add_device_key("@bob:x", "BOB1", "k1").await;
        let keys = store.get_keys("@bob:x", "BOB1").await.unwrap();
        store.set_trusted("@bob:x", &keys).await.unwrap();
        store.save(&path).await.unwrap();

        let loaded = MemoryTrustStore::load(&path).unwrap();
        assert!(loaded.is_trusted("@bob:x", "ed25519:BOB1").await);
    }

    #[test]
    fn load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryTrustStore::load(&dir.path().join("absent.json")).unwrap();
        assert!(store.data.try_read().unwrap().users.is_empty());
    }
}
