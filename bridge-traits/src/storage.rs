//! Storage Abstractions
//!
//! Provides platform-agnostic traits for the host's asynchronous key-value
//! store and for secure key material storage, plus in-memory implementations
//! used by tests and development builds.

use async_trait::async_trait;
use core_async::sync::Mutex;
use std::collections::{BTreeMap, HashMap};

use crate::error::{BridgeError, Result};

/// Asynchronous string key-value storage trait
///
/// Abstracts the host's persistent store:
/// - React Native hosts: AsyncStorage
/// - iOS: UserDefaults / file-backed store
/// - Android: SharedPreferences / DataStore
/// - Desktop: SQLite
///
/// Every call may fail. Callers treat failures as transient and must not
/// assume partial multi-key writes were rolled back.
///
/// # Example
///
/// ```ignore
/// use bridge_traits::storage::StorageProvider;
///
/// async fn remember_server(storage: &dyn StorageProvider, id: &str) -> Result<()> {
///     storage.set("active_server", id).await
/// }
/// ```
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Retrieve a value, `Ok(None)` when the key is absent
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store a value, replacing any existing one
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Delete a key. Deleting a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<()>;

    /// List every key currently stored
    async fn get_all_keys(&self) -> Result<Vec<String>>;

    /// Retrieve several values at once, preserving the order of `keys`
    async fn multi_get(&self, keys: &[String]) -> Result<Vec<(String, Option<String>)>> {
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            values.push((key.clone(), self.get(key).await?));
        }
        Ok(values)
    }

    /// Store several values at once
    async fn multi_set(&self, pairs: &[(String, String)]) -> Result<()> {
        for (key, value) in pairs {
            self.set(key, value).await?;
        }
        Ok(())
    }

    /// Delete several keys at once
    async fn multi_remove(&self, keys: &[String]) -> Result<()> {
        for key in keys {
            self.remove(key).await?;
        }
        Ok(())
    }

    /// List keys starting with `prefix`
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .get_all_keys()
            .await?
            .into_iter()
            .filter(|key| key.starts_with(prefix))
            .collect())
    }
}

/// Secure credential storage trait
///
/// Abstracts secure storage mechanisms:
/// - macOS/iOS: Keychain
/// - Android: Keystore (hardware-backed when available)
/// - Windows: DPAPI
/// - Linux: Secret Service / libsecret
///
/// The core only keeps per-user cache encryption keys here.
///
/// # Security Requirements
///
/// Implementations MUST encrypt data at rest and never log secret values.
#[async_trait]
pub trait SecureStore: Send + Sync {
    /// Store a secret value, replacing any previous one
    async fn set_secret(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Retrieve a secret value
    ///
    /// Returns `Ok(None)` if the key doesn't exist.
    async fn get_secret(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Delete a secret
    async fn delete_secret(&self, key: &str) -> Result<()>;

    /// Check if a secret exists without retrieving it
    async fn has_secret(&self, key: &str) -> Result<bool> {
        Ok(self.get_secret(key).await?.is_some())
    }
}

/// In-memory [`StorageProvider`] for tests and development hosts
///
/// Keys are kept ordered so `get_all_keys` is deterministic.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    entries: Mutex<BTreeMap<String, String>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Copy of the raw contents, for assertions
    pub async fn snapshot(&self) -> BTreeMap<String, String> {
        self.entries.lock().await.clone()
    }
}

#[async_trait]
impl StorageProvider for InMemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries
            .lock()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn get_all_keys(&self) -> Result<Vec<String>> {
        Ok(self.entries.lock().await.keys().cloned().collect())
    }

    async fn multi_set(&self, pairs: &[(String, String)]) -> Result<()> {
        let mut entries = self.entries.lock().await;
        for (key, value) in pairs {
            entries.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    async fn multi_remove(&self, keys: &[String]) -> Result<()> {
        let mut entries = self.entries.lock().await;
        for key in keys {
            entries.remove(key);
        }
        Ok(())
    }
}

/// In-memory [`SecureStore`] for tests and development hosts
#[derive(Debug, Default)]
pub struct InMemorySecureStore {
    secrets: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemorySecureStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SecureStore for InMemorySecureStore {
    async fn set_secret(&self, key: &str, value: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(BridgeError::OperationFailed(
                "secret key must not be empty".to_string(),
            ));
        }
        self.secrets
            .lock()
            .await
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn get_secret(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.secrets.lock().await.get(key).cloned())
    }

    async fn delete_secret(&self, key: &str) -> Result<()> {
        self.secrets.lock().await.remove(key);
        Ok(())
    }
}
