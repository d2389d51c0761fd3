//! # Secure Cache
//!
//! Per-user encrypted key/value layer over a [`StorageProvider`].
//!
//! Physical layout, all under the user's opaque scope:
//!
//! ```text
//! @secure_cache/{scope}/{namespace}/{key}      entry envelope
//! @secure_cache/{scope}/__meta__/{name}        metadata and last-sync markers
//! ```
//!
//! Each envelope carries the AES-256-GCM sealed JSON value with the physical
//! key bound as associated data, so two users storing identical plaintext
//! never produce the same ciphertext and a value copied between keys does not
//! decrypt.

use crate::encryption::{CacheEncryptor, EncryptionKey};
use crate::error::{CacheError, Result};
use crate::keys::{user_scope, UserKeyProvider};
use crate::types::{CacheEnvelope, CacheMetadata};
use bridge_traits::{Clock, SecureStore, StorageProvider};
use chrono::Duration;
use serde::{de::DeserializeOwned, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Prefix shared by every secure cache entry in the storage provider
pub const CACHE_KEY_PREFIX: &str = "@secure_cache/";

pub(crate) const META_NAMESPACE: &str = "__meta__";
const METADATA_KEY: &str = "cache_metadata";

pub struct SecureCache {
    scope: String,
    prefix: String,
    storage: Arc<dyn StorageProvider>,
    encryptor: CacheEncryptor,
    clock: Arc<dyn Clock>,
}

impl SecureCache {
    /// Open the cache for `user_id`, creating the user's key on first use.
    pub async fn open(
        user_id: &str,
        storage: Arc<dyn StorageProvider>,
        secure_store: Arc<dyn SecureStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        if user_id.trim().is_empty() {
            return Err(CacheError::InvalidKey("user id must not be empty".to_string()));
        }

        let scope = user_scope(user_id);
        let key = UserKeyProvider::new(secure_store)
            .load_or_create(&scope)
            .await?;

        Ok(Self::from_scope(scope, &key, storage, clock))
    }

    /// Open with explicit key material.
    pub fn with_key(
        user_id: &str,
        key: &EncryptionKey,
        storage: Arc<dyn StorageProvider>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        if user_id.trim().is_empty() {
            return Err(CacheError::InvalidKey("user id must not be empty".to_string()));
        }
        Ok(Self::from_scope(user_scope(user_id), key, storage, clock))
    }

    fn from_scope(
        scope: String,
        key: &EncryptionKey,
        storage: Arc<dyn StorageProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let prefix = format!("{}{}/", CACHE_KEY_PREFIX, scope);
        Self {
            scope,
            prefix,
            storage,
            encryptor: CacheEncryptor::new(key),
            clock,
        }
    }

    /// Opaque scope derived from the user id
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Physical storage key for a logical entry
    pub fn storage_key(&self, namespace: &str, key: &str) -> Result<String> {
        validate_namespace(namespace)?;
        validate_key(key)?;
        Ok(self.entry_key(namespace, key))
    }

    pub async fn set<T>(&self, namespace: &str, key: &str, value: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let storage_key = self.storage_key(namespace, key)?;
        self.write(&storage_key, value, None).await
    }

    /// Store a value that is dropped once `ttl` has elapsed.
    pub async fn set_with_ttl<T>(
        &self,
        namespace: &str,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        if ttl <= Duration::zero() {
            return Err(CacheError::InvalidKey(format!(
                "TTL for {}/{} must be positive",
                namespace, key
            )));
        }
        let storage_key = self.storage_key(namespace, key)?;
        self.write(&storage_key, value, Some(ttl)).await
    }

    /// Read and decrypt an entry.
    ///
    /// Expired entries are removed and reported as absent. An entry that
    /// cannot be decoded yields [`CacheError::Corrupted`].
    pub async fn get<T>(&self, namespace: &str, key: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        let storage_key = self.storage_key(namespace, key)?;
        self.read(&storage_key).await
    }

    pub async fn remove(&self, namespace: &str, key: &str) -> Result<()> {
        let storage_key = self.storage_key(namespace, key)?;
        self.storage.remove(&storage_key).await?;
        Ok(())
    }

    /// Logical keys stored in `namespace`
    pub async fn keys(&self, namespace: &str) -> Result<Vec<String>> {
        validate_namespace(namespace)?;
        let prefix = self.namespace_prefix(namespace);

        let keys = self
            .storage
            .keys_with_prefix(&prefix)
            .await?
            .into_iter()
            .filter_map(|k| k.strip_prefix(&prefix).map(str::to_string))
            .collect();
        Ok(keys)
    }

    pub async fn set_metadata(&self, metadata: &CacheMetadata) -> Result<()> {
        let storage_key = self.entry_key(META_NAMESPACE, METADATA_KEY);
        self.write(&storage_key, metadata, None).await
    }

    pub async fn get_metadata(&self) -> Result<Option<CacheMetadata>> {
        let storage_key = self.entry_key(META_NAMESPACE, METADATA_KEY);
        self.read(&storage_key).await
    }

    /// Remove every entry belonging to this user, metadata included.
    ///
    /// Returns the number of removed entries.
    #[instrument(skip(self), fields(scope = %self.scope))]
    pub async fn clear(&self) -> Result<usize> {
        let keys = self.storage.keys_with_prefix(&self.prefix).await?;
        if keys.is_empty() {
            return Ok(0);
        }

        self.storage.multi_remove(&keys).await?;
        info!(removed = keys.len(), "Cleared user cache");
        Ok(keys.len())
    }

    /// Remove every expired entry for this user.
    ///
    /// Entries whose envelope cannot be parsed are left for corruption
    /// recovery.
    #[instrument(skip(self), fields(scope = %self.scope))]
    pub async fn sweep_expired(&self) -> Result<usize> {
        let keys = self.storage.keys_with_prefix(&self.prefix).await?;
        if keys.is_empty() {
            return Ok(0);
        }

        let now = self.clock.unix_timestamp_millis();
        let expired: Vec<String> = self
            .storage
            .multi_get(&keys)
            .await?
            .into_iter()
            .filter_map(|(key, raw)| {
                let envelope: CacheEnvelope = serde_json::from_str(raw.as_deref()?).ok()?;
                envelope.is_expired(now).then_some(key)
            })
            .collect();

        if !expired.is_empty() {
            self.storage.multi_remove(&expired).await?;
            debug!(removed = expired.len(), "Swept expired cache entries");
        }
        Ok(expired.len())
    }

    // ------------------------------------------------------------------
    // Crate-internal access used by the cache service
    // ------------------------------------------------------------------

    pub(crate) fn storage(&self) -> &Arc<dyn StorageProvider> {
        &self.storage
    }

    pub(crate) fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// `@secure_cache/{scope}/`
    pub(crate) fn prefix(&self) -> &str {
        &self.prefix
    }

    pub(crate) fn namespace_prefix(&self, namespace: &str) -> String {
        format!("{}{}/", self.prefix, namespace)
    }

    pub(crate) fn entry_key(&self, namespace: &str, key: &str) -> String {
        format!("{}{}/{}", self.prefix, namespace, key)
    }

    pub(crate) async fn set_meta_entry<T>(&self, name: &str, value: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let storage_key = self.entry_key(META_NAMESPACE, name);
        self.write(&storage_key, value, None).await
    }

    pub(crate) async fn get_meta_entry<T>(&self, name: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        let storage_key = self.entry_key(META_NAMESPACE, name);
        self.read(&storage_key).await
    }

    /// Check that a raw stored value is a readable entry for `storage_key`.
    pub(crate) fn verify_raw(&self, storage_key: &str, raw: &str) -> Result<()> {
        let plaintext = self.open_envelope(storage_key, raw)?.1;
        serde_json::from_slice::<serde_json::Value>(&plaintext).map_err(|e| {
            CacheError::Corrupted {
                key: storage_key.to_string(),
                reason: format!("invalid JSON payload: {}", e),
            }
        })?;
        Ok(())
    }

    async fn write<T>(&self, storage_key: &str, value: &T, ttl: Option<Duration>) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let plaintext = serde_json::to_vec(value)?;
        let now = self.clock.now();

        let envelope = CacheEnvelope {
            ciphertext: self.encryptor.seal(&plaintext, storage_key.as_bytes())?,
            created_at: now.timestamp_millis(),
            expires_at: ttl.map(|ttl| (now + ttl).timestamp_millis()),
        };

        self.storage
            .set(storage_key, &serde_json::to_string(&envelope)?)
            .await?;
        Ok(())
    }

    async fn read<T>(&self, storage_key: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        let Some(raw) = self.storage.get(storage_key).await? else {
            return Ok(None);
        };

        let (envelope, plaintext) = self
            .open_envelope(storage_key, &raw)
            .inspect_err(|e| warn!(error = %e, "Unreadable cache entry"))?;

        if envelope.is_expired(self.clock.unix_timestamp_millis()) {
            debug!("Dropping expired cache entry");
            self.storage.remove(storage_key).await?;
            return Ok(None);
        }

        serde_json::from_slice(&plaintext)
            .map(Some)
            .map_err(|e| CacheError::Corrupted {
                key: storage_key.to_string(),
                reason: format!("payload does not match requested type: {}", e),
            })
    }

    fn open_envelope(&self, storage_key: &str, raw: &str) -> Result<(CacheEnvelope, Vec<u8>)> {
        let envelope: CacheEnvelope =
            serde_json::from_str(raw).map_err(|e| CacheError::Corrupted {
                key: storage_key.to_string(),
                reason: format!("invalid envelope: {}", e),
            })?;

        let plaintext = self
            .encryptor
            .open(&envelope.ciphertext, storage_key.as_bytes())
            .map_err(|e| CacheError::Corrupted {
                key: storage_key.to_string(),
                reason: e.to_string(),
            })?;

        Ok((envelope, plaintext))
    }
}

impl fmt::Debug for SecureCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureCache")
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

fn validate_namespace(namespace: &str) -> Result<()> {
    if namespace.is_empty() {
        return Err(CacheError::InvalidKey("namespace must not be empty".to_string()));
    }
    if namespace.contains('/') {
        return Err(CacheError::InvalidKey(format!(
            "namespace '{}' must not contain '/'",
            namespace
        )));
    }
    if namespace.starts_with("__") {
        return Err(CacheError::InvalidKey(format!(
            "namespace '{}' is reserved",
            namespace
        )));
    }
    Ok(())
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(CacheError::InvalidKey("key must not be empty".to_string()));
    }
    Ok(())
}
