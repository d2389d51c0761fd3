//! Cache key material in the OS keychain
//!
//! The core keeps exactly one secret per user scope: the AES-256 key that
//! encrypts that user's cache, stored under `cache-key:<scope>`. The keychain
//! entry uses the scope as its account name under a shared service, so a
//! user's key can be inspected or revoked with the platform tooling
//! (Keychain Access, Credential Manager, `secret-tool`).
//!
//! Anything outside that namespace is rejected rather than written to the
//! user's keychain.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bridge_traits::{
    error::{BridgeError, Result},
    storage::SecureStore,
};
use keyring::Entry;
use tracing::{debug, info, warn};

const DEFAULT_SERVICE: &str = "carelink-offline-core";
const CACHE_KEY_NAMESPACE: &str = "cache-key:";
const SCOPE_LEN: usize = 32;
const KEY_MATERIAL_LEN: usize = 32;

/// Keychain-backed store for per-user cache keys
#[derive(Debug, Clone)]
pub struct KeyringSecureStore {
    service: String,
}

impl KeyringSecureStore {
    pub fn new() -> Self {
        Self::with_service_name(DEFAULT_SERVICE)
    }

    /// Separate keychain service, e.g. per deployment or for tests
    pub fn with_service_name(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, name: &str) -> Result<(Entry, String)> {
        let scope = scope_of(name)?.to_string();
        let entry = Entry::new(&self.service, &scope).map_err(keyring_error)?;
        Ok((entry, scope))
    }

    async fn blocking<T, F>(f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        core_async::task::spawn_blocking(f)
            .await
            .map_err(|e| BridgeError::OperationFailed(format!("Keychain task failed: {}", e)))?
    }
}

impl Default for KeyringSecureStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Extract the user scope from a `cache-key:<scope>` secret name.
fn scope_of(name: &str) -> Result<&str> {
    let scope = name.strip_prefix(CACHE_KEY_NAMESPACE).ok_or_else(|| {
        BridgeError::OperationFailed(format!(
            "Secret '{}' is outside the {} namespace",
            name, CACHE_KEY_NAMESPACE
        ))
    })?;

    let well_formed = scope.len() == SCOPE_LEN
        && scope
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
    if !well_formed {
        return Err(BridgeError::OperationFailed(format!(
            "Malformed cache key scope in '{}'",
            name
        )));
    }
    Ok(scope)
}

fn encode_key_material(value: &[u8]) -> Result<String> {
    if value.len() != KEY_MATERIAL_LEN {
        return Err(BridgeError::OperationFailed(format!(
            "Cache key must be {} bytes, got {}",
            KEY_MATERIAL_LEN,
            value.len()
        )));
    }
    Ok(STANDARD.encode(value))
}

/// A keychain entry that no longer decodes to a full key is reported as
/// missing so the cache can provision a fresh one.
fn decode_key_material(scope: &str, stored: &str) -> Option<Vec<u8>> {
    match STANDARD.decode(stored.trim()) {
        Ok(bytes) if bytes.len() == KEY_MATERIAL_LEN => Some(bytes),
        Ok(bytes) => {
            warn!(scope = scope, len = bytes.len(), "Keychain entry has wrong key length");
            None
        }
        Err(e) => {
            warn!(scope = scope, error = %e, "Keychain entry is not valid key material");
            None
        }
    }
}

fn keyring_error(e: keyring::Error) -> BridgeError {
    match e {
        keyring::Error::PlatformFailure(_) | keyring::Error::NoStorageAccess(_) => {
            BridgeError::NotAvailable(format!("Keychain unavailable: {}", e))
        }
        other => BridgeError::OperationFailed(format!("Keychain error: {}", other)),
    }
}

#[async_trait]
impl SecureStore for KeyringSecureStore {
    async fn set_secret(&self, key: &str, value: &[u8]) -> Result<()> {
        let (entry, scope) = self.entry(key)?;
        let encoded = encode_key_material(value)?;

        Self::blocking(move || entry.set_password(&encoded).map_err(keyring_error)).await?;
        info!(scope = %scope, "Stored cache key in keychain");
        Ok(())
    }

    async fn get_secret(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let (entry, scope) = self.entry(key)?;

        let stored = Self::blocking(move || match entry.get_password() {
            Ok(stored) => Ok(Some(stored)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(keyring_error(e)),
        })
        .await?;

        match stored {
            Some(stored) => Ok(decode_key_material(&scope, &stored)),
            None => {
                debug!(scope = %scope, "No cache key in keychain");
                Ok(None)
            }
        }
    }

    async fn delete_secret(&self, key: &str) -> Result<()> {
        let (entry, scope) = self.entry(key)?;

        Self::blocking(move || match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(keyring_error(e)),
        })
        .await?;
        info!(scope = %scope, "Removed cache key from keychain");
        Ok(())
    }
}
