//! Per-user key material and storage scopes

use crate::encryption::EncryptionKey;
use crate::error::{CacheError, Result};
use bridge_traits::SecureStore;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info};

const SCOPE_DOMAIN: &[u8] = b"carelink-cache-scope:";

/// Opaque storage scope for a user.
///
/// Raw user ids never appear in storage keys or logs; the scope is a
/// truncated SHA-256 digest of the id.
pub fn user_scope(user_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(SCOPE_DOMAIN);
    hasher.update(user_id.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..16])
}

/// Loads or creates the cache key for a user scope.
pub struct UserKeyProvider {
    secure_store: Arc<dyn SecureStore>,
}

impl UserKeyProvider {
    pub fn new(secure_store: Arc<dyn SecureStore>) -> Self {
        Self { secure_store }
    }

    fn secret_name(scope: &str) -> String {
        format!("cache-key:{}", scope)
    }

    /// Return the existing key for `scope`, generating and persisting one on
    /// first use.
    pub async fn load_or_create(&self, scope: &str) -> Result<EncryptionKey> {
        let name = Self::secret_name(scope);

        let stored = self
            .secure_store
            .get_secret(&name)
            .await
            .map_err(|e| CacheError::KeyMaterial(format!("Failed to read key: {}", e)))?;

        if let Some(bytes) = stored {
            debug!(scope = scope, "Loaded cache key");
            return EncryptionKey::from_bytes(bytes);
        }

        let key = EncryptionKey::generate();
        self.secure_store
            .set_secret(&name, key.as_bytes())
            .await
            .map_err(|e| CacheError::KeyMaterial(format!("Failed to persist key: {}", e)))?;

        info!(scope = scope, "Generated cache key for new user scope");
        Ok(key)
    }

    /// Forget the key for `scope`. Anything still encrypted under it becomes
    /// unreadable.
    pub async fn destroy(&self, scope: &str) -> Result<()> {
        self.secure_store
            .delete_secret(&Self::secret_name(scope))
            .await
            .map_err(|e| CacheError::KeyMaterial(format!("Failed to delete key: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_traits::InMemorySecureStore;

    #[test]
    fn test_user_scope_is_stable_and_opaque() {
        let scope = user_scope("nurse.tanaka");
        assert_eq!(scope, user_scope("nurse.tanaka"));
        assert_ne!(scope, user_scope("nurse.sato"));
        assert_eq!(scope.len(), 32);
        assert!(!scope.contains("tanaka"));
    }

    #[core_async::test]
    async fn test_load_or_create_persists_key() {
        let store = Arc::new(InMemorySecureStore::new());
        let provider = UserKeyProvider::new(store.clone());

        let first = provider.load_or_create("scope-a").await.unwrap();
        let second = provider.load_or_create("scope-a").await.unwrap();
        assert_eq!(first.as_bytes(), second.as_bytes());
        assert!(store.has_secret("cache-key:scope-a").await.unwrap());

        let other = provider.load_or_create("scope-b").await.unwrap();
        assert_ne!(first.as_bytes(), other.as_bytes());
    }

    #[core_async::test]
    async fn test_destroy_forces_new_key() {
        let provider = UserKeyProvider::new(Arc::new(InMemorySecureStore::new()));

        let first = provider.load_or_create("scope-a").await.unwrap();
        provider.destroy("scope-a").await.unwrap();
        let second = provider.load_or_create("scope-a").await.unwrap();
        assert_ne!(first.as_bytes(), second.as_bytes());
    }

    #[core_async::test]
    async fn test_malformed_key_material_is_rejected() {
        let store = Arc::new(InMemorySecureStore::new());
        store.set_secret("cache-key:scope-a", b"short").await.unwrap();

        let provider = UserKeyProvider::new(store);
        assert!(matches!(
            provider.load_or_create("scope-a").await,
            Err(CacheError::KeyMaterial(_))
        ));
    }
}
