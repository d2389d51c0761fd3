//! # Cache Service
//!
//! Category-level cache built on a user's [`SecureCache`]: expiry tracking,
//! selective clearing for server switches, corruption recovery and schema
//! version checks. Backup and restore live in [`crate::backup`].
//!
//! ## Expiry
//!
//! Entries written through [`CacheService::put`] never expire on their own.
//! Freshness is tracked per category with a last-sync marker, so stale
//! reference data stays readable while offline and is refreshed through
//! [`CacheService::refresh_if_expired`] once a connection is available.

use crate::backup::{backup_prefix, ServerCacheBackup};
use crate::error::{CacheError, Result};
use crate::pending_sync::{PendingSyncItem, PendingSyncList};
use crate::secure_cache::{SecureCache, META_NAMESPACE};
use crate::types::{
    CacheCategory, CacheMetadata, CacheStats, CacheVersionStatus, CorruptionReport,
    RefreshOutcome, SelectiveClearOptions, SelectiveClearReport,
};
use bridge_traits::{Clock, SecureStore, StorageProvider};
use chrono::{DateTime, Duration, Utc};
use core_async::sync::Mutex;
use core_runtime::config::CachePolicy;
use core_runtime::events::{CacheEvent, CoreEvent, EventBus};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

pub struct CacheService {
    pub(crate) cache: Arc<SecureCache>,
    pub(crate) policy: CachePolicy,
    pub(crate) events: Option<EventBus>,
    /// Serializes multi-key maintenance (clear, backup, restore, recovery)
    pub(crate) maintenance: Mutex<()>,
    pending: PendingSyncList,
}

impl CacheService {
    pub fn new(cache: Arc<SecureCache>, policy: CachePolicy) -> Self {
        Self {
            pending: PendingSyncList::new(Arc::clone(&cache)),
            cache,
            policy,
            events: None,
            maintenance: Mutex::new(()),
        }
    }

    /// Open the secure cache for `user_id` and wrap it.
    pub async fn open(
        user_id: &str,
        storage: Arc<dyn StorageProvider>,
        secure_store: Arc<dyn SecureStore>,
        clock: Arc<dyn Clock>,
        policy: CachePolicy,
    ) -> Result<Self> {
        let cache = SecureCache::open(user_id, storage, secure_store, clock).await?;
        Ok(Self::new(Arc::new(cache), policy))
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn secure_cache(&self) -> &Arc<SecureCache> {
        &self.cache
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    // ------------------------------------------------------------------
    // Category access
    // ------------------------------------------------------------------

    pub async fn put<T>(&self, category: CacheCategory, key: &str, value: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        ensure_direct_access(category)?;
        self.cache.set(category.namespace(), key, value).await
    }

    /// Read a cached value.
    ///
    /// Unreadable entries and storage failures are logged and reported as a
    /// miss; callers fall back to fetching from the server.
    pub async fn get<T>(&self, category: CacheCategory, key: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        ensure_direct_access(category)?;
        match self.cache.get(category.namespace(), key).await {
            Ok(value) => Ok(value),
            Err(CacheError::InvalidKey(reason)) => Err(CacheError::InvalidKey(reason)),
            Err(e) => {
                warn!(category = %category, error = %e, "Cache read failed; treating as miss");
                Ok(None)
            }
        }
    }

    pub async fn remove(&self, category: CacheCategory, key: &str) -> Result<()> {
        ensure_direct_access(category)?;
        self.cache.remove(category.namespace(), key).await
    }

    pub async fn keys(&self, category: CacheCategory) -> Result<Vec<String>> {
        self.cache.keys(category.namespace()).await
    }

    // ------------------------------------------------------------------
    // Expiry
    // ------------------------------------------------------------------

    /// `true` when more than `ttl` has passed since `timestamp`
    pub fn is_cache_expired(&self, timestamp: DateTime<Utc>, ttl: Duration) -> bool {
        self.cache.clock().now() - timestamp > ttl
    }

    /// TTL applied to a category's last-sync marker
    pub fn ttl_for(&self, _category: CacheCategory) -> Duration {
        self.policy.reference_ttl
    }

    pub async fn last_sync(&self, category: CacheCategory) -> Result<Option<DateTime<Utc>>> {
        self.cache.get_meta_entry(&last_sync_name(category)).await
    }

    /// Stamp `category` as synced now.
    pub async fn mark_synced(&self, category: CacheCategory) -> Result<DateTime<Utc>> {
        let now = self.cache.clock().now();
        self.cache
            .set_meta_entry(&last_sync_name(category), &now)
            .await?;
        Ok(now)
    }

    /// A category that was never synced, or whose marker is unreadable, is
    /// expired.
    pub async fn is_category_expired(&self, category: CacheCategory) -> bool {
        match self.last_sync(category).await {
            Ok(Some(synced_at)) => self.is_cache_expired(synced_at, self.ttl_for(category)),
            Ok(None) => true,
            Err(e) => {
                warn!(category = %category, error = %e, "Unreadable last-sync marker");
                true
            }
        }
    }

    /// Run `refresh` only when `category` has expired; on success the
    /// last-sync marker moves to now.
    #[instrument(skip(self, refresh))]
    pub async fn refresh_if_expired<F, Fut, E>(
        &self,
        category: CacheCategory,
        refresh: F,
    ) -> Result<RefreshOutcome>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<(), E>>,
        E: fmt::Display,
    {
        if !self.is_category_expired(category).await {
            debug!("Cache still fresh; skipping refresh");
            return Ok(RefreshOutcome::Fresh);
        }

        match refresh().await {
            Ok(()) => {
                self.mark_synced(category).await?;
                info!("Cache refreshed");
                Ok(RefreshOutcome::Refreshed)
            }
            Err(e) => {
                warn!(error = %e, "Background refresh failed; keeping stale data");
                Ok(RefreshOutcome::Failed(e.to_string()))
            }
        }
    }

    // ------------------------------------------------------------------
    // Selective clearing
    // ------------------------------------------------------------------

    /// Remove the categories targeted by `options` together with their
    /// last-sync markers. The pending-sync list is never touched.
    #[instrument(skip(self))]
    pub async fn selective_cache_clear(
        &self,
        options: &SelectiveClearOptions,
    ) -> Result<SelectiveClearReport> {
        let _guard = self.maintenance.lock().await;
        self.clear_categories(&options.targets()).await
    }

    pub(crate) async fn clear_categories(
        &self,
        targets: &[CacheCategory],
    ) -> Result<SelectiveClearReport> {
        let storage = self.cache.storage();
        let all_keys = storage.keys_with_prefix(self.cache.prefix()).await?;

        let target_prefixes: Vec<String> = targets
            .iter()
            .map(|c| self.cache.namespace_prefix(c.namespace()))
            .collect();
        let marker_keys: BTreeSet<String> = targets
            .iter()
            .map(|c| self.cache.entry_key(META_NAMESPACE, &last_sync_name(*c)))
            .collect();
        let meta_prefix = self.cache.namespace_prefix(META_NAMESPACE);

        let mut removed_keys = Vec::new();
        let mut preserved = 0;
        for key in all_keys {
            if target_prefixes.iter().any(|p| key.starts_with(p)) || marker_keys.contains(&key) {
                removed_keys.push(key);
            } else if !key.starts_with(&meta_prefix) {
                preserved += 1;
            }
        }

        if !removed_keys.is_empty() {
            storage.multi_remove(&removed_keys).await?;
        }

        info!(
            removed = removed_keys.len(),
            preserved = preserved,
            "Selective cache clear completed"
        );
        self.emit(CacheEvent::SelectiveClear {
            removed: removed_keys.len(),
            preserved,
        });

        Ok(SelectiveClearReport {
            removed_keys,
            preserved,
        })
    }

    // ------------------------------------------------------------------
    // Corruption recovery
    // ------------------------------------------------------------------

    /// Scan every entry of this user, cache and backups, and remove the
    /// ones that no longer decode.
    ///
    /// Never fails; `recovered` is `false` when the scan or the removal
    /// could not complete.
    #[instrument(skip(self))]
    pub async fn recover_from_cache_corruption(&self) -> CorruptionReport {
        let _guard = self.maintenance.lock().await;
        let storage = self.cache.storage();
        let backups = backup_prefix(self.cache.scope());

        let mut keys = match storage.keys_with_prefix(self.cache.prefix()).await {
            Ok(keys) => keys,
            Err(e) => {
                error!(error = %e, "Failed to list cache keys for corruption scan");
                return CorruptionReport::default();
            }
        };
        let mut recovered = true;
        match storage.keys_with_prefix(&backups).await {
            Ok(backup_keys) => keys.extend(backup_keys),
            Err(e) => {
                warn!(error = %e, "Failed to list backups for corruption scan");
                recovered = false;
            }
        }

        if keys.is_empty() {
            return CorruptionReport {
                recovered,
                corrupted_keys: Vec::new(),
            };
        }

        let values = match storage.multi_get(&keys).await {
            Ok(values) => values,
            Err(e) => {
                error!(error = %e, "Failed to read cache entries for corruption scan");
                return CorruptionReport::default();
            }
        };

        let mut corrupted_keys = Vec::new();
        for (key, raw) in values {
            let Some(raw) = raw else { continue };

            let readable = if key.starts_with(&backups) {
                serde_json::from_str::<ServerCacheBackup>(&raw).is_ok()
            } else {
                self.cache.verify_raw(&key, &raw).is_ok()
            };

            if !readable {
                debug!(key = %key, "Corrupted cache entry");
                corrupted_keys.push(key);
            }
        }

        if !corrupted_keys.is_empty() {
            if let Err(e) = storage.multi_remove(&corrupted_keys).await {
                error!(error = %e, "Failed to remove corrupted cache entries");
                recovered = false;
            } else {
                warn!(
                    corrupted = corrupted_keys.len(),
                    "Removed corrupted cache entries"
                );
                self.emit(CacheEvent::CorruptionRecovered {
                    corrupted: corrupted_keys.len(),
                });
            }
        }

        CorruptionReport {
            recovered,
            corrupted_keys,
        }
    }

    // ------------------------------------------------------------------
    // Schema version
    // ------------------------------------------------------------------

    /// Compare the stored schema version against this build's.
    ///
    /// Unreadable metadata counts as absent.
    pub async fn validate_cache_version(&self) -> CacheVersionStatus {
        let stored = match self.cache.get_metadata().await {
            Ok(metadata) => metadata.map(|m| m.schema_version),
            Err(e) => {
                warn!(error = %e, "Unreadable cache metadata; treating as fresh install");
                None
            }
        };
        CacheVersionStatus::evaluate(stored, self.policy.schema_version)
    }

    /// Write metadata for a completed full resync and stamp every synced
    /// category.
    #[instrument(skip(self, record_counts))]
    pub async fn record_full_sync(
        &self,
        record_counts: BTreeMap<String, u64>,
    ) -> Result<CacheMetadata> {
        let metadata = CacheMetadata {
            schema_version: self.policy.schema_version,
            last_sync: self.cache.clock().now(),
            record_counts,
        };
        self.cache.set_metadata(&metadata).await?;

        for category in metadata
            .record_counts
            .keys()
            .filter_map(|ns| CacheCategory::from_namespace(ns))
        {
            self.cache
                .set_meta_entry(&last_sync_name(category), &metadata.last_sync)
                .await?;
        }

        info!(
            schema_version = metadata.schema_version,
            categories = metadata.record_counts.len(),
            "Recorded full sync"
        );
        Ok(metadata)
    }

    /// Bring the stored layout up to the current schema version.
    ///
    /// Server-specific data written under an older (or unreadable) schema is
    /// discarded so the next sync refetches it. A stored version newer than
    /// this build is refused.
    #[instrument(skip(self))]
    pub async fn complete_migration(&self) -> Result<CacheVersionStatus> {
        let _guard = self.maintenance.lock().await;
        let current = self.policy.schema_version;

        let (stored, unreadable, previous_sync) = match self.cache.get_metadata().await {
            Ok(Some(metadata)) => (Some(metadata.schema_version), false, Some(metadata.last_sync)),
            Ok(None) => (None, false, None),
            Err(e) => {
                warn!(error = %e, "Cache metadata unreadable; migrating as outdated");
                (None, true, None)
            }
        };

        let status = CacheVersionStatus::evaluate(stored, current);
        if status.is_future_version() {
            return Err(CacheError::UnsupportedVersion {
                stored: stored.unwrap_or_default(),
                current,
            });
        }
        if status.valid {
            return Ok(status);
        }

        if status.migration_needed || unreadable {
            let targets: Vec<CacheCategory> = CacheCategory::server_specific().collect();
            self.clear_categories(&targets).await?;
        }

        let metadata = CacheMetadata {
            schema_version: current,
            last_sync: previous_sync.unwrap_or_else(|| self.cache.clock().now()),
            record_counts: BTreeMap::new(),
        };
        self.cache.set_metadata(&metadata).await?;

        info!(from_version = ?stored, to_version = current, "Cache migration completed");
        self.emit(CacheEvent::MigrationCompleted {
            from_version: stored,
            to_version: current,
        });

        Ok(CacheVersionStatus::evaluate(Some(current), current))
    }

    // ------------------------------------------------------------------
    // Pending sync
    // ------------------------------------------------------------------

    pub async fn add_pending_sync(
        &self,
        kind: &str,
        data: serde_json::Value,
    ) -> Result<PendingSyncItem> {
        self.pending.add(kind, data).await
    }

    /// Items in insertion order
    pub async fn get_pending_sync(&self) -> Result<Vec<PendingSyncItem>> {
        self.pending.items().await
    }

    pub async fn clear_pending_sync(&self) -> Result<usize> {
        self.pending.clear().await
    }

    // ------------------------------------------------------------------
    // Housekeeping
    // ------------------------------------------------------------------

    /// Remove everything cached for this user, backups included. Key
    /// material is kept so the user can sign in again offline.
    #[instrument(skip(self))]
    pub async fn clear_user_cache(&self) -> Result<usize> {
        let _guard = self.maintenance.lock().await;
        let storage = self.cache.storage();

        let mut removed = self.cache.clear().await?;
        let backups = storage
            .keys_with_prefix(&backup_prefix(self.cache.scope()))
            .await?;
        if !backups.is_empty() {
            storage.multi_remove(&backups).await?;
            removed += backups.len();
        }

        self.emit(CacheEvent::UserCacheCleared { removed });
        Ok(removed)
    }

    pub async fn sweep_expired(&self) -> Result<usize> {
        self.cache.sweep_expired().await
    }

    pub async fn stats(&self) -> Result<CacheStats> {
        let mut entries = BTreeMap::new();
        for category in CacheCategory::ALL {
            entries.insert(category, self.cache.keys(category.namespace()).await?.len());
        }

        let backups = self
            .cache
            .storage()
            .keys_with_prefix(&backup_prefix(self.cache.scope()))
            .await?
            .len();

        Ok(CacheStats {
            entries,
            backups,
            metadata: self.cache.get_metadata().await.ok().flatten(),
        })
    }

    pub(crate) fn emit(&self, event: CacheEvent) {
        if let Some(events) = &self.events {
            let _ = events.emit(CoreEvent::Cache(event));
        }
    }
}

impl fmt::Debug for CacheService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheService")
            .field("cache", &self.cache)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

pub(crate) fn last_sync_name(category: CacheCategory) -> String {
    format!("last_sync/{}", category.namespace())
}

fn ensure_direct_access(category: CacheCategory) -> Result<()> {
    if category == CacheCategory::PendingSync {
        return Err(CacheError::InvalidKey(
            "pending sync entries are managed through the pending sync API".to_string(),
        ));
    }
    Ok(())
}
