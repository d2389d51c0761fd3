//! Server cache backups
//!
//! A backup copies the raw (still encrypted) envelopes of every
//! server-specific entry, plus their last-sync markers, into one record at
//! `@cache_backup/{scope}/{server_id}`. Restoring writes them back under
//! their original keys with a single batched write.

use crate::error::{CacheError, Result};
use crate::secure_cache::META_NAMESPACE;
use crate::service::{last_sync_name, CacheService};
use crate::types::CacheCategory;
use chrono::{DateTime, Utc};
use core_runtime::events::CacheEvent;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{error, info, instrument, warn};

/// Prefix shared by every server cache backup
pub const BACKUP_KEY_PREFIX: &str = "@cache_backup/";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerCacheBackup {
    pub server_id: String,
    pub created_at: DateTime<Utc>,
    /// Storage key to stored envelope
    pub entries: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupSummary {
    pub server_id: String,
    pub storage_key: String,
    pub created_at: DateTime<Utc>,
    pub entries: usize,
}

pub(crate) fn backup_prefix(scope: &str) -> String {
    format!("{}{}/", BACKUP_KEY_PREFIX, scope)
}

fn validate_server_id(server_id: &str) -> Result<()> {
    if server_id.trim().is_empty() || server_id.contains('/') {
        return Err(CacheError::InvalidKey(format!(
            "invalid server id '{}'",
            server_id
        )));
    }
    Ok(())
}

impl CacheService {
    /// Storage key of the backup for `server_id`
    pub fn backup_key(&self, server_id: &str) -> Result<String> {
        validate_server_id(server_id)?;
        Ok(format!("{}{}", backup_prefix(self.cache.scope()), server_id))
    }

    /// Snapshot every server-specific entry for `server_id`, replacing any
    /// earlier backup for it. Returns the backup's storage key.
    #[instrument(skip(self))]
    pub async fn create_server_cache_backup(&self, server_id: &str) -> Result<String> {
        let backup_key = self.backup_key(server_id)?;
        let _guard = self.maintenance.lock().await;
        let storage = self.cache.storage();

        let mut keys = Vec::new();
        for category in CacheCategory::server_specific() {
            keys.extend(
                storage
                    .keys_with_prefix(&self.cache.namespace_prefix(category.namespace()))
                    .await?,
            );
            keys.push(self.cache.entry_key(META_NAMESPACE, &last_sync_name(category)));
        }

        let entries: BTreeMap<String, String> = storage
            .multi_get(&keys)
            .await?
            .into_iter()
            .filter_map(|(key, value)| value.map(|value| (key, value)))
            .collect();

        let backup = ServerCacheBackup {
            server_id: server_id.to_string(),
            created_at: self.cache.clock().now(),
            entries,
        };
        storage
            .set(&backup_key, &serde_json::to_string(&backup)?)
            .await?;

        info!(entries = backup.entries.len(), "Server cache backup created");
        self.emit(CacheEvent::BackupCreated {
            server_id: server_id.to_string(),
            entries: backup.entries.len(),
        });

        Ok(backup_key)
    }

    /// Replay the backup for `server_id`.
    ///
    /// Returns `false` when no readable backup exists or the write fails.
    #[instrument(skip(self))]
    pub async fn restore_server_cache_backup(&self, server_id: &str) -> bool {
        let backup_key = match self.backup_key(server_id) {
            Ok(key) => key,
            Err(e) => {
                warn!(error = %e, "Cannot restore backup");
                return false;
            }
        };
        let _guard = self.maintenance.lock().await;
        let storage = self.cache.storage();

        let raw = match storage.get(&backup_key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                warn!("No backup found for server");
                return false;
            }
            Err(e) => {
                error!(error = %e, "Failed to read server cache backup");
                return false;
            }
        };

        let backup: ServerCacheBackup = match serde_json::from_str(&raw) {
            Ok(backup) => backup,
            Err(e) => {
                error!(error = %e, "Server cache backup is unreadable");
                return false;
            }
        };

        let pairs: Vec<(String, String)> = backup.entries.into_iter().collect();
        if !pairs.is_empty() {
            if let Err(e) = storage.multi_set(&pairs).await {
                error!(error = %e, "Failed to restore server cache backup");
                return false;
            }
        }

        info!(entries = pairs.len(), "Server cache backup restored");
        self.emit(CacheEvent::BackupRestored {
            server_id: server_id.to_string(),
            entries: pairs.len(),
        });
        true
    }

    /// Returns `true` if a backup was removed.
    pub async fn delete_server_cache_backup(&self, server_id: &str) -> Result<bool> {
        let backup_key = self.backup_key(server_id)?;
        let storage = self.cache.storage();

        if storage.get(&backup_key).await?.is_none() {
            return Ok(false);
        }
        storage.remove(&backup_key).await?;
        info!(server_id = server_id, "Server cache backup deleted");
        Ok(true)
    }

    /// Readable backups for this user, oldest first
    pub async fn list_server_cache_backups(&self) -> Result<Vec<BackupSummary>> {
        let storage = self.cache.storage();
        let keys = storage
            .keys_with_prefix(&backup_prefix(self.cache.scope()))
            .await?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut summaries: Vec<BackupSummary> = storage
            .multi_get(&keys)
            .await?
            .into_iter()
            .filter_map(|(storage_key, raw)| {
                let backup: ServerCacheBackup = match serde_json::from_str(raw.as_deref()?) {
                    Ok(backup) => backup,
                    Err(e) => {
                        warn!(key = %storage_key, error = %e, "Skipping unreadable backup");
                        return None;
                    }
                };
                Some(BackupSummary {
                    server_id: backup.server_id,
                    storage_key,
                    created_at: backup.created_at,
                    entries: backup.entries.len(),
                })
            })
            .collect();

        summaries.sort_by_key(|s| s.created_at);
        Ok(summaries)
    }
}
