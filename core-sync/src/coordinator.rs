//! # Server Switch Coordinator
//!
//! Changes the active backend server as one compound operation across the
//! cache and the offline queue.
//!
//! ## Workflow
//!
//! 1. Refuse to switch unless the cache schema is current (or the cache is
//!    fresh); an outdated or newer schema aborts before anything is touched
//! 2. Flush the offline queue while the old server is still active
//!    (best effort)
//! 3. Back up the old server's cache entries
//! 4. Selectively clear server-specific categories, keeping preferences,
//!    session autosave and templates
//! 5. Record the new active server and queue a `server_switch` operation for
//!    the settings handler
//!
//! Any failure after the backup exists restores it and reports the error
//! that triggered the rollback.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let coordinator = ServerSwitchCoordinator::new(cache, queue).with_events(bus);
//!
//! let outcome = coordinator.switch_server("ward-a", "ward-b").await?;
//! // Once the new server has synced, the backup is garbage
//! coordinator.discard_backup(&outcome.from_server_id).await?;
//! ```

use crate::error::SwitchError;
use crate::item::{QueueOperation, ServerSwitchRequest};
use crate::queue::OfflineQueue;
use core_async::sync::Mutex;
use core_cache::{CacheCategory, CacheService, SelectiveClearOptions};
use core_runtime::events::{CoreEvent, EventBus, ServerSwitchEvent};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

/// Preferences key holding the [`ActiveServer`] record
pub const ACTIVE_SERVER_KEY: &str = "active_server";

/// Record that was active before switching away from a server, kept with
/// that server's backup
fn pre_switch_key(server_id: &str) -> String {
    format!("{}/before/{}", ACTIVE_SERVER_KEY, server_id)
}

/// Which backend the user is currently attached to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveServer {
    pub server_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_server_id: Option<String>,
}

/// Successful switch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchOutcome {
    pub from_server_id: String,
    pub to_server_id: String,
    /// Storage key of the old server's backup, kept until discarded
    pub backup_key: String,
    /// Items flushed to the old server before switching
    pub flushed: usize,
}

pub struct ServerSwitchCoordinator {
    cache: Arc<CacheService>,
    queue: Arc<OfflineQueue>,
    events: Option<EventBus>,
    switching: Mutex<()>,
}

impl ServerSwitchCoordinator {
    pub fn new(cache: Arc<CacheService>, queue: Arc<OfflineQueue>) -> Self {
        Self {
            cache,
            queue,
            events: None,
            switching: Mutex::new(()),
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Switch from `from_server_id` to `to_server_id`.
    ///
    /// Only one switch runs at a time.
    ///
    /// # Errors
    ///
    /// - [`SwitchError::Invalid`] for empty or identical server ids
    /// - [`SwitchError::MigrationRequired`] / [`SwitchError::UnsupportedVersion`]
    ///   when the cache schema is not current; nothing is modified
    /// - [`SwitchError::RolledBack`] when a step failed after the backup was
    ///   taken, carrying the triggering error and whether the restore worked
    /// - the backup error itself if the backup could not be created
    #[instrument(skip(self))]
    pub async fn switch_server(
        &self,
        from_server_id: &str,
        to_server_id: &str,
    ) -> Result<SwitchOutcome, SwitchError> {
        validate_server_ids(from_server_id, to_server_id)?;
        let _switching = self.switching.lock().await;

        let version = self.cache.validate_cache_version().await;
        if version.is_future_version() {
            return Err(SwitchError::UnsupportedVersion {
                stored: version.stored_version.unwrap_or_default(),
                current: version.current_version,
            });
        }
        if version.migration_needed {
            return Err(SwitchError::MigrationRequired {
                stored: version.stored_version,
                current: version.current_version,
            });
        }

        info!("Starting server switch");
        self.emit(ServerSwitchEvent::Started {
            from_server_id: from_server_id.to_string(),
            to_server_id: to_server_id.to_string(),
        });

        let flushed = self
            .queue
            .process_queue()
            .await
            .iter()
            .filter(|result| result.is_success())
            .count();

        let backup_key = match self.cache.create_server_cache_backup(from_server_id).await {
            Ok(key) => key,
            Err(e) => {
                error!(error = %e, "Failed to back up cache; switch aborted");
                self.emit_rolled_back(from_server_id, to_server_id, &e.to_string());
                return Err(e.into());
            }
        };

        if let Err(e) = self.apply(from_server_id, to_server_id).await {
            error!(error = %e, "Server switch failed; rolling back");
            let restored = self.rollback(from_server_id).await;
            self.emit_rolled_back(from_server_id, to_server_id, &e.to_string());
            return Err(SwitchError::RolledBack {
                source: Box::new(e),
                restored,
            });
        }

        info!(backup_key = %backup_key, flushed = flushed, "Server switch completed");
        self.emit(ServerSwitchEvent::Completed {
            from_server_id: from_server_id.to_string(),
            to_server_id: to_server_id.to_string(),
            backup_key: backup_key.clone(),
        });

        Ok(SwitchOutcome {
            from_server_id: from_server_id.to_string(),
            to_server_id: to_server_id.to_string(),
            backup_key,
            flushed,
        })
    }

    async fn apply(&self, from_server_id: &str, to_server_id: &str) -> Result<(), SwitchError> {
        let pre_switch = pre_switch_key(from_server_id);
        match self.active_server().await {
            Some(current) => {
                self.cache
                    .put(CacheCategory::UserPreferences, &pre_switch, &current)
                    .await?
            }
            None => {
                self.cache
                    .remove(CacheCategory::UserPreferences, &pre_switch)
                    .await?
            }
        }

        self.cache
            .selective_cache_clear(&SelectiveClearOptions::server_switch())
            .await?;

        self.cache
            .put(
                CacheCategory::UserPreferences,
                ACTIVE_SERVER_KEY,
                &ActiveServer {
                    server_id: to_server_id.to_string(),
                    previous_server_id: Some(from_server_id.to_string()),
                },
            )
            .await?;

        self.queue
            .add_to_queue(QueueOperation::ServerSwitch(ServerSwitchRequest {
                from_server_id: from_server_id.to_string(),
                to_server_id: to_server_id.to_string(),
            }))
            .await?;

        Ok(())
    }

    /// Restore the cache backup of `from_server_id` and make it the active
    /// server again.
    ///
    /// Returns `false` if no usable backup could be restored.
    #[instrument(skip(self))]
    pub async fn rollback(&self, from_server_id: &str) -> bool {
        if !self.cache.restore_server_cache_backup(from_server_id).await {
            warn!("No backup restored");
            return false;
        }

        let active = self
            .cache
            .get::<ActiveServer>(CacheCategory::UserPreferences, &pre_switch_key(from_server_id))
            .await
            .ok()
            .flatten()
            .filter(|record| record.server_id == from_server_id)
            .unwrap_or_else(|| ActiveServer {
                server_id: from_server_id.to_string(),
                previous_server_id: None,
            });
        if let Err(e) = self
            .cache
            .put(CacheCategory::UserPreferences, ACTIVE_SERVER_KEY, &active)
            .await
        {
            warn!(error = %e, "Backup restored but active server record not reset");
        }

        info!("Cache restored from backup");
        true
    }

    /// Delete the backup of `server_id` once it is no longer needed.
    pub async fn discard_backup(&self, server_id: &str) -> Result<bool, SwitchError> {
        let deleted = self.cache.delete_server_cache_backup(server_id).await?;
        self.cache
            .remove(CacheCategory::UserPreferences, &pre_switch_key(server_id))
            .await?;
        Ok(deleted)
    }

    /// Currently recorded server, if a switch has ever completed
    pub async fn active_server(&self) -> Option<ActiveServer> {
        self.cache
            .get(CacheCategory::UserPreferences, ACTIVE_SERVER_KEY)
            .await
            .ok()
            .flatten()
    }

    fn emit_rolled_back(&self, from_server_id: &str, to_server_id: &str, reason: &str) {
        self.emit(ServerSwitchEvent::RolledBack {
            from_server_id: from_server_id.to_string(),
            to_server_id: to_server_id.to_string(),
            reason: reason.to_string(),
        });
    }

    fn emit(&self, event: ServerSwitchEvent) {
        if let Some(events) = &self.events {
            let _ = events.emit(CoreEvent::ServerSwitch(event));
        }
    }
}

fn validate_server_ids(from_server_id: &str, to_server_id: &str) -> Result<(), SwitchError> {
    if from_server_id.trim().is_empty() || to_server_id.trim().is_empty() {
        return Err(SwitchError::Invalid("server id must not be empty".to_string()));
    }
    if from_server_id == to_server_id {
        return Err(SwitchError::Invalid(format!(
            "already on server {}",
            from_server_id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pre_switch_record_is_per_server() {
        assert_ne!(pre_switch_key("ward-a"), pre_switch_key("ward-b"));
        assert_ne!(pre_switch_key("ward-a"), ACTIVE_SERVER_KEY);
    }

    #[test]
    fn test_server_ids_validated() {
        assert!(validate_server_ids("ward-a", "ward-b").is_ok());
        assert!(matches!(
            validate_server_ids("ward-a", "ward-a"),
            Err(SwitchError::Invalid(_))
        ));
        assert!(matches!(
            validate_server_ids(" ", "ward-b"),
            Err(SwitchError::Invalid(_))
        ));
    }
}
