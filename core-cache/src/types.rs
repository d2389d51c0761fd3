//! Cache data types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Per-user cache bookkeeping, written when a full resync completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheMetadata {
    pub schema_version: u32,
    pub last_sync: DateTime<Utc>,
    pub record_counts: BTreeMap<String, u64>,
}

/// What is physically stored for every cache entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CacheEnvelope {
    pub ciphertext: String,
    /// Unix millis
    pub created_at: i64,
    /// Unix millis, `None` for entries that never expire
    pub expires_at: Option<i64>,
}

impl CacheEnvelope {
    pub fn is_expired(&self, now_millis: i64) -> bool {
        self.expires_at.is_some_and(|expires_at| now_millis >= expires_at)
    }
}

/// Logical cache collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheCategory {
    Patients,
    CarePlans,
    Schedules,
    VitalSigns,
    Templates,
    SessionAutosave,
    UserPreferences,
    PendingSync,
}

impl CacheCategory {
    pub const ALL: [CacheCategory; 8] = [
        CacheCategory::Patients,
        CacheCategory::CarePlans,
        CacheCategory::Schedules,
        CacheCategory::VitalSigns,
        CacheCategory::Templates,
        CacheCategory::SessionAutosave,
        CacheCategory::UserPreferences,
        CacheCategory::PendingSync,
    ];

    /// Storage namespace for this category
    pub fn namespace(&self) -> &'static str {
        match self {
            CacheCategory::Patients => "patients",
            CacheCategory::CarePlans => "care_plans",
            CacheCategory::Schedules => "schedules",
            CacheCategory::VitalSigns => "vital_signs",
            CacheCategory::Templates => "templates",
            CacheCategory::SessionAutosave => "session_autosave",
            CacheCategory::UserPreferences => "user_preferences",
            CacheCategory::PendingSync => "pending_sync",
        }
    }

    pub fn from_namespace(namespace: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|category| category.namespace() == namespace)
    }

    /// Data that belongs to the active backend and must not survive a switch
    pub fn is_server_specific(&self) -> bool {
        matches!(
            self,
            CacheCategory::Patients
                | CacheCategory::CarePlans
                | CacheCategory::Schedules
                | CacheCategory::VitalSigns
        )
    }

    pub fn server_specific() -> impl Iterator<Item = CacheCategory> {
        Self::ALL.into_iter().filter(|c| c.is_server_specific())
    }
}

impl fmt::Display for CacheCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.namespace())
    }
}

/// Options for [`CacheService::selective_cache_clear`](crate::CacheService::selective_cache_clear)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectiveClearOptions {
    /// Only consider server-specific categories
    pub server_specific_only: bool,
    /// Categories that must survive the clear
    pub preserve: Vec<CacheCategory>,
}

impl SelectiveClearOptions {
    /// Options used when the active server changes
    pub fn server_switch() -> Self {
        Self {
            server_specific_only: true,
            preserve: vec![
                CacheCategory::UserPreferences,
                CacheCategory::SessionAutosave,
                CacheCategory::Templates,
            ],
        }
    }

    /// Categories targeted by these options. The pending-sync list is never
    /// targeted.
    pub fn targets(&self) -> Vec<CacheCategory> {
        CacheCategory::ALL
            .into_iter()
            .filter(|c| *c != CacheCategory::PendingSync)
            .filter(|c| !self.server_specific_only || c.is_server_specific())
            .filter(|c| !self.preserve.contains(c))
            .collect()
    }
}

impl Default for SelectiveClearOptions {
    fn default() -> Self {
        Self::server_switch()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectiveClearReport {
    /// Removed storage keys
    pub removed_keys: Vec<String>,
    /// Number of entries left in place
    pub preserved: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CorruptionReport {
    /// `true` when the scan ran to completion and every corrupt key was removed
    pub recovered: bool,
    pub corrupted_keys: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheVersionStatus {
    pub valid: bool,
    pub migration_needed: bool,
    pub stored_version: Option<u32>,
    pub current_version: u32,
}

impl CacheVersionStatus {
    pub fn evaluate(stored_version: Option<u32>, current_version: u32) -> Self {
        let (valid, migration_needed) = match stored_version {
            None => (false, false),
            Some(stored) if stored == current_version => (true, false),
            Some(stored) if stored < current_version => (false, true),
            Some(_) => (false, false),
        };

        Self {
            valid,
            migration_needed,
            stored_version,
            current_version,
        }
    }

    /// Stored layout is newer than this build understands
    pub fn is_future_version(&self) -> bool {
        self.stored_version
            .is_some_and(|stored| stored > self.current_version)
    }
}

/// Outcome of [`CacheService::refresh_if_expired`](crate::CacheService::refresh_if_expired)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Last sync is still within the TTL; the callback was not invoked
    Fresh,
    /// Callback succeeded and the last-sync time was updated
    Refreshed,
    /// Callback failed; last-sync time unchanged
    Failed(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: BTreeMap<CacheCategory, usize>,
    pub backups: usize,
    pub metadata: Option<CacheMetadata>,
}

impl CacheStats {
    pub fn total_entries(&self) -> usize {
        self.entries.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_status_cases() {
        let fresh = CacheVersionStatus::evaluate(None, 1);
        assert!(!fresh.valid && !fresh.migration_needed);

        let same = CacheVersionStatus::evaluate(Some(1), 1);
        assert!(same.valid && !same.migration_needed);

        let older = CacheVersionStatus::evaluate(Some(1), 2);
        assert!(!older.valid && older.migration_needed);

        let newer = CacheVersionStatus::evaluate(Some(3), 2);
        assert!(!newer.valid && !newer.migration_needed);
        assert!(newer.is_future_version());
    }

    #[test]
    fn test_server_switch_targets() {
        let targets = SelectiveClearOptions::server_switch().targets();
        assert_eq!(
            targets,
            vec![
                CacheCategory::Patients,
                CacheCategory::CarePlans,
                CacheCategory::Schedules,
                CacheCategory::VitalSigns,
            ]
        );
    }

    #[test]
    fn test_full_clear_still_keeps_pending_sync_and_preserved() {
        let options = SelectiveClearOptions {
            server_specific_only: false,
            preserve: vec![CacheCategory::UserPreferences],
        };
        let targets = options.targets();

        assert!(targets.contains(&CacheCategory::Templates));
        assert!(!targets.contains(&CacheCategory::UserPreferences));
        assert!(!targets.contains(&CacheCategory::PendingSync));
    }

    #[test]
    fn test_namespace_lookup() {
        for category in CacheCategory::ALL {
            assert_eq!(CacheCategory::from_namespace(category.namespace()), Some(category));
        }
        assert_eq!(CacheCategory::from_namespace("unknown"), None);
    }

    #[test]
    fn test_envelope_expiry() {
        let envelope = CacheEnvelope {
            ciphertext: String::new(),
            created_at: 0,
            expires_at: Some(1_000),
        };
        assert!(!envelope.is_expired(999));
        assert!(envelope.is_expired(1_000));
    }
}
