//! # Core Cache
//!
//! Per-user encrypted cache for the offline synchronization core.
//!
//! - [`SecureCache`]: AES-256-GCM encrypted key/value layer scoped to a
//!   single user, over any [`bridge_traits::StorageProvider`].
//! - [`CacheService`]: category-level cache on top of it with expiry
//!   tracking, selective clearing, server backups, corruption recovery,
//!   schema version checks and the pending-sync list.
//!
//! ```rust,ignore
//! let service = CacheService::open(user_id, storage, secure_store, clock, policy).await?;
//! service.put(CacheCategory::Patients, "p-1", &patient).await?;
//!
//! let backup_key = service.create_server_cache_backup("ward-a").await?;
//! service
//!     .selective_cache_clear(&SelectiveClearOptions::server_switch())
//!     .await?;
//! ```

pub mod backup;
pub mod encryption;
pub mod error;
pub mod keys;
mod pending_sync;
pub mod secure_cache;
pub mod service;
pub mod types;

pub use backup::{BackupSummary, ServerCacheBackup, BACKUP_KEY_PREFIX};
pub use encryption::{CacheEncryptor, EncryptionKey};
pub use error::{CacheError, Result};
pub use keys::{user_scope, UserKeyProvider};
pub use pending_sync::PendingSyncItem;
pub use secure_cache::{SecureCache, CACHE_KEY_PREFIX};
pub use service::CacheService;
pub use types::{
    CacheCategory, CacheMetadata, CacheStats, CacheVersionStatus, CorruptionReport,
    RefreshOutcome, SelectiveClearOptions, SelectiveClearReport,
};
