//! # Core Configuration Module
//!
//! Provides configuration management for the offline synchronization core.
//!
//! ## Overview
//!
//! The configuration system uses a builder pattern to construct a `CoreConfig`
//! instance that holds the injected bridges and the cache/queue policies.
//! It enforces fail-fast validation so a misconfigured host finds out at
//! startup rather than in the middle of a clinical session.
//!
//! ## Required Dependencies
//!
//! - `StorageProvider` - Persistent key/value store for cache and queue
//! - `SecureStore` - Per-user cache encryption keys
//!
//! ## Optional Dependencies
//!
//! - `NetworkStatusSource` - Platform connectivity signal. Without it the
//!   connectivity monitor starts online and is driven by the host.
//! - `Clock` - Defaults to [`SystemClock`]
//!
//! When the `desktop-shims` feature is enabled, desktop-ready defaults for
//! `StorageProvider` (SQLite under `data_dir`) and `SecureStore` (OS keychain)
//! are injected automatically if not provided.
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::config::{CoreConfig, QueuePolicy};
//! use std::sync::Arc;
//!
//! let config = CoreConfig::builder()
//!     .storage(Arc::new(AsyncStorageBridge::new()))
//!     .secure_store(Arc::new(KeychainBridge::new()))
//!     .network_source(Arc::new(NetInfoBridge::new()))
//!     .queue_policy(QueuePolicy::default().with_capacity(500))
//!     .build()
//!     .expect("Failed to build config");
//! ```
//!
//! ## Error Handling
//!
//! ```should_panic
//! use core_runtime::config::{CachePolicy, CoreConfig};
//! use chrono::Duration;
//!
//! // A zero TTL is rejected before any bridge is touched
//! let config = CoreConfig::builder()
//!     .cache_policy(CachePolicy::default().with_reference_ttl(Duration::zero()))
//!     .build()
//!     .expect("Should fail - zero TTL");
//! ```

use crate::error::{Error, Result};
use bridge_traits::{Clock, NetworkStatusSource, SecureStore, StorageProvider, SystemClock};
use chrono::Duration;
use std::path::PathBuf;
use std::sync::Arc;

/// Default TTL applied to reference data (patients, care plans, schedules)
pub const DEFAULT_REFERENCE_TTL_HOURS: i64 = 8;
/// Default cache schema version
pub const DEFAULT_SCHEMA_VERSION: u32 = 1;
/// Default number of failed attempts before an item becomes terminal
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Default maximum number of retained queue items
pub const DEFAULT_QUEUE_CAPACITY: usize = 200;
/// Default age after which a pending item counts as urgent
pub const DEFAULT_URGENCY_WINDOW_HOURS: i64 = 24;
/// Default broadcast buffer for the event bus
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 100;

/// Cache expiry and schema policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    /// TTL for server-specific reference data
    pub reference_ttl: Duration,
    /// Version of the cache layout this build writes
    pub schema_version: u32,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            reference_ttl: Duration::hours(DEFAULT_REFERENCE_TTL_HOURS),
            schema_version: DEFAULT_SCHEMA_VERSION,
        }
    }
}

impl CachePolicy {
    pub fn with_reference_ttl(mut self, ttl: Duration) -> Self {
        self.reference_ttl = ttl;
        self
    }

    pub fn with_schema_version(mut self, version: u32) -> Self {
        self.schema_version = version;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.reference_ttl <= Duration::zero() {
            return Err(Error::Config(
                "Reference data TTL must be greater than zero".to_string(),
            ));
        }
        if self.schema_version == 0 {
            return Err(Error::Config(
                "Cache schema version must start at 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Offline queue retry and retention policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuePolicy {
    /// Failed attempts allowed before an item is marked failed
    pub max_retries: u32,
    /// Maximum retained items. The oldest item is evicted beyond this.
    pub capacity: usize,
    /// Pending items older than this are urgent
    pub urgency_window: Duration,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            capacity: DEFAULT_QUEUE_CAPACITY,
            urgency_window: Duration::hours(DEFAULT_URGENCY_WINDOW_HOURS),
        }
    }
}

impl QueuePolicy {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_urgency_window(mut self, window: Duration) -> Self {
        self.urgency_window = window;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_retries == 0 {
            return Err(Error::Config(
                "Queue max_retries must be at least 1".to_string(),
            ));
        }
        if self.capacity == 0 {
            return Err(Error::Config(
                "Queue capacity must be greater than 0".to_string(),
            ));
        }
        if self.urgency_window <= Duration::zero() {
            return Err(Error::Config(
                "Queue urgency window must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Core configuration for the offline synchronization core.
///
/// Use [`CoreConfigBuilder`] to construct instances.
#[derive(Clone)]
pub struct CoreConfig {
    /// Persistent key/value store (required)
    pub storage: Arc<dyn StorageProvider>,

    /// Secure key material storage (required)
    pub secure_store: Arc<dyn SecureStore>,

    /// Platform connectivity signal (optional)
    pub network_source: Option<Arc<dyn NetworkStatusSource>>,

    /// Time source
    pub clock: Arc<dyn Clock>,

    pub cache_policy: CachePolicy,

    pub queue_policy: QueuePolicy,

    /// Capacity of the broadcast event bus
    pub event_buffer_size: usize,
}

impl std::fmt::Debug for CoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreConfig")
            .field("storage", &"StorageProvider { ... }")
            .field("secure_store", &"SecureStore { ... }")
            .field(
                "network_source",
                &self
                    .network_source
                    .as_ref()
                    .map(|_| "NetworkStatusSource { ... }"),
            )
            .field("cache_policy", &self.cache_policy)
            .field("queue_policy", &self.queue_policy)
            .field("event_buffer_size", &self.event_buffer_size)
            .finish()
    }
}

impl CoreConfig {
    /// Creates a new builder for constructing a `CoreConfig`.
    pub fn builder() -> CoreConfigBuilder {
        CoreConfigBuilder::default()
    }

    /// Validates the configuration and returns an error if invalid.
    pub fn validate(&self) -> Result<()> {
        self.cache_policy.validate()?;
        self.queue_policy.validate()?;

        if self.event_buffer_size == 0 {
            return Err(Error::Config(
                "Event buffer size must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(not(feature = "desktop-shims"))]
fn storage_missing_error() -> Error {
    Error::CapabilityMissing {
        capability: "StorageProvider".to_string(),
        message: "StorageProvider implementation is required for the cache and offline queue. \
                 Desktop: enable the 'desktop-shims' feature to use the default SQLite store. \
                 Tablet: inject an AsyncStorage-backed provider."
            .to_string(),
    }
}

#[cfg(not(feature = "desktop-shims"))]
fn secure_store_missing_error() -> Error {
    Error::CapabilityMissing {
        capability: "SecureStore".to_string(),
        message: "SecureStore implementation is required for cache encryption keys. \
                 Desktop: enable the 'desktop-shims' feature to use the default KeyringSecureStore. \
                 Tablet: inject platform-native secure storage (Keychain/Keystore)."
            .to_string(),
    }
}

#[cfg(feature = "desktop-shims")]
fn provide_default_secure_store() -> Result<Arc<dyn SecureStore>> {
    use bridge_desktop::KeyringSecureStore;

    let store: Arc<dyn SecureStore> = Arc::new(KeyringSecureStore::new());
    Ok(store)
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_secure_store() -> Result<Arc<dyn SecureStore>> {
    Err(secure_store_missing_error())
}

#[cfg(feature = "desktop-shims")]
fn provide_default_storage(data_dir: Option<&PathBuf>) -> Result<Arc<dyn StorageProvider>> {
    use bridge_desktop::SqliteStorageProvider;
    use core_async::runtime::{Handle, Runtime};
    use std::thread;

    let data_dir = data_dir.ok_or_else(|| {
        Error::Config(
            "Either .storage() or .data_dir() is required to locate the default SQLite store."
                .to_string(),
        )
    })?;
    let candidate = data_dir.join("carelink.db");

    let init_store = |path: PathBuf| -> Result<_> {
        let runtime = Runtime::new().map_err(|e| {
            Error::Internal(format!(
                "Failed to create runtime for default storage provider: {}",
                e
            ))
        })?;

        runtime
            .block_on(SqliteStorageProvider::new(path))
            .map_err(|e| {
                Error::Internal(format!("Failed to initialize default storage provider: {}", e))
            })
    };

    // block_on cannot nest inside a running runtime
    let store = match Handle::try_current() {
        Ok(_) => thread::spawn(move || init_store(candidate))
            .join()
            .map_err(|_| {
                Error::Internal(
                    "Worker thread panicked while creating default storage provider".to_string(),
                )
            })??,
        Err(_) => init_store(candidate)?,
    };

    let store: Arc<dyn StorageProvider> = Arc::new(store);
    Ok(store)
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_storage(_data_dir: Option<&PathBuf>) -> Result<Arc<dyn StorageProvider>> {
    Err(storage_missing_error())
}

#[derive(Default)]
pub struct CoreConfigBuilder {
    storage: Option<Arc<dyn StorageProvider>>,
    secure_store: Option<Arc<dyn SecureStore>>,
    network_source: Option<Arc<dyn NetworkStatusSource>>,
    clock: Option<Arc<dyn Clock>>,
    data_dir: Option<PathBuf>,
    cache_policy: CachePolicy,
    queue_policy: QueuePolicy,
    event_buffer_size: Option<usize>,
}

impl CoreConfigBuilder {
    pub fn storage(mut self, storage: Arc<dyn StorageProvider>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn secure_store(mut self, store: Arc<dyn SecureStore>) -> Self {
        self.secure_store = Some(store);
        self
    }

    pub fn network_source(mut self, source: Arc<dyn NetworkStatusSource>) -> Self {
        self.network_source = Some(source);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Directory for the desktop default SQLite store
    pub fn data_dir<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.data_dir = Some(path.into());
        self
    }

    pub fn cache_policy(mut self, policy: CachePolicy) -> Self {
        self.cache_policy = policy;
        self
    }

    pub fn queue_policy(mut self, policy: QueuePolicy) -> Self {
        self.queue_policy = policy;
        self
    }

    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.event_buffer_size = Some(size);
        self
    }

    pub fn build(self) -> Result<CoreConfig> {
        // Policies first, so bad values fail before any default bridge is created
        self.cache_policy.validate()?;
        self.queue_policy.validate()?;

        let storage = match self.storage {
            Some(storage) => storage,
            None => provide_default_storage(self.data_dir.as_ref())?,
        };

        let secure_store = match self.secure_store {
            Some(store) => store,
            None => provide_default_secure_store()?,
        };

        let config = CoreConfig {
            storage,
            secure_store,
            network_source: self.network_source,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            cache_policy: self.cache_policy,
            queue_policy: self.queue_policy,
            event_buffer_size: self.event_buffer_size.unwrap_or(DEFAULT_EVENT_BUFFER_SIZE),
        };

        config.validate()?;

        Ok(config)
    }
}
