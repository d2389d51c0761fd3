//! Core service façade and bootstrap helpers.
//!
//! This crate wires host-provided bridge implementations (key/value storage,
//! secure storage, connectivity, clock) into the offline synchronization
//! core. A [`CoreService`] owns the process-wide pieces (event bus and
//! network monitor); each signed-in user gets a [`UserSession`] holding their
//! encrypted cache, their offline queue and a server switch coordinator.
//!
//! Desktop hosts typically enable the `desktop-shims` feature (which depends
//! on `bridge-desktop`) and call [`bootstrap_desktop`]; tablet hosts inject
//! their own bridges through [`CoreConfig::builder`].
//!
//! ```rust,ignore
//! let core = CoreService::new(
//!     CoreConfig::builder()
//!         .storage(storage)
//!         .secure_store(secure_store)
//!         .network_source(network_source)
//!         .build()?,
//! )
//! .await?;
//!
//! let session = core.open_session("nurse-1").await?;
//! session
//!     .queue()
//!     .register_handler(OperationKind::RecordingUpload, upload_handler);
//! ```

pub mod error;

pub use error::{CoreError, Result};

pub use core_runtime::config::{CachePolicy, CoreConfig, QueuePolicy};
pub use core_runtime::events::{CoreEvent, EventBus};

use std::sync::Arc;

use core_cache::{user_scope, CacheService, CorruptionReport};
use core_runtime::events::Receiver;
use core_runtime::listeners::Subscription;
use core_sync::{NetworkMonitor, OfflineQueue, QueueLoadReport, ServerSwitchCoordinator};
use tracing::{debug, info, instrument, warn};

#[cfg(feature = "desktop-shims")]
use bridge_desktop::DesktopNetworkSource;

/// Primary façade exposed to host applications.
#[derive(Clone)]
pub struct CoreService {
    config: Arc<CoreConfig>,
    events: EventBus,
    network: Arc<NetworkMonitor>,
}

impl CoreService {
    /// Create a service from a validated configuration.
    ///
    /// Attaches the network monitor to the configured source, or starts it
    /// online for hosts that report connectivity themselves.
    pub async fn new(config: CoreConfig) -> Result<Self> {
        config.validate()?;
        let events = EventBus::new(config.event_buffer_size);

        let network = match &config.network_source {
            Some(source) => NetworkMonitor::attach(Arc::clone(source), Some(events.clone())).await?,
            None => Arc::new(NetworkMonitor::new(true).with_events(events.clone())),
        };

        info!(connected = network.is_connected(), "Core service initialized");
        Ok(Self {
            config: Arc::new(config),
            events,
            network,
        })
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn network(&self) -> Arc<NetworkMonitor> {
        Arc::clone(&self.network)
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.events.subscribe()
    }

    /// Open the cache and offline queue of `user_id`.
    ///
    /// Damaged cache entries and queue records are repaired before the
    /// session is returned, and the queue starts flushing on reconnection.
    #[instrument(skip(self, user_id))]
    pub async fn open_session(&self, user_id: &str) -> Result<UserSession> {
        if user_id.trim().is_empty() {
            return Err(CoreError::InvalidSession(
                "user id must not be empty".to_string(),
            ));
        }
        let scope = user_scope(user_id);

        let cache = CacheService::open(
            user_id,
            Arc::clone(&self.config.storage),
            Arc::clone(&self.config.secure_store),
            Arc::clone(&self.config.clock),
            self.config.cache_policy,
        )
        .await?
        .with_events(self.events.clone());
        let cache = Arc::new(cache);

        let recovery = cache.recover_from_cache_corruption().await;
        if !recovery.recovered {
            warn!(scope = %scope, "Cache corruption scan incomplete");
        }

        let queue = OfflineQueue::new(
            Arc::clone(&self.config.storage),
            Arc::clone(&self.network),
            Arc::clone(&self.config.clock),
            self.config.queue_policy,
        )
        .with_scope(&scope)
        .with_events(self.events.clone());
        let queue = Arc::new(queue);
        let load = queue.load().await?;
        let auto_flush = queue.start_auto_flush();

        let server_switch = ServerSwitchCoordinator::new(Arc::clone(&cache), Arc::clone(&queue))
            .with_events(self.events.clone());

        info!(
            scope = %scope,
            queued = load.loaded,
            corrupted_entries = recovery.corrupted_keys.len(),
            "User session opened"
        );

        Ok(UserSession {
            scope,
            cache,
            queue,
            server_switch: Arc::new(server_switch),
            recovery,
            load,
            auto_flush: Some(auto_flush),
        })
    }
}

impl std::fmt::Debug for CoreService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreService")
            .field("config", &self.config)
            .field("network", &self.network)
            .finish()
    }
}

/// Per-user view of the core.
///
/// Dropping the session (or signing out) unregisters its reconnection
/// auto-flush from the shared network monitor.
pub struct UserSession {
    scope: String,
    cache: Arc<CacheService>,
    queue: Arc<OfflineQueue>,
    server_switch: Arc<ServerSwitchCoordinator>,
    recovery: CorruptionReport,
    load: QueueLoadReport,
    auto_flush: Option<Subscription>,
}

impl UserSession {
    /// Opaque storage scope derived from the user id
    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn cache(&self) -> Arc<CacheService> {
        Arc::clone(&self.cache)
    }

    pub fn queue(&self) -> Arc<OfflineQueue> {
        Arc::clone(&self.queue)
    }

    pub fn server_switch(&self) -> Arc<ServerSwitchCoordinator> {
        Arc::clone(&self.server_switch)
    }

    /// Cache corruption found while opening the session
    pub fn recovery_report(&self) -> &CorruptionReport {
        &self.recovery
    }

    /// Queue records loaded (and dropped) while opening the session
    pub fn queue_load_report(&self) -> &QueueLoadReport {
        &self.load
    }

    /// Clear the user's cached data and backups.
    ///
    /// Queued operations are kept so nothing captured offline is lost.
    #[instrument(skip(self), fields(scope = %self.scope))]
    pub async fn sign_out(mut self) -> Result<usize> {
        self.stop_auto_flush();
        let removed = self.cache.clear_user_cache().await?;
        info!(removed = removed, "User signed out");
        Ok(removed)
    }

    fn stop_auto_flush(&mut self) {
        if let Some(subscription) = self.auto_flush.take() {
            subscription.unsubscribe();
            debug!(scope = %self.scope, "Reconnection auto-flush stopped");
        }
    }
}

impl Drop for UserSession {
    fn drop(&mut self) {
        self.stop_auto_flush();
    }
}

impl std::fmt::Debug for UserSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserSession")
            .field("scope", &self.scope)
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

/// Convenience bootstrapper for desktop hosts.
///
/// Uses the SQLite store under `data_dir`, the OS keychain and a TCP
/// reachability probe.
///
/// ```no_run
/// # #[cfg(feature = "desktop-shims")]
/// # async fn example() -> core_service::Result<()> {
/// let core = core_service::bootstrap_desktop("./data").await?;
/// let session = core.open_session("nurse-1").await?;
/// # Ok(())
/// # }
/// ```
#[cfg(feature = "desktop-shims")]
pub async fn bootstrap_desktop(data_dir: impl Into<std::path::PathBuf>) -> Result<CoreService> {
    let config = CoreConfig::builder()
        .data_dir(data_dir)
        .network_source(Arc::new(DesktopNetworkSource::new()))
        .build()
        .map_err(|err| CoreError::InitializationFailed(err.to_string()))?;
    CoreService::new(config).await
}
