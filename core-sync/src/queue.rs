//! # Offline Queue
//!
//! Durable, ordered, retry-bounded queue of operations captured while the
//! device may be offline.
//!
//! ## Overview
//!
//! - **Persistence**: every item is stored as its own JSON record at
//!   `@offline_queue/{scope}/item/{id}`, loaded lazily on first use.
//!   Records that no longer parse are dropped and reported.
//! - **Ordering**: processing follows `created_at` (when the underlying event
//!   happened), ties broken by insertion order.
//! - **Retry bound**: each failed attempt increments `retry_count`; at the
//!   limit the item becomes `Failed` and is never handed to its handler
//!   again.
//! - **Deduplication**: adding an operation whose dedup key is already queued
//!   returns the existing item.
//! - **Capacity**: at capacity the oldest items are evicted, never the one
//!   being added. An item whose record cannot be deleted stays queued.
//!
//! Handler and storage failures during processing never escape as errors;
//! they surface as item status, [`ProcessOutcome`]s, queue events and change
//! notifications.
//!
//! ## Usage
//!
//! ```ignore
//! let queue = Arc::new(OfflineQueue::new(storage, network.clone(), clock, QueuePolicy::default()));
//! queue.register_handler(OperationKind::RecordingUpload, upload_handler);
//! let _auto_flush = queue.start_auto_flush();
//!
//! let id = queue.add_to_queue(QueueOperation::RecordingUpload(upload)).await?;
//! let results = queue.process_queue().await;
//! ```

use crate::connectivity::NetworkMonitor;
use crate::error::{QueueError, Result};
use crate::handler::{HandlerError, HandlerRegistry, OperationHandler};
use crate::item::{OperationKind, QueueItem, QueueItemId, QueueOperation};
use bridge_traits::{Clock, StorageProvider};
use chrono::Duration;
use core_async::sync::Mutex;
use core_runtime::config::QueuePolicy;
use core_runtime::events::{CoreEvent, EventBus, QueueEvent};
use core_runtime::listeners::{Listener, ListenerSet, Subscription};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, instrument, warn};

/// Prefix shared by every persisted queue item
pub const QUEUE_KEY_PREFIX: &str = "@offline_queue/";

/// Result of loading persisted items
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueLoadReport {
    pub loaded: usize,
    /// Storage keys of records that failed to parse and were removed
    pub corrupted_keys: Vec<String>,
}

/// What happened to one item during processing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Handler succeeded; the item was removed
    Completed,
    /// Handler failed; the item stays pending
    Retrying { retry_count: u32, error: String },
    /// Handler failed and the retry limit is now reached
    Failed { retry_count: u32, error: String },
    /// Item had already failed; the handler was not invoked
    RetryLimitReached { retry_count: u32 },
    /// No item with this id
    NotFound,
    /// Not attempted (no handler registered, storage unavailable); the item
    /// is untouched
    Deferred { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessResult {
    pub item_id: QueueItemId,
    pub outcome: ProcessOutcome,
}

impl ProcessResult {
    pub fn is_success(&self) -> bool {
        self.outcome == ProcessOutcome::Completed
    }

    /// Error text for unsuccessful outcomes
    pub fn error(&self) -> Option<String> {
        match &self.outcome {
            ProcessOutcome::Completed => None,
            ProcessOutcome::Retrying { error, .. } | ProcessOutcome::Failed { error, .. } => {
                Some(error.clone())
            }
            ProcessOutcome::RetryLimitReached { retry_count } => Some(format!(
                "max retry limit reached ({} attempts)",
                retry_count
            )),
            ProcessOutcome::NotFound => Some(format!("queue item {} not found", self.item_id)),
            ProcessOutcome::Deferred { reason } => Some(reason.clone()),
        }
    }
}

/// Queue statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub failed: usize,
    pub urgent: usize,
    pub oldest_pending_age_secs: Option<i64>,
    pub capacity: usize,
}

#[derive(Default)]
struct QueueState {
    loaded: bool,
    items: HashMap<QueueItemId, QueueItem>,
    next_sequence: u64,
}

impl QueueState {
    fn sorted(&self) -> Vec<QueueItem> {
        let mut items: Vec<QueueItem> = self.items.values().cloned().collect();
        items.sort_by_key(QueueItem::order_key);
        items
    }
}

pub struct OfflineQueue {
    storage: Arc<dyn StorageProvider>,
    network: Arc<NetworkMonitor>,
    clock: Arc<dyn Clock>,
    policy: QueuePolicy,
    prefix: String,
    handlers: HandlerRegistry,
    listeners: ListenerSet<Vec<QueueItem>>,
    events: Option<EventBus>,
    /// Guards the in-memory view and every read-modify-write against storage
    state: Mutex<QueueState>,
    /// Serializes processing so an item is never handled twice concurrently
    process_lock: Mutex<()>,
}

impl OfflineQueue {
    pub fn new(
        storage: Arc<dyn StorageProvider>,
        network: Arc<NetworkMonitor>,
        clock: Arc<dyn Clock>,
        policy: QueuePolicy,
    ) -> Self {
        Self {
            storage,
            network,
            clock,
            policy,
            prefix: format!("{}item/", QUEUE_KEY_PREFIX),
            handlers: HandlerRegistry::new(),
            listeners: ListenerSet::new(),
            events: None,
            state: Mutex::new(QueueState::default()),
            process_lock: Mutex::new(()),
        }
    }

    /// Keep items under a per-user scope
    pub fn with_scope(mut self, scope: &str) -> Self {
        self.prefix = format!("{}{}/item/", QUEUE_KEY_PREFIX, scope);
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn policy(&self) -> &QueuePolicy {
        &self.policy
    }

    pub fn network(&self) -> &Arc<NetworkMonitor> {
        &self.network
    }

    pub fn register_handler(&self, kind: OperationKind, handler: Arc<dyn OperationHandler>) {
        self.handlers.register(kind, handler);
    }

    pub fn unregister_handler(&self, kind: OperationKind) -> bool {
        self.handlers.unregister(kind)
    }

    fn item_key(&self, id: QueueItemId) -> String {
        format!("{}{}", self.prefix, id)
    }

    // ------------------------------------------------------------------
    // Loading
    // ------------------------------------------------------------------

    /// Reload all persisted items, replacing the in-memory view.
    #[instrument(skip(self))]
    pub async fn load(&self) -> Result<QueueLoadReport> {
        let mut state = self.state.lock().await;
        state.loaded = false;
        self.load_into(&mut state).await
    }

    async fn ensure_loaded(&self, state: &mut QueueState) -> Result<()> {
        if !state.loaded {
            self.load_into(state).await?;
        }
        Ok(())
    }

    async fn load_into(&self, state: &mut QueueState) -> Result<QueueLoadReport> {
        let keys = self.storage.keys_with_prefix(&self.prefix).await?;
        let records = if keys.is_empty() {
            Vec::new()
        } else {
            self.storage.multi_get(&keys).await?
        };

        let mut items = HashMap::new();
        let mut corrupted_keys = Vec::new();
        for (key, raw) in records {
            let Some(raw) = raw else { continue };
            match serde_json::from_str::<QueueItem>(&raw) {
                Ok(item) if key == self.item_key(item.id) => {
                    items.insert(item.id, item);
                }
                Ok(_) => {
                    warn!(key = %key, "Queue record stored under a foreign key");
                    corrupted_keys.push(key);
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Skipping corrupted queue record");
                    corrupted_keys.push(key);
                }
            }
        }

        if !corrupted_keys.is_empty() {
            if let Err(e) = self.storage.multi_remove(&corrupted_keys).await {
                error!(error = %e, "Failed to remove corrupted queue records");
            }
        }

        state.next_sequence = items
            .values()
            .map(|item| item.sequence + 1)
            .max()
            .unwrap_or(0);
        state.items = items;
        state.loaded = true;

        info!(
            loaded = state.items.len(),
            corrupted = corrupted_keys.len(),
            "Offline queue loaded"
        );

        Ok(QueueLoadReport {
            loaded: state.items.len(),
            corrupted_keys,
        })
    }

    // ------------------------------------------------------------------
    // Enqueue
    // ------------------------------------------------------------------

    /// Validate and persist `operation`.
    ///
    /// Returns the id of the new item, or of the already queued item with the
    /// same dedup key.
    ///
    /// # Errors
    ///
    /// [`QueueError::Validation`] for invalid input; storage errors when the
    /// item could not be persisted.
    #[instrument(skip(self, operation), fields(kind = %operation.kind()))]
    pub async fn add_to_queue(&self, operation: QueueOperation) -> Result<QueueItemId> {
        operation.validate()?;

        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await?;

        let dedup_key = operation.dedup_key();
        if let Some(existing) = state.items.values().find(|i| i.dedup_key == dedup_key) {
            debug!(item_id = %existing.id, "Duplicate operation; keeping queued item");
            return Ok(existing.id);
        }

        let item = QueueItem::new(operation, self.clock.now(), state.next_sequence);
        self.storage
            .set(&self.item_key(item.id), &serde_json::to_string(&item)?)
            .await?;

        state.next_sequence += 1;
        let item_id = item.id;
        let kind = item.kind();
        state.items.insert(item_id, item);

        let evicted = self.evict_over_capacity(&mut state, item_id).await;
        let pending_count = state.items.len();
        let snapshot = state.sorted();
        drop(state);

        info!(item_id = %item_id, pending_count = pending_count, "Queued operation");
        for (evicted_id, evicted_kind) in evicted {
            self.emit(QueueEvent::ItemEvicted {
                item_id: evicted_id.to_string(),
                operation: evicted_kind.to_string(),
            });
        }
        self.emit(QueueEvent::ItemAdded {
            item_id: item_id.to_string(),
            operation: kind.to_string(),
            pending_count,
        });
        self.listeners.notify(&snapshot);

        Ok(item_id)
    }

    async fn evict_over_capacity(
        &self,
        state: &mut QueueState,
        keep: QueueItemId,
    ) -> Vec<(QueueItemId, OperationKind)> {
        let excess = state.items.len().saturating_sub(self.policy.capacity);
        if excess == 0 {
            return Vec::new();
        }

        let victims: Vec<(QueueItemId, OperationKind)> = state
            .sorted()
            .into_iter()
            .filter(|item| item.id != keep)
            .take(excess)
            .map(|item| (item.id, item.kind()))
            .collect();

        // Dropped from memory only once the record is gone; the next add
        // retries a failed delete
        let mut evicted = Vec::with_capacity(victims.len());
        for (id, kind) in victims {
            if let Err(e) = self.storage.remove(&self.item_key(id)).await {
                error!(item_id = %id, error = %e, "Failed to evict queue item; keeping it");
                break;
            }
            state.items.remove(&id);
            warn!(item_id = %id, operation = %kind, capacity = self.policy.capacity, "Queue full; evicted oldest item");
            evicted.push((id, kind));
        }
        evicted
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// All queued items in processing order
    pub async fn get_queue(&self) -> Result<Vec<QueueItem>> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await?;
        Ok(state.sorted())
    }

    pub async fn get_item(&self, id: QueueItemId) -> Result<Option<QueueItem>> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await?;
        Ok(state.items.get(&id).cloned())
    }

    /// Items not yet completed, failed ones included
    pub async fn get_pending_count(&self) -> Result<usize> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await?;
        Ok(state.items.len())
    }

    /// Items older than the urgency window, evaluated now
    pub async fn get_urgent_items(&self) -> Result<Vec<QueueItem>> {
        let now = self.clock.now();
        let window = self.policy.urgency_window;
        Ok(self
            .get_queue()
            .await?
            .into_iter()
            .filter(|item| item.is_urgent(now, window))
            .collect())
    }

    /// Age of the chronologically earliest pending item
    pub async fn get_oldest_pending_age(&self) -> Result<Option<Duration>> {
        let now = self.clock.now();
        Ok(self
            .get_queue()
            .await?
            .into_iter()
            .find(QueueItem::is_pending)
            .map(|item| item.age(now)))
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let now = self.clock.now();
        let items = self.get_queue().await?;

        Ok(QueueStats {
            pending: items.iter().filter(|i| i.is_pending()).count(),
            failed: items.iter().filter(|i| i.is_failed()).count(),
            urgent: items
                .iter()
                .filter(|i| i.is_urgent(now, self.policy.urgency_window))
                .count(),
            oldest_pending_age_secs: items
                .iter()
                .find(|i| i.is_pending())
                .map(|i| i.age(now).num_seconds()),
            capacity: self.policy.capacity,
        })
    }

    // ------------------------------------------------------------------
    // Processing
    // ------------------------------------------------------------------

    /// Process every pending item, oldest first.
    ///
    /// Returns immediately with no results while offline. Stops early if the
    /// monitor goes offline mid-flush.
    #[instrument(skip(self))]
    pub async fn process_queue(&self) -> Vec<ProcessResult> {
        if !self.network.is_connected() {
            let pending_count = self.get_pending_count().await.unwrap_or(0);
            info!(pending_count = pending_count, "Offline; skipping queue flush");
            self.emit(QueueEvent::FlushSkippedOffline { pending_count });
            return Vec::new();
        }

        let _processing = self.process_lock.lock().await;

        let ids: Vec<QueueItemId> = {
            let mut state = self.state.lock().await;
            if let Err(e) = self.ensure_loaded(&mut state).await {
                error!(error = %e, "Failed to load offline queue");
                return Vec::new();
            }
            state
                .sorted()
                .into_iter()
                .filter(QueueItem::is_pending)
                .map(|item| item.id)
                .collect()
        };

        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            if !self.network.is_connected() {
                info!(remaining = results.len(), "Connection lost; stopping queue flush");
                break;
            }
            results.push(self.process_one(id).await);
        }

        let succeeded = results.iter().filter(|r| r.is_success()).count();
        info!(
            attempted = results.len(),
            succeeded = succeeded,
            "Queue flush finished"
        );
        self.emit(QueueEvent::FlushCompleted {
            attempted: results.len(),
            succeeded,
            failed: results.len() - succeeded,
        });

        results
    }

    /// Process a single item regardless of its position in the queue.
    pub async fn process_item(&self, id: QueueItemId) -> ProcessResult {
        let _processing = self.process_lock.lock().await;
        self.process_one(id).await
    }

    async fn process_one(&self, id: QueueItemId) -> ProcessResult {
        let outcome = self.attempt(id).await;
        ProcessResult {
            item_id: id,
            outcome,
        }
    }

    async fn attempt(&self, id: QueueItemId) -> ProcessOutcome {
        let item = {
            let mut state = self.state.lock().await;
            if let Err(e) = self.ensure_loaded(&mut state).await {
                error!(error = %e, "Failed to load offline queue");
                return ProcessOutcome::Deferred {
                    reason: format!("queue unavailable: {}", e),
                };
            }
            match state.items.get(&id) {
                Some(item) => item.clone(),
                None => return ProcessOutcome::NotFound,
            }
        };

        if item.is_failed() {
            warn!(item_id = %id, retry_count = item.retry_count, "Max retry limit reached; not retrying");
            return ProcessOutcome::RetryLimitReached {
                retry_count: item.retry_count,
            };
        }

        let Some(handler) = self.handlers.get(item.kind()) else {
            warn!(item_id = %id, operation = %item.kind(), "No handler registered");
            return ProcessOutcome::Deferred {
                reason: format!("no handler registered for {}", item.kind()),
            };
        };

        debug!(item_id = %id, retry_count = item.retry_count, "Processing queue item");
        let result = run_handler(handler, item).await;

        let mut state = self.state.lock().await;
        let outcome = match result {
            Ok(()) => self.complete(&mut state, id).await,
            Err(e) => self.fail(&mut state, id, e.to_string()).await,
        };
        let snapshot = state.sorted();
        drop(state);

        self.listeners.notify(&snapshot);
        outcome
    }

    async fn complete(&self, state: &mut QueueState, id: QueueItemId) -> ProcessOutcome {
        let Some(item) = state.items.remove(&id) else {
            return ProcessOutcome::Completed;
        };

        if let Err(e) = self.storage.remove(&self.item_key(id)).await {
            error!(item_id = %id, error = %e, "Failed to remove completed queue item");
        }

        info!(item_id = %id, operation = %item.kind(), "Queue item completed");
        self.emit(QueueEvent::ItemCompleted {
            item_id: id.to_string(),
            operation: item.kind().to_string(),
        });
        ProcessOutcome::Completed
    }

    async fn fail(&self, state: &mut QueueState, id: QueueItemId, error: String) -> ProcessOutcome {
        let Some(item) = state.items.get_mut(&id) else {
            // Evicted while the handler ran
            return ProcessOutcome::NotFound;
        };

        let failed = item.record_failure(error.clone(), self.policy.max_retries, self.clock.now());
        let retry_count = item.retry_count;
        let record = serde_json::to_string(&*item);

        match record {
            Ok(record) => {
                if let Err(e) = self.storage.set(&self.item_key(id), &record).await {
                    error!(item_id = %id, error = %e, "Failed to persist queue item status");
                }
            }
            Err(e) => error!(item_id = %id, error = %e, "Failed to serialize queue item"),
        }

        if failed {
            warn!(
                item_id = %id,
                retry_count = retry_count,
                error = %error,
                "Queue item failed permanently after max retries"
            );
            self.emit(QueueEvent::ItemFailed {
                item_id: id.to_string(),
                retry_count,
                error: error.clone(),
            });
            ProcessOutcome::Failed { retry_count, error }
        } else {
            warn!(
                item_id = %id,
                retry_count = retry_count,
                max_retries = self.policy.max_retries,
                error = %error,
                "Queue item failed, will retry"
            );
            self.emit(QueueEvent::ItemRetrying {
                item_id: id.to_string(),
                retry_count,
                error: error.clone(),
            });
            ProcessOutcome::Retrying { retry_count, error }
        }
    }

    /// Drop an item from the queue, typically a failed one an operator gave
    /// up on.
    pub async fn discard_item(&self, id: QueueItemId) -> Result<QueueItem> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await?;

        if !state.items.contains_key(&id) {
            return Err(QueueError::ItemNotFound {
                item_id: id.to_string(),
            });
        }
        self.storage.remove(&self.item_key(id)).await?;
        let item = state.items.remove(&id).ok_or_else(|| QueueError::ItemNotFound {
            item_id: id.to_string(),
        })?;
        let snapshot = state.sorted();
        drop(state);

        info!(item_id = %id, operation = %item.kind(), "Queue item discarded");
        self.listeners.notify(&snapshot);
        Ok(item)
    }

    // ------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------

    /// Called with the full queue, in processing order, after every mutation
    pub fn on_queue_change(&self, listener: Listener<Vec<QueueItem>>) -> Subscription {
        self.listeners.add(listener)
    }

    /// Flush the queue whenever the monitor reports a reconnection.
    ///
    /// The listener only holds a weak reference to the queue.
    pub fn start_auto_flush(self: &Arc<Self>) -> Subscription {
        let queue: Weak<Self> = Arc::downgrade(self);
        self.network.on_reconnection(Arc::new(move |_: &()| {
            let Some(queue) = queue.upgrade() else { return };
            if !core_async::runtime::in_runtime() {
                warn!("Reconnected outside an async runtime; queue flush skipped");
                return;
            }
            core_async::spawn(async move {
                let results = queue.process_queue().await;
                debug!(processed = results.len(), "Auto flush after reconnection");
            });
        }))
    }

    fn emit(&self, event: QueueEvent) {
        if let Some(events) = &self.events {
            let _ = events.emit(CoreEvent::Queue(event));
        }
    }
}

impl fmt::Debug for OfflineQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OfflineQueue")
            .field("prefix", &self.prefix)
            .field("policy", &self.policy)
            .field("handlers", &self.handlers)
            .finish_non_exhaustive()
    }
}

/// Run the handler in its own task so a panic becomes an ordinary failure.
async fn run_handler(
    handler: Arc<dyn OperationHandler>,
    item: QueueItem,
) -> std::result::Result<(), HandlerError> {
    let task = core_async::spawn(async move { handler.handle(&item).await });
    match task.await {
        Ok(result) => result,
        Err(e) => Err(HandlerError::Other(format!("handler aborted: {}", e))),
    }
}
