//! # Event Bus System
//!
//! Provides an event-driven view of the offline synchronization core using
//! `tokio::sync::broadcast`. Hosts subscribe here to drive badges, toasts and
//! diagnostics screens without registering per-component callbacks.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐     emit      ┌───────────┐
//! │ Offline Queue ├──────────────>│           │
//! └───────────────┘               │           │
//!                                 │ EventBus  │
//! ┌───────────────┐     emit      │ (broadcast│     subscribe    ┌────────────┐
//! │ Cache Service ├──────────────>│  channel) ├─────────────────>│ Host UI    │
//! └───────────────┘               │           │                  └────────────┘
//!                                 │           │
//! ┌───────────────┐     emit      │           │     subscribe    ┌────────────┐
//! │ Server Switch ├──────────────>│           ├─────────────────>│ Diagnostics│
//! └───────────────┘               └───────────┘                  └────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use core_runtime::events::{CoreEvent, EventBus, NetworkEvent};
//!
//! let event_bus = EventBus::new(100);
//! let mut subscriber = event_bus.subscribe();
//!
//! event_bus
//!     .emit(CoreEvent::Network(NetworkEvent::Reconnected))
//!     .ok();
//!
//! assert_eq!(
//!     subscriber.try_recv().unwrap(),
//!     CoreEvent::Network(NetworkEvent::Reconnected)
//! );
//! ```
//!
//! ## Event Types
//!
//! ### Queue Events
//! - `ItemAdded`, `ItemCompleted`, `ItemRetrying`, `ItemFailed`, `ItemEvicted`
//! - `FlushSkippedOffline`, `FlushCompleted`
//!
//! ### Network Events
//! - `StatusChanged`: Settled connectivity transition
//! - `Reconnected`: Offline to online edge
//!
//! ### Cache Events
//! - `SelectiveClear`, `BackupCreated`, `BackupRestored`
//! - `CorruptionRecovered`, `MigrationCompleted`, `UserCacheCleared`
//!
//! ### Server Switch Events
//! - `Started`, `Completed`, `RolledBack`
//!
//! ## Error Handling
//!
//! Emission is best-effort: components call `emit(..).ok()` because having no
//! subscribers is normal. Subscribers that fall behind receive
//! `RecvError::Lagged(n)` and can keep reading; `RecvError::Closed` means
//! shutdown.

use core_async::sync::broadcast;
use serde::{Deserialize, Serialize};
use std::fmt;

pub use core_async::sync::broadcast::error::{RecvError, SendError};
pub use core_async::sync::broadcast::Receiver;

/// Default buffer size for the event bus channel.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 100;

// ============================================================================
// Core Event Types
// ============================================================================

/// Top-level event enum encompassing all event categories.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    Queue(QueueEvent),
    Network(NetworkEvent),
    Cache(CacheEvent),
    ServerSwitch(ServerSwitchEvent),
}

impl CoreEvent {
    /// Returns a human-readable description of the event.
    pub fn description(&self) -> &str {
        match self {
            CoreEvent::Queue(e) => e.description(),
            CoreEvent::Network(e) => e.description(),
            CoreEvent::Cache(e) => e.description(),
            CoreEvent::ServerSwitch(e) => e.description(),
        }
    }

    /// Returns the severity level of the event.
    pub fn severity(&self) -> EventSeverity {
        match self {
            CoreEvent::Queue(QueueEvent::ItemFailed { .. }) => EventSeverity::Error,
            CoreEvent::Queue(QueueEvent::ItemEvicted { .. })
            | CoreEvent::Cache(CacheEvent::CorruptionRecovered { .. })
            | CoreEvent::ServerSwitch(ServerSwitchEvent::RolledBack { .. }) => {
                EventSeverity::Warning
            }
            CoreEvent::Queue(QueueEvent::FlushCompleted { .. })
            | CoreEvent::Network(NetworkEvent::Reconnected)
            | CoreEvent::ServerSwitch(ServerSwitchEvent::Completed { .. })
            | CoreEvent::Cache(CacheEvent::MigrationCompleted { .. }) => EventSeverity::Info,
            _ => EventSeverity::Debug,
        }
    }
}

/// Event severity levels for filtering and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

// ============================================================================
// Queue Events
// ============================================================================

/// Events emitted by the offline operation queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum QueueEvent {
    /// A new operation was persisted.
    ItemAdded {
        item_id: String,
        /// Operation kind, e.g. `recording_upload`.
        operation: String,
        pending_count: usize,
    },
    /// Handler succeeded and the item was removed.
    ItemCompleted { item_id: String, operation: String },
    /// Handler failed but the item stays pending.
    ItemRetrying {
        item_id: String,
        retry_count: u32,
        error: String,
    },
    /// Retry cap reached. The item will not be attempted again.
    ItemFailed {
        item_id: String,
        retry_count: u32,
        error: String,
    },
    /// Oldest item dropped to stay within capacity.
    ItemEvicted { item_id: String, operation: String },
    /// A flush was requested while offline.
    FlushSkippedOffline { pending_count: usize },
    /// A flush pass finished.
    FlushCompleted {
        attempted: usize,
        succeeded: usize,
        failed: usize,
    },
}

impl QueueEvent {
    fn description(&self) -> &str {
        match self {
            QueueEvent::ItemAdded { .. } => "Operation queued",
            QueueEvent::ItemCompleted { .. } => "Queued operation completed",
            QueueEvent::ItemRetrying { .. } => "Queued operation failed, will retry",
            QueueEvent::ItemFailed { .. } => "Queued operation permanently failed",
            QueueEvent::ItemEvicted { .. } => "Queued operation evicted at capacity",
            QueueEvent::FlushSkippedOffline { .. } => "Queue flush skipped while offline",
            QueueEvent::FlushCompleted { .. } => "Queue flush completed",
        }
    }
}

// ============================================================================
// Network Events
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum NetworkEvent {
    StatusChanged { connected: bool },
    Reconnected,
}

impl NetworkEvent {
    fn description(&self) -> &str {
        match self {
            NetworkEvent::StatusChanged { connected: true } => "Connectivity restored",
            NetworkEvent::StatusChanged { connected: false } => "Connectivity lost",
            NetworkEvent::Reconnected => "Reconnected after being offline",
        }
    }
}

// ============================================================================
// Cache Events
// ============================================================================

/// Events emitted by the encrypted cache and its maintenance operations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum CacheEvent {
    /// Server-specific entries were removed.
    SelectiveClear { removed: usize, preserved: usize },
    BackupCreated { server_id: String, entries: usize },
    BackupRestored { server_id: String, entries: usize },
    /// Unreadable entries were discarded.
    CorruptionRecovered { corrupted: usize },
    MigrationCompleted {
        from_version: Option<u32>,
        to_version: u32,
    },
    /// Everything stored for the signed-in user was removed.
    UserCacheCleared { removed: usize },
}

impl CacheEvent {
    fn description(&self) -> &str {
        match self {
            CacheEvent::SelectiveClear { .. } => "Server-specific cache cleared",
            CacheEvent::BackupCreated { .. } => "Server cache backup created",
            CacheEvent::BackupRestored { .. } => "Server cache backup restored",
            CacheEvent::CorruptionRecovered { .. } => "Corrupted cache entries removed",
            CacheEvent::MigrationCompleted { .. } => "Cache schema migration completed",
            CacheEvent::UserCacheCleared { .. } => "User cache cleared",
        }
    }
}

// ============================================================================
// Server Switch Events
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum ServerSwitchEvent {
    Started {
        from_server_id: String,
        to_server_id: String,
    },
    Completed {
        from_server_id: String,
        to_server_id: String,
        backup_key: String,
    },
    RolledBack {
        from_server_id: String,
        to_server_id: String,
        reason: String,
    },
}

impl ServerSwitchEvent {
    fn description(&self) -> &str {
        match self {
            ServerSwitchEvent::Started { .. } => "Server switch started",
            ServerSwitchEvent::Completed { .. } => "Server switch completed",
            ServerSwitchEvent::RolledBack { .. } => "Server switch rolled back",
        }
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Central broadcast channel for [`CoreEvent`]s.
///
/// Cloning the bus is cheap; every clone publishes into the same channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    /// Creates a new event bus with the specified buffer size.
    ///
    /// Subscribers falling behind by more than `capacity` events receive
    /// `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publishes an event to all subscribers.
    ///
    /// Returns the number of subscribers that received the event, or an
    /// error if there are none.
    pub fn emit(&self, event: CoreEvent) -> Result<usize, SendError<CoreEvent>> {
        self.sender.send(event)
    }

    /// Creates a new subscriber. Past events are not replayed.
    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

// ============================================================================
// Event Stream Wrapper
// ============================================================================

type EventFilter = Box<dyn Fn(&CoreEvent) -> bool + Send + Sync>;

/// A wrapper around `broadcast::Receiver` with optional filtering.
///
/// ```rust
/// use core_runtime::events::{CoreEvent, EventBus, EventStream};
///
/// let event_bus = EventBus::new(100);
/// let queue_only = EventStream::new(event_bus.subscribe())
///     .filter(|event| matches!(event, CoreEvent::Queue(_)));
/// ```
pub struct EventStream {
    receiver: Receiver<CoreEvent>,
    filter: Option<EventFilter>,
}

impl EventStream {
    pub fn new(receiver: Receiver<CoreEvent>) -> Self {
        Self {
            receiver,
            filter: None,
        }
    }

    /// Only events matching `predicate` will be returned.
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&CoreEvent) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Box::new(predicate));
        self
    }

    fn accepts(&self, event: &CoreEvent) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter(event))
    }

    /// Receives the next event that passes the filter.
    ///
    /// # Errors
    ///
    /// Returns `RecvError::Lagged(n)` if the subscriber fell behind by `n` events.
    /// Returns `RecvError::Closed` if all senders have been dropped.
    pub async fn recv(&mut self) -> Result<CoreEvent, RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.accepts(&event) {
                return Ok(event);
            }
        }
    }

    /// Attempts to receive a matching event without waiting.
    ///
    /// Returns `None` if no events are currently available.
    pub fn try_recv(&mut self) -> Option<Result<CoreEvent, RecvError>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    if self.accepts(&event) {
                        return Some(Ok(event));
                    }
                }
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    return Some(Err(RecvError::Lagged(n)))
                }
                Err(broadcast::error::TryRecvError::Closed) => return Some(Err(RecvError::Closed)),
            }
        }
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("has_filter", &self.filter.is_some())
            .finish()
    }
}
