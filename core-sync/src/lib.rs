//! # Offline Sync Module
//!
//! Keeps clinical work flowing while connectivity comes and goes.
//!
//! ## Components
//!
//! - **Network Monitor** (`connectivity`): Single connectivity flag with
//!   edge-triggered change and reconnection listeners
//! - **Queue Items** (`item`): Typed operations, retry state machine and
//!   dedup keys
//! - **Operation Handlers** (`handler`): Per-kind async handlers registered by
//!   domain services
//! - **Offline Queue** (`queue`): Durable, chronologically ordered,
//!   retry-bounded queue that flushes on reconnection
//! - **Server Switch Coordinator** (`coordinator`): Backup, selective clear
//!   and rollback around a change of backend server

pub mod connectivity;
pub mod coordinator;
pub mod error;
pub mod handler;
pub mod item;
pub mod queue;

pub use connectivity::NetworkMonitor;
pub use coordinator::{ActiveServer, ServerSwitchCoordinator, SwitchOutcome, ACTIVE_SERVER_KEY};
pub use error::{QueueError, Result, SwitchError};
pub use handler::{handler_fn, FnHandler, HandlerError, HandlerRegistry, OperationHandler};
pub use item::{
    ConnectivityTest, Language, LanguageChange, OperationKind, QueueItem, QueueItemId,
    QueueItemStatus, QueueOperation, RecordingContext, RecordingUpload, ServerSwitchRequest,
    SettingsUpdate,
};
pub use queue::{
    OfflineQueue, ProcessOutcome, ProcessResult, QueueLoadReport, QueueStats, QUEUE_KEY_PREFIX,
};
