//! # Host Bridge Traits
//!
//! Collaborator contracts that the offline synchronization core consumes from
//! the host application.
//!
//! ## Overview
//!
//! The core never talks to AsyncStorage, the keychain or the OS reachability
//! APIs directly. Each capability is described by a trait here and injected
//! at construction time, which keeps the core testable with in-memory doubles
//! and lets each platform ship its own adapter.
//!
//! ## Traits
//!
//! ### Storage
//! - [`StorageProvider`](storage::StorageProvider) - Unreliable async key/value store
//! - [`SecureStore`](storage::SecureStore) - Per-user key material (Keychain/Keystore)
//!
//! ### Platform Integration
//! - [`NetworkStatusSource`](network::NetworkStatusSource) - Connectivity signal and change stream
//!
//! ### Utilities
//! - [`Clock`](time::Clock) - Time source for deterministic testing
//! - [`LoggerSink`](time::LoggerSink) - Forward structured logs to host logging
//!
//! ## Platform Requirements
//!
//! | Platform | Implementation Crate | Status |
//! |----------|---------------------|--------|
//! | Desktop  | `bridge-desktop`    | ✅ In Progress |
//! | iPadOS   | TBD                 | 📋 Planned |
//! | Android  | TBD                 | 📋 Planned |
//!
//! ## Error Handling
//!
//! All bridge traits use [`BridgeError`](error::BridgeError). Implementations
//! should convert platform errors into it with enough context (key names,
//! network status) for the core to log a useful message. The core treats every
//! bridge error as transient.
//!
//! ## Thread Safety
//!
//! All bridge traits require `Send + Sync` so adapters can be shared across
//! async tasks behind an `Arc`.
//!
//! ## Examples
//!
//! ```ignore
//! use bridge_traits::storage::StorageProvider;
//! use bridge_traits::error::Result;
//! use async_trait::async_trait;
//!
//! pub struct AsyncStorageBridge { /* host handle */ }
//!
//! #[async_trait]
//! impl StorageProvider for AsyncStorageBridge {
//!     async fn get(&self, key: &str) -> Result<Option<String>> { todo!() }
//!     async fn set(&self, key: &str, value: &str) -> Result<()> { todo!() }
//!     async fn remove(&self, key: &str) -> Result<()> { todo!() }
//!     async fn get_all_keys(&self) -> Result<Vec<String>> { todo!() }
//! }
//! ```

pub mod error;
pub mod network;
pub mod storage;
pub mod time;

pub use error::BridgeError;

// Re-export commonly used types
pub use network::{NetworkChangeStream, NetworkInfo, NetworkStatus, NetworkStatusSource, NetworkType};
pub use storage::{InMemorySecureStore, InMemoryStorage, SecureStore, StorageProvider};
pub use time::{Clock, ConsoleLogger, LogEntry, LogLevel, LoggerSink, ManualClock, SystemClock};
