//! # Desktop Bridge Implementations
//!
//! Default implementations of bridge traits for desktop hosts
//! (macOS, Windows, Linux), used by the desktop companion app and by
//! integration tests that want real persistence.
//!
//! ## Overview
//!
//! - `StorageProvider` using a SQLite-backed key-value table
//! - `SecureStore` using the `keyring` crate
//! - `NetworkStatusSource` using a TCP reachability probe
//!
//! ## Feature Flags
//!
//! - `secure-store`: Enable OS keychain integration (default)
//!
//! ## Usage
//!
//! ```ignore
//! use bridge_desktop::{DesktopNetworkSource, SqliteStorageProvider};
//!
//! #[tokio::main]
//! async fn main() {
//!     let storage = SqliteStorageProvider::new("./carelink.db".into()).await.unwrap();
//!     let network = DesktopNetworkSource::new();
//!
//!     // Use in core configuration
//! }
//! ```

mod network;
mod storage;

#[cfg(feature = "secure-store")]
mod secure_store;

pub use network::DesktopNetworkSource;
pub use storage::SqliteStorageProvider;

#[cfg(feature = "secure-store")]
pub use secure_store::KeyringSecureStore;
