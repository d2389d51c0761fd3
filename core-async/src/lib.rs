//! Runtime-agnostic async abstraction layer for the CareLink offline core.
//!
//! All `core-*` and `bridge-*` crates depend on this crate instead of naming
//! Tokio directly. Keeping the executor behind one façade means a tablet host
//! embedding the core through a different event loop only has to swap this
//! crate.
//!
//! # Modules
//!
//! - `task`: Task spawning and execution
//! - `time`: Time-related operations (sleep, timeout, duration, instant)
//! - `sync`: Synchronization primitives (Mutex, RwLock, channels)
//! - `runtime`: Blocking entry points and runtime handles
//!
//! # Examples
//!
//! ```rust
//! use core_async::task;
//! use core_async::time::{sleep, Duration};
//!
//! async fn example() {
//!     let handle = task::spawn(async {
//!         sleep(Duration::from_millis(10)).await;
//!         42
//!     });
//!     assert_eq!(handle.await.unwrap(), 42);
//! }
//! ```

// Re-export the async entry-point/test macros so downstream crates never need
// direct Tokio dependencies.
pub use core_async_macros::{main, test};

pub mod runtime;
pub mod sync;
pub mod task;
pub mod time;

pub use task::spawn;
pub use time::{sleep, Duration, Instant};
