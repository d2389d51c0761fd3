//! Time-related abstractions.
//!
//! Wall-clock time used for business rules (expiry, urgency) comes from the
//! injectable `Clock` bridge, not from here. This module only covers
//! executor-level timing: sleeping, timeouts and monotonic measurement.
//!
//! # Examples
//!
//! ```rust
//! use core_async::time::{sleep, Duration, Instant};
//!
//! async fn example() {
//!     let start = Instant::now();
//!     sleep(Duration::from_millis(5)).await;
//!     assert!(start.elapsed() >= Duration::from_millis(5));
//! }
//! ```

pub use tokio::time::{interval, sleep, sleep_until, timeout, Interval, Sleep, Timeout};

pub use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
