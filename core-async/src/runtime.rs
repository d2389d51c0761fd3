//! Runtime utilities that abstract over the underlying async executor.
//!
//! Downstream crates use [`Handle::try_current`] to decide whether work can be
//! spawned, and [`block_on`] to drive a future from synchronous code (tests,
//! logging sinks outside a runtime).

pub use tokio::runtime::{Builder, Handle, Runtime};

/// Runs the provided future to completion on a lightweight current-thread runtime.
pub fn block_on<F>(future: F) -> F::Output
where
    F: std::future::Future,
{
    Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("core_async::runtime::block_on: failed to build Tokio runtime")
        .block_on(future)
}

/// Returns `true` when called from inside a runtime context.
pub fn in_runtime() -> bool {
    Handle::try_current().is_ok()
}
