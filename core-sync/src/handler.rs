//! Operation handlers
//!
//! Domain services register one async handler per [`OperationKind`]. The
//! queue passes each item through untouched and only looks at whether the
//! handler succeeded.

use crate::item::{OperationKind, QueueItem};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

/// Failure reported by an operation handler
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("Network unavailable: {0}")]
    Offline(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("{0}")]
    Other(String),
}

/// Handles queued operations of one kind
#[async_trait]
pub trait OperationHandler: Send + Sync {
    async fn handle(&self, item: &QueueItem) -> std::result::Result<(), HandlerError>;
}

/// Adapter turning an async closure into an [`OperationHandler`]
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> OperationHandler for FnHandler<F>
where
    F: Fn(QueueItem) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send,
{
    async fn handle(&self, item: &QueueItem) -> std::result::Result<(), HandlerError> {
        (self.f)(item.clone()).await
    }
}

/// Wrap an async closure as a shareable handler.
///
/// ```rust,ignore
/// queue.register_handler(
///     OperationKind::LanguageChange,
///     handler_fn(|item| async move { settings.push(item).await }),
/// );
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn OperationHandler>
where
    F: Fn(QueueItem) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

/// Handlers keyed by operation kind
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<OperationKind, Arc<dyn OperationHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `kind`, replacing any previous one
    pub fn register(&self, kind: OperationKind, handler: Arc<dyn OperationHandler>) {
        self.handlers.write().insert(kind, handler);
    }

    pub fn unregister(&self, kind: OperationKind) -> bool {
        self.handlers.write().remove(&kind).is_some()
    }

    pub fn get(&self, kind: OperationKind) -> Option<Arc<dyn OperationHandler>> {
        self.handlers.read().get(&kind).cloned()
    }

    pub fn contains(&self, kind: OperationKind) -> bool {
        self.handlers.read().contains_key(&kind)
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kinds: Vec<OperationKind> = self.handlers.read().keys().copied().collect();
        f.debug_struct("HandlerRegistry")
            .field("kinds", &kinds)
            .finish()
    }
}
