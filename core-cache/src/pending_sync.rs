//! Append-only list of domain edits captured while offline.

use crate::error::{CacheError, Result};
use crate::secure_cache::SecureCache;
use crate::types::CacheCategory;
use chrono::{DateTime, Utc};
use core_async::sync::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, instrument};

const ITEMS_KEY: &str = "items";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingSyncItem {
    /// Edit type, e.g. `vital_signs_update`
    pub kind: String,
    pub data: serde_json::Value,
    /// Never earlier than the timestamp of the previous item
    pub timestamp: DateTime<Utc>,
}

/// The whole list is one encrypted entry; every mutation is a locked
/// read-modify-write.
pub(crate) struct PendingSyncList {
    cache: Arc<SecureCache>,
    lock: Mutex<()>,
}

impl PendingSyncList {
    pub fn new(cache: Arc<SecureCache>) -> Self {
        Self {
            cache,
            lock: Mutex::new(()),
        }
    }

    fn namespace() -> &'static str {
        CacheCategory::PendingSync.namespace()
    }

    async fn load(&self) -> Result<Vec<PendingSyncItem>> {
        Ok(self
            .cache
            .get::<Vec<PendingSyncItem>>(Self::namespace(), ITEMS_KEY)
            .await?
            .unwrap_or_default())
    }

    #[instrument(skip(self, data))]
    pub async fn add(&self, kind: &str, data: serde_json::Value) -> Result<PendingSyncItem> {
        if kind.trim().is_empty() {
            return Err(CacheError::InvalidKey(
                "pending sync type must not be empty".to_string(),
            ));
        }

        let _guard = self.lock.lock().await;
        let mut items = self.load().await?;

        let now = self.cache.clock().now();
        let timestamp = items
            .last()
            .map(|last| last.timestamp.max(now))
            .unwrap_or(now);

        let item = PendingSyncItem {
            kind: kind.to_string(),
            data,
            timestamp,
        };
        items.push(item.clone());

        self.cache.set(Self::namespace(), ITEMS_KEY, &items).await?;
        debug!(pending = items.len(), "Recorded pending sync item");
        Ok(item)
    }

    pub async fn items(&self) -> Result<Vec<PendingSyncItem>> {
        let _guard = self.lock.lock().await;
        self.load().await
    }

    /// Empty the list with a single removal. Returns how many items it held.
    pub async fn clear(&self) -> Result<usize> {
        let _guard = self.lock.lock().await;
        let count = self.load().await.map(|items| items.len()).unwrap_or(0);
        self.cache.remove(Self::namespace(), ITEMS_KEY).await?;
        Ok(count)
    }
}
