use bridge_traits::BridgeError;
use core_cache::CacheError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Invalid queue input: {0}")]
    Validation(String),

    #[error("Queue item {item_id} not found")]
    ItemNotFound { item_id: String },

    #[error("Invalid queue item ID: {0}")]
    InvalidItemId(String),

    #[error("Storage error: {0}")]
    Storage(#[from] BridgeError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, QueueError>;

#[derive(Error, Debug)]
pub enum SwitchError {
    #[error("Invalid server switch: {0}")]
    Invalid(String),

    #[error("Cache schema migration required (stored {stored:?}, current {current}) before switching servers")]
    MigrationRequired { stored: Option<u32>, current: u32 },

    #[error("Stored cache schema version {stored} is newer than supported version {current}")]
    UnsupportedVersion { stored: u32, current: u32 },

    #[error("Server switch rolled back (cache restored: {restored}): {source}")]
    RolledBack {
        #[source]
        source: Box<SwitchError>,
        restored: bool,
    },

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}
