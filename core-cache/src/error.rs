use bridge_traits::BridgeError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Invalid cache key: {0}")]
    InvalidKey(String),

    #[error("Storage error: {0}")]
    Storage(#[from] BridgeError),

    #[error("Cache encryption error: {0}")]
    Encryption(String),

    #[error("Key material unavailable: {0}")]
    KeyMaterial(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupted cache entry {key}: {reason}")]
    Corrupted { key: String, reason: String },

    #[error("Unsupported cache schema version {stored} (current {current})")]
    UnsupportedVersion { stored: u32, current: u32 },
}

pub type Result<T> = std::result::Result<T, CacheError>;
