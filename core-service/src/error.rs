use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Core initialization failed: {0}")]
    InitializationFailed(String),

    #[error("Invalid session: {0}")]
    InvalidSession(String),

    #[error("Configuration error: {0}")]
    Config(#[from] core_runtime::Error),

    #[error("Bridge error: {0}")]
    Bridge(#[from] bridge_traits::BridgeError),

    #[error("Cache error: {0}")]
    Cache(#[from] core_cache::CacheError),

    #[error("Queue error: {0}")]
    Queue(#[from] core_sync::QueueError),

    #[error("Server switch error: {0}")]
    Switch(#[from] core_sync::SwitchError),
}

pub type Result<T> = std::result::Result<T, CoreError>;
