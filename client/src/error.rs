//! Unified error handling for the client runtime.

use grantsync_engine::{RecordId, RemoteError};

use crate::config::ConfigError;

/// Client error type.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Engine error: {0}")]
    Engine(#[from] grantsync_engine::Error),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Record {0} is not in the cache")]
    NotCached(RecordId),

    #[error("Record {0} is a saved snapshot and cannot be updated in place")]
    SnapshotImmutable(RecordId),
}

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
