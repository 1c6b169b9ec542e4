use thiserror::Error;

use blobsync_model::ModelError;

#[derive(Error, Debug)]
pub enum ReplicationError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid policy: {0}")]
    InvalidPolicy(String),

    #[error("Policy not found: {0}")]
    PolicyNotFound(String),

    #[error("Watcher is stopped")]
    WatcherStopped,

    #[error("Change log rotation failed: {0}")]
    ChangeLogRotation(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<ModelError> for ReplicationError {
    fn from(err: ModelError) -> Self {
        match err {
            ModelError::InvalidPolicy(msg) => {
                ReplicationError::InvalidPolicy(msg)
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, ReplicationError>;
