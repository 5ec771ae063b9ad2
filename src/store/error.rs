//! Event store error types.

use std::io::ErrorKind;
use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur in the durable event queue.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Failed to read or write a queue file.
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The local disk is out of space.
    #[error("storage full at {path}")]
    StorageFull { path: PathBuf },

    /// Failed to serialize an event to JSON. Retrying would fail
    /// identically, so the event is dropped.
    #[error("json serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    /// Create an I/O error with the given path, classifying disk-full
    /// separately.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == ErrorKind::StorageFull {
            Self::StorageFull { path }
        } else {
            Self::Io { path, source }
        }
    }
}
