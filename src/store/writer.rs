//! JSONL batch writer.
//!
//! Appends event records as JSON lines to the open batch file. Each append
//! is followed by fsync, so an event is durable before `write` returns to
//! the producer; there is no buffered window that a crash could lose.

use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

use super::error::{Result, StoreError};
use crate::event::EventRecord;

/// Writes event records to an open batch file.
pub struct BatchWriter {
    file: File,
    path: PathBuf,
    size_bytes: u64,
    event_count: usize,
}

impl BatchWriter {
    /// Create the batch file and open it for appending.
    ///
    /// The file must not already exist; batch ids are unique per batch.
    pub async fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| StoreError::io(path, e))?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
            size_bytes: 0,
            event_count: 0,
        })
    }

    /// Append one event as a JSON line and fsync.
    pub async fn append(&mut self, record: &EventRecord) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        self.file
            .write_all(line.as_bytes())
            .await
            .map_err(|e| StoreError::io(&self.path, e))?;

        self.file
            .sync_all()
            .await
            .map_err(|e| StoreError::io(&self.path, e))?;

        self.size_bytes += line.len() as u64;
        self.event_count += 1;
        Ok(())
    }

    /// Bytes written so far.
    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Events written so far.
    #[must_use]
    pub fn event_count(&self) -> usize {
        self.event_count
    }
}
