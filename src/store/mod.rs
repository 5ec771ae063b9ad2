//! Durable local event queue.
//!
//! Events are appended to batch files under a single queue directory. A
//! batch is open while the writer appends to it (`{ulid}.ndjson.open`) and
//! sealed by an atomic rename to `{ulid}.ndjson`, the only handoff point
//! between the write path and the upload path, so a reader never observes a
//! half-written batch. The ULID file stem is the batch id: lexicographic
//! order is creation order, and the batch timestamp is derivable from the
//! name without reading file contents.
//!
//! Batch lifecycle is tracked as explicit descriptor state (open, sealed,
//! in flight) in an in-memory index. In-flight is memory-only: after a
//! crash, every surviving file is re-indexed as sealed-but-unsent, which
//! gives at-least-once delivery without extra bookkeeping files.

mod error;
mod writer;

pub use error::{Result, StoreError};
pub use writer::BatchWriter;

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::config::BatchConfig;
use crate::event::EventRecord;

const OPEN_SUFFIX: &str = ".ndjson.open";
const SEALED_SUFFIX: &str = ".ndjson";

/// Seal thresholds for the open batch. Whichever crosses first seals.
#[derive(Debug, Clone, Copy)]
pub struct BatchLimits {
    pub max_events: usize,
    pub max_bytes: u64,
    pub max_age: Duration,
}

impl From<&BatchConfig> for BatchLimits {
    fn from(config: &BatchConfig) -> Self {
        Self {
            max_events: config.max_events,
            max_bytes: config.max_bytes,
            max_age: config.max_age(),
        }
    }
}

/// Lifecycle state of a batch in the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchState {
    Open,
    Sealed,
    InFlight,
}

#[derive(Debug, Clone, Copy)]
struct BatchDescriptor {
    state: BatchState,
    size_bytes: u64,
}

struct OpenBatch {
    id: Ulid,
    writer: BatchWriter,
    opened_at: Instant,
}

/// A sealed batch claimed for upload.
///
/// `payload` is the exact file contents; rereading the sealed file yields
/// byte-identical payloads across retries.
#[derive(Debug, Clone)]
pub struct UploadBatch {
    pub id: Ulid,
    /// Creation time, decoded from the ULID.
    pub created_at: DateTime<Utc>,
    /// Newline-delimited serialized event records.
    pub payload: Vec<u8>,
}

impl UploadBatch {
    /// Number of event records in the payload.
    #[must_use]
    pub fn event_count(&self) -> usize {
        self.payload.iter().filter(|b| **b == b'\n').count()
    }
}

/// The durable event queue: one open batch receiving appends, plus sealed
/// batches awaiting upload.
pub struct BatchStore {
    dir: PathBuf,
    limits: BatchLimits,
    index: DashMap<Ulid, BatchDescriptor>,
    current: Mutex<Option<OpenBatch>>,
    ids: std::sync::Mutex<ulid::Generator>,
}

impl BatchStore {
    /// Open the queue directory, recovering any batches from prior runs.
    ///
    /// Sealed files are indexed as uploadable. A batch left open by a
    /// crashed run is sealed immediately: sealed-but-unsent, never dropped.
    pub async fn open(dir: impl Into<PathBuf>, limits: BatchLimits) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| StoreError::io(&dir, e))?;

        let index = DashMap::new();
        recover(&dir, &index).await?;

        let recovered = index.len();
        if recovered > 0 {
            info!(batches = recovered, "recovered pending batches");
        }

        Ok(Self {
            dir,
            limits,
            index,
            current: Mutex::new(None),
            ids: std::sync::Mutex::new(ulid::Generator::new()),
        })
    }

    /// Append an event to the open batch, creating one if needed.
    ///
    /// The event is durable (fsynced) before this returns. Afterwards the
    /// seal thresholds are applied, so a full batch seals on the write that
    /// fills it.
    pub async fn write(&self, record: &EventRecord) -> Result<()> {
        let mut current = self.current.lock().await;

        if current.is_none() {
            let id = self.next_batch_id();
            let path = self.open_path(id);
            let writer = BatchWriter::create(&path).await?;
            self.index.insert(
                id,
                BatchDescriptor {
                    state: BatchState::Open,
                    size_bytes: 0,
                },
            );
            debug!(batch_id = %id, "opened batch");
            *current = Some(OpenBatch {
                id,
                writer,
                opened_at: Instant::now(),
            });
        }

        let open = current.as_mut().expect("open batch present");
        open.writer.append(record).await?;

        if open.writer.event_count() >= self.limits.max_events
            || open.writer.size_bytes() >= self.limits.max_bytes
        {
            self.seal_locked(&mut current).await?;
        }

        Ok(())
    }

    /// Seal the open batch regardless of thresholds.
    ///
    /// Returns true if a non-empty batch was sealed.
    pub async fn seal_current(&self) -> Result<bool> {
        let mut current = self.current.lock().await;
        self.seal_locked(&mut current).await
    }

    /// Seal the open batch if it has exceeded the max-age threshold.
    pub async fn seal_aged(&self) -> Result<bool> {
        let mut current = self.current.lock().await;
        match current.as_ref() {
            Some(open) if open.opened_at.elapsed() >= self.limits.max_age => {
                self.seal_locked(&mut current).await
            }
            _ => Ok(false),
        }
    }

    /// Claim the oldest sealed batch for upload.
    ///
    /// The batch is marked in flight so a concurrent call cannot return it
    /// again. Callers must resolve the claim with [`BatchStore::delete`] or
    /// [`BatchStore::release`].
    pub async fn next_batch_for_upload(&self) -> Result<Option<UploadBatch>> {
        loop {
            let oldest = self
                .index
                .iter()
                .filter(|e| e.value().state == BatchState::Sealed)
                .map(|e| *e.key())
                .min();
            let Some(id) = oldest else {
                return Ok(None);
            };

            let claimed = match self.index.get_mut(&id) {
                Some(mut entry) if entry.state == BatchState::Sealed => {
                    entry.state = BatchState::InFlight;
                    true
                }
                _ => false,
            };
            if !claimed {
                // Lost the race for this batch; pick again.
                continue;
            }

            let path = self.sealed_path(id);
            let payload = match fs::read(&path).await {
                Ok(p) => p,
                Err(e) => {
                    warn!(batch_id = %id, error = %e, "sealed batch unreadable, dropping");
                    self.index.remove(&id);
                    return Err(StoreError::io(&path, e));
                }
            };

            return Ok(Some(UploadBatch {
                id,
                created_at: DateTime::<Utc>::from(id.datetime()),
                payload,
            }));
        }
    }

    /// Return an in-flight batch to the sealed pool (upload unresolved).
    pub fn release(&self, id: Ulid) {
        if let Some(mut entry) = self.index.get_mut(&id) {
            if entry.state == BatchState::InFlight {
                entry.state = BatchState::Sealed;
            }
        }
    }

    /// Remove a batch permanently. Atomic: a single file removal.
    ///
    /// Safe to call while the writer appends to a different (open) batch.
    pub async fn delete(&self, id: Ulid) -> Result<()> {
        let path = self.sealed_path(id);
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::io(&path, e)),
        }
        self.index.remove(&id);
        Ok(())
    }

    /// Number of sealed batches awaiting upload.
    #[must_use]
    pub fn pending_batches(&self) -> usize {
        self.index
            .iter()
            .filter(|e| e.value().state == BatchState::Sealed)
            .count()
    }

    async fn seal_locked(&self, current: &mut Option<OpenBatch>) -> Result<bool> {
        let Some(open) = current.take() else {
            return Ok(false);
        };
        let OpenBatch { id, writer, .. } = open;

        if writer.event_count() == 0 {
            drop(writer);
            let _ = fs::remove_file(self.open_path(id)).await;
            self.index.remove(&id);
            return Ok(false);
        }

        let size = writer.size_bytes();
        // Close the handle before the rename; every append already fsynced.
        drop(writer);

        let from = self.open_path(id);
        let to = self.sealed_path(id);
        fs::rename(&from, &to)
            .await
            .map_err(|e| StoreError::io(&from, e))?;

        self.index.insert(
            id,
            BatchDescriptor {
                state: BatchState::Sealed,
                size_bytes: size,
            },
        );
        debug!(batch_id = %id, size_bytes = size, "sealed batch");
        Ok(true)
    }

    fn next_batch_id(&self) -> Ulid {
        let mut ids = self.ids.lock().expect("ulid generator lock poisoned");
        // The generator keeps ids monotonic within one millisecond so batch
        // order always matches creation order.
        ids.generate().unwrap_or_else(|_| Ulid::new())
    }

    fn open_path(&self, id: Ulid) -> PathBuf {
        self.dir.join(format!("{id}{OPEN_SUFFIX}"))
    }

    fn sealed_path(&self, id: Ulid) -> PathBuf {
        self.dir.join(format!("{id}{SEALED_SUFFIX}"))
    }
}

/// Scan the queue directory and rebuild the batch index.
async fn recover(dir: &Path, index: &DashMap<Ulid, BatchDescriptor>) -> Result<()> {
    let mut entries = fs::read_dir(dir).await.map_err(|e| StoreError::io(dir, e))?;

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| StoreError::io(dir, e))?
    {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()).map(String::from) else {
            continue;
        };

        if let Some(stem) = name.strip_suffix(OPEN_SUFFIX) {
            let Ok(id) = Ulid::from_string(stem) else {
                warn!(file = %name, "unrecognized file in queue directory");
                continue;
            };
            let size = entry
                .metadata()
                .await
                .map_err(|e| StoreError::io(&path, e))?
                .len();
            if size == 0 {
                let _ = fs::remove_file(&path).await;
                continue;
            }
            let sealed = dir.join(format!("{id}{SEALED_SUFFIX}"));
            fs::rename(&path, &sealed)
                .await
                .map_err(|e| StoreError::io(&path, e))?;
            info!(batch_id = %id, "sealed batch left open by previous run");
            index.insert(
                id,
                BatchDescriptor {
                    state: BatchState::Sealed,
                    size_bytes: size,
                },
            );
        } else if let Some(stem) = name.strip_suffix(SEALED_SUFFIX) {
            let Ok(id) = Ulid::from_string(stem) else {
                warn!(file = %name, "unrecognized file in queue directory");
                continue;
            };
            let size = entry
                .metadata()
                .await
                .map_err(|e| StoreError::io(&path, e))?
                .len();
            if size == 0 {
                let _ = fs::remove_file(&path).await;
                continue;
            }
            index.insert(
                id,
                BatchDescriptor {
                    state: BatchState::Sealed,
                    size_bytes: size,
                },
            );
        } else {
            debug!(file = %name, "ignoring unrecognized file in queue directory");
        }
    }

    Ok(())
}
