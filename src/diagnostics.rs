//! SDK-internal health counters.
//!
//! Delivery problems are invisible to the host application; they surface
//! only here and through log output. Counters are monotonic for the
//! lifetime of the pipeline.

use std::sync::atomic::{AtomicU64, Ordering};

/// Shared counter set for the whole pipeline.
#[derive(Debug, Default)]
pub struct Diagnostics {
    events_dropped: AtomicU64,
    storage_errors: AtomicU64,
    batches_delivered: AtomicU64,
    batches_rejected: AtomicU64,
    batches_abandoned: AtomicU64,
    upload_retries: AtomicU64,
}

impl Diagnostics {
    pub(crate) fn record_dropped_event(&self) {
        self.events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_storage_error(&self) {
        self.storage_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_batch_delivered(&self) {
        self.batches_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_batch_rejected(&self) {
        self.batches_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_batch_abandoned(&self) {
        self.batches_abandoned.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_upload_retry(&self) {
        self.upload_retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Current counter values.
    #[must_use]
    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            storage_errors: self.storage_errors.load(Ordering::Relaxed),
            batches_delivered: self.batches_delivered.load(Ordering::Relaxed),
            batches_rejected: self.batches_rejected.load(Ordering::Relaxed),
            batches_abandoned: self.batches_abandoned.load(Ordering::Relaxed),
            upload_retries: self.upload_retries.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiagnosticsSnapshot {
    /// Events discarded without reaching the store (orphan policy,
    /// serialization failure).
    pub events_dropped: u64,
    /// Store writes that failed (disk full, I/O error).
    pub storage_errors: u64,
    /// Batches acknowledged by the collector.
    pub batches_delivered: u64,
    /// Batches the collector refused as malformed (4xx, not retried).
    pub batches_rejected: u64,
    /// Batches dropped after exhausting the retry budget: permanent data
    /// loss.
    pub batches_abandoned: u64,
    /// Individual delivery attempts that failed and were rescheduled.
    pub upload_retries: u64,
}
