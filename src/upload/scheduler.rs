//! Upload cadence and host-environment gating.
//!
//! A background task ticks on a base interval, draining at most one batch
//! per tick. Catch-up is immediate when more batches are pending, retry
//! delays stretch the next tick instead, and ticks are skipped entirely
//! while the host reports the network down or the app backgrounded
//! (unless background uploads are allowed).

use std::time::Duration;

use tokio::sync::watch;
use tracing::debug;

use super::uploader::{DrainOutcome, Uploader};

/// Host-environment signals gating uploads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadGate {
    pub network_reachable: bool,
    pub app_foreground: bool,
}

impl Default for UploadGate {
    fn default() -> Self {
        Self {
            network_reachable: true,
            app_foreground: true,
        }
    }
}

/// Periodic driver for the uploader.
pub(crate) struct UploadScheduler {
    uploader: Uploader,
    interval: Duration,
    allow_background: bool,
    gate_rx: watch::Receiver<UploadGate>,
    shutdown_rx: watch::Receiver<bool>,
}

impl UploadScheduler {
    pub fn new(
        uploader: Uploader,
        interval: Duration,
        allow_background: bool,
        gate_rx: watch::Receiver<UploadGate>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            uploader,
            interval,
            allow_background,
            gate_rx,
            shutdown_rx,
        }
    }

    /// Spawn the scheduler task.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        debug!("upload scheduler started");

        let mut delay = self.interval;
        loop {
            tokio::select! {
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        break;
                    }
                }

                changed = self.gate_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    // Re-check promptly when the host reopens the gate.
                    if self.gate_open() {
                        delay = Duration::ZERO;
                    }
                }

                _ = tokio::time::sleep(delay) => {
                    if !self.gate_open() {
                        delay = self.interval;
                        continue;
                    }
                    delay = match self.uploader.drain_one().await {
                        DrainOutcome::Resolved { more_pending: true } => Duration::ZERO,
                        DrainOutcome::Resolved { more_pending: false } | DrainOutcome::Idle => {
                            self.interval
                        }
                        DrainOutcome::Backoff(backoff) => backoff,
                    };
                }
            }
        }

        // An in-flight attempt has already completed or released its batch
        // by this point; anything unresolved resumes on next start.
        debug!("upload scheduler stopped");
    }

    fn gate_open(&self) -> bool {
        let gate = *self.gate_rx.borrow();
        gate.network_reachable && (gate.app_foreground || self.allow_background)
    }
}
