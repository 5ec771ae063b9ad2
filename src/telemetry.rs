//! Pipeline wiring and public facade.
//!
//! [`Telemetry::start`] recovers the durable queue, spawns the tracker
//! actor and the upload scheduler, and hands back a facade for the
//! instrumentation API, host-environment signals, and graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::clock::{Clock, IdGenerator, RandomIds, SystemClock};
use crate::config::TelemetryConfig;
use crate::diagnostics::{Diagnostics, DiagnosticsSnapshot};
use crate::event::{ActionType, ResourceInfo};
use crate::session::SessionManager;
use crate::store::{BatchLimits, BatchStore, StoreError};
use crate::tracker::{TrackerActor, TrackerConfig, TrackerError, ViewTracker};
use crate::upload::{Transport, UploadGate, UploadScheduler, Uploader};

/// Handle to a running telemetry pipeline.
pub struct Telemetry {
    tracker: ViewTracker,
    diagnostics: Arc<Diagnostics>,
    gate_tx: watch::Sender<UploadGate>,
    shutdown_tx: watch::Sender<bool>,
    tracker_task: JoinHandle<()>,
    scheduler_task: JoinHandle<()>,
}

impl Telemetry {
    /// Start the pipeline with the system clock and random ids.
    pub async fn start(
        config: TelemetryConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, StoreError> {
        Self::start_with(
            config,
            transport,
            Arc::new(SystemClock::new()),
            Arc::new(RandomIds),
        )
        .await
    }

    /// Start the pipeline with injected time and id sources.
    ///
    /// Batches left behind by a previous run are recovered as uploadable
    /// before any new event is accepted.
    pub async fn start_with(
        config: TelemetryConfig,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
    ) -> Result<Self, StoreError> {
        let store = Arc::new(
            BatchStore::open(config.queue_dir.clone(), BatchLimits::from(&config.batch)).await?,
        );
        let diagnostics = Arc::new(Diagnostics::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (gate_tx, gate_rx) = watch::channel(UploadGate::default());

        let sessions = SessionManager::new(
            &config.session,
            config.sampling_rate,
            clock.clone(),
            ids.clone(),
        );
        let (tracker_tx, tracker_task) = TrackerActor::spawn(
            TrackerConfig {
                sessions,
                store: store.clone(),
                diagnostics: diagnostics.clone(),
                clock,
                ids,
                orphan_policy: config.orphan_policy,
            },
            shutdown_rx.clone(),
        );

        let uploader = Uploader::new(
            store.clone(),
            transport,
            diagnostics.clone(),
            &config.upload,
        );
        let scheduler_task = UploadScheduler::new(
            uploader,
            config.upload.interval(),
            config.upload.allow_background,
            gate_rx,
            shutdown_rx,
        )
        .spawn();

        debug!("telemetry pipeline started");
        Ok(Self {
            tracker: ViewTracker::new(tracker_tx),
            diagnostics,
            gate_tx,
            shutdown_tx,
            tracker_task,
            scheduler_task,
        })
    }

    /// A cloneable tracker handle for instrumentation call sites.
    #[must_use]
    pub fn tracker(&self) -> ViewTracker {
        self.tracker.clone()
    }

    /// Start a new view, stopping any active one. Returns the view id.
    pub async fn start_view(&self, name: impl Into<String>) -> Result<Uuid, TrackerError> {
        self.tracker.start_view(name).await
    }

    /// Stop the active view.
    pub async fn stop_view(&self) -> Result<(), TrackerError> {
        self.tracker.stop_view().await
    }

    /// Report a user action in the active view.
    pub async fn add_action(&self, action_type: ActionType) -> Result<(), TrackerError> {
        self.tracker.add_action(action_type).await
    }

    /// Report a completed resource load in the active view.
    pub async fn add_resource(&self, resource: ResourceInfo) -> Result<(), TrackerError> {
        self.tracker.add_resource(resource).await
    }

    /// Report an error in the active view.
    pub async fn add_error(
        &self,
        message: impl Into<String>,
        source: Option<String>,
    ) -> Result<(), TrackerError> {
        self.tracker.add_error(message, source).await
    }

    /// Report a main-thread stall in the active view.
    pub async fn add_long_task(&self, duration: Duration) -> Result<(), TrackerError> {
        self.tracker.add_long_task(duration).await
    }

    /// Seal the open batch so buffered events become uploadable now.
    pub async fn flush(&self) -> Result<(), TrackerError> {
        self.tracker.flush().await
    }

    /// Host signal: network reachability changed.
    pub fn set_network_reachable(&self, reachable: bool) {
        self.gate_tx
            .send_modify(|gate| gate.network_reachable = reachable);
    }

    /// Host signal: app moved to foreground/background.
    pub fn set_app_foreground(&self, foreground: bool) {
        self.gate_tx
            .send_modify(|gate| gate.app_foreground = foreground);
    }

    /// Current SDK-internal counters.
    #[must_use]
    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    /// Shut the pipeline down cleanly.
    ///
    /// The active view is closed, the open batch is sealed, and both
    /// background tasks are joined. An in-flight upload either completes or
    /// its batch stays in the store and resumes on next start.
    pub async fn shutdown(self) {
        debug!("telemetry pipeline shutting down");
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.tracker_task.await {
            warn!(error = %e, "tracker task failed during shutdown");
        }
        if let Err(e) = self.scheduler_task.await {
            warn!(error = %e, "scheduler task failed during shutdown");
        }
    }
}
