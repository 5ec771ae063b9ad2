//! View tracking.
//!
//! The [`ViewTracker`] handle is cheap to clone and safe to share across
//! any number of instrumentation call sites; every call is forwarded to a
//! single actor task that owns session and view state.

mod actor;
mod view;

pub use actor::BACKGROUND_VIEW_NAME;
pub(crate) use actor::{TrackerActor, TrackerCommand, TrackerConfig};

use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::event::{ActionType, ResourceInfo};

/// Errors from tracker operations.
///
/// Storage and delivery failures never surface here; the only observable
/// error is calling into a pipeline that has shut down.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("view tracker has shut down")]
    Shutdown,
}

/// Handle for reporting view lifecycle and sub-events.
#[derive(Clone)]
pub struct ViewTracker {
    tx: mpsc::Sender<TrackerCommand>,
}

impl ViewTracker {
    pub(crate) fn new(tx: mpsc::Sender<TrackerCommand>) -> Self {
        Self { tx }
    }

    /// Start a new view, stopping any active one.
    ///
    /// Returns the new view's id. Calling twice with the same name produces
    /// two distinct views.
    pub async fn start_view(&self, name: impl Into<String>) -> Result<Uuid, TrackerError> {
        let (reply, rx) = oneshot::channel();
        self.send(TrackerCommand::StartView {
            name: name.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| TrackerError::Shutdown)
    }

    /// Stop the active view. A second stop is a no-op.
    pub async fn stop_view(&self) -> Result<(), TrackerError> {
        let (reply, rx) = oneshot::channel();
        self.send(TrackerCommand::StopView { reply }).await?;
        rx.await.map_err(|_| TrackerError::Shutdown)
    }

    /// Report a user action in the active view.
    pub async fn add_action(&self, action_type: ActionType) -> Result<(), TrackerError> {
        let (reply, rx) = oneshot::channel();
        self.send(TrackerCommand::AddAction { action_type, reply })
            .await?;
        rx.await.map_err(|_| TrackerError::Shutdown)
    }

    /// Report a completed resource load in the active view.
    pub async fn add_resource(&self, resource: ResourceInfo) -> Result<(), TrackerError> {
        let (reply, rx) = oneshot::channel();
        self.send(TrackerCommand::AddResource { resource, reply })
            .await?;
        rx.await.map_err(|_| TrackerError::Shutdown)
    }

    /// Report an error in the active view.
    pub async fn add_error(
        &self,
        message: impl Into<String>,
        source: Option<String>,
    ) -> Result<(), TrackerError> {
        let (reply, rx) = oneshot::channel();
        self.send(TrackerCommand::AddError {
            message: message.into(),
            source,
            reply,
        })
        .await?;
        rx.await.map_err(|_| TrackerError::Shutdown)
    }

    /// Report a main-thread stall in the active view.
    pub async fn add_long_task(&self, duration: Duration) -> Result<(), TrackerError> {
        let (reply, rx) = oneshot::channel();
        self.send(TrackerCommand::AddLongTask { duration, reply })
            .await?;
        rx.await.map_err(|_| TrackerError::Shutdown)
    }

    /// Seal the open batch so buffered events become uploadable now.
    pub async fn flush(&self) -> Result<(), TrackerError> {
        let (reply, rx) = oneshot::channel();
        self.send(TrackerCommand::Flush { reply }).await?;
        rx.await.map_err(|_| TrackerError::Shutdown)
    }

    async fn send(&self, cmd: TrackerCommand) -> Result<(), TrackerError> {
        self.tx.send(cmd).await.map_err(|_| TrackerError::Shutdown)
    }
}
