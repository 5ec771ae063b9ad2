//! Tracker actor: serialized mutations of the active view.
//!
//! All instrumentation call sites funnel into one actor task via message
//! passing, which linearizes every mutation of the active view. Document
//! versions are therefore emitted in exactly the order mutations arrive,
//! with no partial states visible anywhere.
//!
//! Failures stay local: a storage error is logged and counted, never
//! returned to the producer that reported the event.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::clock::{Clock, IdGenerator};
use crate::config::OrphanPolicy;
use crate::diagnostics::Diagnostics;
use crate::event::{ActionType, EventPayload, EventRecord, ResourceInfo};
use crate::session::{Session, SessionManager};
use crate::store::{BatchStore, StoreError};

use super::view::ViewState;

/// Name of the implicit view used by [`OrphanPolicy::BackgroundView`].
pub const BACKGROUND_VIEW_NAME: &str = "background";

/// Channel capacity for tracker commands.
///
/// Sized for bursts of instrumentation callbacks; when full, producers
/// briefly backpressure on local processing, never on network I/O.
const CHANNEL_CAPACITY: usize = 256;

/// Commands that can be sent to the tracker actor.
pub(crate) enum TrackerCommand {
    StartView {
        name: String,
        reply: oneshot::Sender<Uuid>,
    },
    StopView {
        reply: oneshot::Sender<()>,
    },
    AddAction {
        action_type: ActionType,
        reply: oneshot::Sender<()>,
    },
    AddResource {
        resource: ResourceInfo,
        reply: oneshot::Sender<()>,
    },
    AddError {
        message: String,
        source: Option<String>,
        reply: oneshot::Sender<()>,
    },
    AddLongTask {
        duration: Duration,
        reply: oneshot::Sender<()>,
    },
    Flush {
        reply: oneshot::Sender<()>,
    },
}

/// Configuration for spawning the tracker actor.
pub(crate) struct TrackerConfig {
    pub sessions: SessionManager,
    pub store: Arc<BatchStore>,
    pub diagnostics: Arc<Diagnostics>,
    pub clock: Arc<dyn Clock>,
    pub ids: Arc<dyn IdGenerator>,
    pub orphan_policy: OrphanPolicy,
}

/// The actor owning session state and the active view.
pub(crate) struct TrackerActor {
    sessions: SessionManager,
    view: Option<ViewState>,
    store: Arc<BatchStore>,
    diagnostics: Arc<Diagnostics>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    orphan_policy: OrphanPolicy,
    command_rx: mpsc::Receiver<TrackerCommand>,
    shutdown_rx: watch::Receiver<bool>,
}

impl TrackerActor {
    /// Spawn the actor task.
    ///
    /// Returns the command sender and the task handle.
    pub fn spawn(
        config: TrackerConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> (mpsc::Sender<TrackerCommand>, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

        let actor = Self {
            sessions: config.sessions,
            view: None,
            store: config.store,
            diagnostics: config.diagnostics,
            clock: config.clock,
            ids: config.ids,
            orphan_policy: config.orphan_policy,
            command_rx: rx,
            shutdown_rx,
        };

        let handle = tokio::spawn(actor.run());
        (tx, handle)
    }

    async fn run(mut self) {
        debug!("view tracker started");

        loop {
            tokio::select! {
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        debug!("view tracker received shutdown signal");
                        self.drain_commands().await;
                        self.finalize().await;
                        break;
                    }
                }

                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(command) => self.handle_command(command).await,
                        None => {
                            debug!("all tracker handles dropped, shutting down");
                            self.finalize().await;
                            break;
                        }
                    }
                }
            }
        }

        debug!("view tracker stopped");
    }

    /// Process all queued commands before shutdown.
    async fn drain_commands(&mut self) {
        while let Ok(cmd) = self.command_rx.try_recv() {
            self.handle_command(cmd).await;
        }
    }

    /// Close the active view and seal the open batch.
    async fn finalize(&mut self) {
        if let Some(view) = self.view.take() {
            self.finish_view(view).await;
        }
        if let Err(e) = self.store.seal_current().await {
            warn!(error = %e, "failed to seal batch on shutdown");
            self.diagnostics.record_storage_error();
        }
    }

    async fn handle_command(&mut self, cmd: TrackerCommand) {
        match cmd {
            TrackerCommand::StartView { name, reply } => {
                let id = self.start_view(name).await;
                let _ = reply.send(id);
            }
            TrackerCommand::StopView { reply } => {
                self.stop_view().await;
                let _ = reply.send(());
            }
            TrackerCommand::AddAction { action_type, reply } => {
                self.add_action(action_type).await;
                let _ = reply.send(());
            }
            TrackerCommand::AddResource { resource, reply } => {
                self.add_resource(resource).await;
                let _ = reply.send(());
            }
            TrackerCommand::AddError {
                message,
                source,
                reply,
            } => {
                self.add_error(message, source).await;
                let _ = reply.send(());
            }
            TrackerCommand::AddLongTask { duration, reply } => {
                self.add_long_task(duration).await;
                let _ = reply.send(());
            }
            TrackerCommand::Flush { reply } => {
                if let Err(e) = self.store.seal_current().await {
                    warn!(error = %e, "failed to seal batch on flush");
                    self.diagnostics.record_storage_error();
                }
                let _ = reply.send(());
            }
        }
    }

    // ------------------------------------------------------------------------
    // View lifecycle
    // ------------------------------------------------------------------------

    async fn start_view(&mut self, name: String) -> Uuid {
        let session = self.refresh_session(false).await;
        if let Some(previous) = self.view.take() {
            self.finish_view(previous).await;
        }
        self.open_view(name, &session).await
    }

    async fn stop_view(&mut self) {
        self.refresh_session(false).await;
        match self.view.take() {
            Some(view) => self.finish_view(view).await,
            None => debug!("stop_view with no active view, ignoring"),
        }
    }

    async fn open_view(&mut self, name: String, session: &Session) -> Uuid {
        self.sessions.note_view_started();
        let mut view = ViewState::new(
            self.ids.next_id(),
            name,
            session.id,
            session.sampled_in,
            self.clock.monotonic(),
        );
        view.next_version();
        debug!(view_id = %view.id, name = %view.name, "view started");

        let snapshot = view.snapshot(self.clock.now(), self.clock.monotonic());
        let sampled = view.sampled_in;
        let id = view.id;
        self.view = Some(view);
        self.emit(snapshot, sampled).await;
        id
    }

    /// Emit the terminal snapshot for a view and discard its state.
    async fn finish_view(&mut self, mut view: ViewState) {
        view.next_version();
        view.is_active = false;
        let snapshot = view.snapshot(self.clock.now(), self.clock.monotonic());
        debug!(
            view_id = %view.id,
            document_version = view.document_version,
            "view stopped"
        );
        self.emit(snapshot, view.sampled_in).await;
    }

    /// Refresh the session before a mutation.
    ///
    /// On renewal the active view is closed under its original session id;
    /// with `reopen_on_renewal` a view of the same name is reopened under
    /// the new session so the pending sub-event has a home.
    async fn refresh_session(&mut self, reopen_on_renewal: bool) -> Session {
        let touch = self.sessions.touch();
        if touch.renewed {
            if let Some(view) = self.view.take() {
                let name = view.name.clone();
                debug!(
                    old_session = %view.session_id,
                    new_session = %touch.session.id,
                    "session expired, closing view under old session"
                );
                self.finish_view(view).await;
                if reopen_on_renewal {
                    self.open_view(name, &touch.session).await;
                }
            }
        }
        touch.session
    }

    /// Make sure a view exists for a sub-event, per the orphan policy.
    ///
    /// Returns false if the event should be dropped.
    async fn ensure_view(&mut self, session: &Session) -> bool {
        if self.view.is_some() {
            return true;
        }
        match self.orphan_policy {
            OrphanPolicy::Drop => {
                self.diagnostics.record_dropped_event();
                debug!("sub-event with no active view dropped");
                false
            }
            OrphanPolicy::BackgroundView => {
                self.open_view(BACKGROUND_VIEW_NAME.to_string(), session)
                    .await;
                true
            }
        }
    }

    // ------------------------------------------------------------------------
    // Sub-events
    // ------------------------------------------------------------------------

    async fn add_action(&mut self, action_type: ActionType) {
        let session = self.refresh_session(true).await;
        if !self.ensure_view(&session).await {
            return;
        }
        let (sub, sampled) = {
            let view = self.view.as_mut().expect("active view ensured");
            view.action_count += 1;
            let record = EventRecord::new(
                self.clock.now(),
                view.session_id,
                view.id,
                EventPayload::Action { action_type },
            );
            (record, view.sampled_in)
        };
        self.emit(sub, sampled).await;
        self.bump_and_snapshot().await;
    }

    async fn add_resource(&mut self, resource: ResourceInfo) {
        let session = self.refresh_session(true).await;
        if !self.ensure_view(&session).await {
            return;
        }
        let (sub, sampled) = {
            let view = self.view.as_mut().expect("active view ensured");
            view.resource_count += 1;
            let record = EventRecord::new(
                self.clock.now(),
                view.session_id,
                view.id,
                EventPayload::Resource {
                    url: resource.url,
                    method: resource.method,
                    status_code: resource.status_code,
                    duration_ms: resource.duration.as_millis() as u64,
                    error: resource.error,
                },
            );
            (record, view.sampled_in)
        };
        self.emit(sub, sampled).await;
        self.bump_and_snapshot().await;
    }

    async fn add_error(&mut self, message: String, source: Option<String>) {
        let session = self.refresh_session(true).await;
        if !self.ensure_view(&session).await {
            return;
        }
        let (sub, sampled) = {
            let view = self.view.as_mut().expect("active view ensured");
            view.error_count += 1;
            let record = EventRecord::new(
                self.clock.now(),
                view.session_id,
                view.id,
                EventPayload::Error { message, source },
            );
            (record, view.sampled_in)
        };
        self.emit(sub, sampled).await;
        self.bump_and_snapshot().await;
    }

    async fn add_long_task(&mut self, duration: Duration) {
        let session = self.refresh_session(true).await;
        if !self.ensure_view(&session).await {
            return;
        }
        let (sub, sampled) = {
            let view = self.view.as_mut().expect("active view ensured");
            view.long_task_count += 1;
            let record = EventRecord::new(
                self.clock.now(),
                view.session_id,
                view.id,
                EventPayload::LongTask {
                    duration_ms: duration.as_millis() as u64,
                },
            );
            (record, view.sampled_in)
        };
        self.emit(sub, sampled).await;
        self.bump_and_snapshot().await;
    }

    /// Bump the active view's version and emit the updated snapshot.
    async fn bump_and_snapshot(&mut self) {
        let (snapshot, sampled) = {
            let now = self.clock.now();
            let mono = self.clock.monotonic();
            let view = self.view.as_mut().expect("active view present");
            view.next_version();
            (view.snapshot(now, mono), view.sampled_in)
        };
        self.emit(snapshot, sampled).await;
    }

    /// Hand an event to the store. Failures are terminal here: logged,
    /// counted, and invisible to the producer.
    async fn emit(&self, record: EventRecord, sampled: bool) {
        if !sampled {
            return;
        }
        if let Err(e) = self.store.write(&record).await {
            warn!(error = %e, "failed to persist event");
            match e {
                StoreError::Serialize(_) => self.diagnostics.record_dropped_event(),
                _ => self.diagnostics.record_storage_error(),
            }
        }
    }
}
