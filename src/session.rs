//! Session lifecycle and sampling.
//!
//! A session groups a period of continuous activity. It expires after a
//! fixed inactivity gap or a fixed maximum age, whichever comes first, and
//! renewal mints a new id with a fresh sampling decision. The manager is
//! owned exclusively by the tracker actor, so it needs no interior locking;
//! callers receive copies of the session state, never references into it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tracing::debug;
use uuid::Uuid;

use crate::clock::{Clock, IdGenerator};
use crate::config::SessionConfig;

/// A bounded period of continuous user activity.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    /// Id of the session this one renewed, if any. Links renewed sessions
    /// for continuity.
    pub previous_id: Option<Uuid>,
    pub started_at: DateTime<Utc>,
    /// Sampling decision, made once at creation and fixed for the session's
    /// lifetime. Non-sampled sessions are tracked but their events are not
    /// persisted.
    pub sampled_in: bool,
    pub view_count: u32,
    started_mono: Duration,
    last_activity_mono: Duration,
}

/// Result of refreshing the session before a mutation.
#[derive(Debug)]
pub struct SessionTouch {
    /// The session the upcoming mutation belongs to.
    pub session: Session,
    /// True when an expired session was just replaced. The caller must
    /// close any active view under its original session id before applying
    /// the mutation.
    pub renewed: bool,
}

/// Owns session identity, expiry, and the per-session sampling decision.
///
/// Expiry decisions use monotonic elapsed time exclusively; a wall clock
/// jumping backward (device time change) cannot expire or corrupt a
/// session. Wall time is only recorded for timestamps.
pub struct SessionManager {
    inactivity_timeout: Duration,
    max_duration: Duration,
    sampling_rate: f64,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    current: Option<Session>,
}

impl SessionManager {
    pub fn new(
        config: &SessionConfig,
        sampling_rate: f64,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        Self {
            inactivity_timeout: config.inactivity_timeout(),
            max_duration: config.max_duration(),
            sampling_rate,
            clock,
            ids,
            current: None,
        }
    }

    /// Refresh the session for an imminent mutation.
    ///
    /// Returns the live session if it is still within both its inactivity
    /// and max-duration windows; otherwise atomically replaces it and
    /// reports `renewed` so the caller can close views under the old id.
    pub fn touch(&mut self) -> SessionTouch {
        let mono = self.clock.monotonic();

        if let Some(session) = &mut self.current {
            let idle = mono - session.last_activity_mono;
            let age = mono - session.started_mono;
            if idle < self.inactivity_timeout && age < self.max_duration {
                session.last_activity_mono = mono;
                return SessionTouch {
                    session: session.clone(),
                    renewed: false,
                };
            }
        }

        let previous = self.current.take();
        let renewed = previous.is_some();
        let session = self.create_session(previous.as_ref().map(|s| s.id), mono);
        debug!(
            session_id = %session.id,
            sampled_in = session.sampled_in,
            renewed,
            "session started"
        );
        self.current = Some(session.clone());
        SessionTouch { session, renewed }
    }

    /// Record that a view was started under the current session.
    pub fn note_view_started(&mut self) {
        if let Some(session) = &mut self.current {
            session.view_count += 1;
        }
    }

    fn create_session(&self, previous_id: Option<Uuid>, mono: Duration) -> Session {
        Session {
            id: self.ids.next_id(),
            previous_id,
            started_at: self.clock.now(),
            sampled_in: rand::thread_rng().gen::<f64>() < self.sampling_rate,
            view_count: 0,
            started_mono: mono,
            last_activity_mono: mono,
        }
    }
}
