//! Mutable state of the active view.

use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::event::{EventPayload, EventRecord};

/// State of the one active view, owned by the tracker actor.
///
/// The document version starts at 0 and is bumped before every snapshot, so
/// the first emitted snapshot carries version 1 and versions for one view
/// form a contiguous increasing sequence.
#[derive(Debug)]
pub(crate) struct ViewState {
    pub id: Uuid,
    pub name: String,
    /// Session the view was opened under; snapshots keep using it even if
    /// the manager has since renewed the session.
    pub session_id: Uuid,
    /// Sampling decision inherited from that session.
    pub sampled_in: bool,
    pub started_mono: Duration,
    pub document_version: u64,
    pub is_active: bool,
    pub action_count: u32,
    pub resource_count: u32,
    pub error_count: u32,
    pub long_task_count: u32,
}

impl ViewState {
    pub fn new(
        id: Uuid,
        name: String,
        session_id: Uuid,
        sampled_in: bool,
        started_mono: Duration,
    ) -> Self {
        Self {
            id,
            name,
            session_id,
            sampled_in,
            started_mono,
            document_version: 0,
            is_active: true,
            action_count: 0,
            resource_count: 0,
            error_count: 0,
            long_task_count: 0,
        }
    }

    /// Bump and return the next document version.
    pub fn next_version(&mut self) -> u64 {
        self.document_version += 1;
        self.document_version
    }

    /// Build the versioned snapshot event for the current state.
    pub fn snapshot(&self, timestamp: DateTime<Utc>, now_mono: Duration) -> EventRecord {
        let duration = now_mono.saturating_sub(self.started_mono);
        EventRecord::new(
            timestamp,
            self.session_id,
            self.id,
            EventPayload::View {
                name: self.name.clone(),
                document_version: self.document_version,
                is_active: self.is_active,
                duration_ms: duration.as_millis() as u64,
                action_count: self.action_count,
                resource_count: self.resource_count,
                error_count: self.error_count,
                long_task_count: self.long_task_count,
            },
        )
    }
}
