//! Event records for durable queueing and upload.
//!
//! Events are immutable value objects: once emitted by the tracker they are
//! appended to a batch file and never touched again. View events carry a
//! per-view `document_version`; the collector treats the payload with the
//! highest version as the view's current state, so versions must be emitted
//! as a contiguous increasing sequence per view.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single telemetry event, serialized as one JSON line in a batch file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    /// When the event was emitted.
    pub timestamp: DateTime<Utc>,
    /// Session the event belongs to.
    pub session_id: Uuid,
    /// View the event belongs to.
    pub view_id: Uuid,
    /// The event payload.
    #[serde(flatten)]
    pub payload: EventPayload,
}

/// The payload of an event record.
///
/// `View` payloads are versioned snapshots; the rest are emitted exactly
/// once and carry no version.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// Snapshot of a view's state after a mutation.
    View {
        name: String,
        document_version: u64,
        is_active: bool,
        duration_ms: u64,
        action_count: u32,
        resource_count: u32,
        error_count: u32,
        long_task_count: u32,
    },
    /// A user action within the view.
    Action { action_type: ActionType },
    /// A completed network resource load.
    Resource {
        url: String,
        method: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        status_code: Option<u16>,
        duration_ms: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// An error observed in the host application.
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        source: Option<String>,
    },
    /// A main-thread stall.
    LongTask { duration_ms: u64 },
}

/// Kind of user action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Tap,
    Click,
    Scroll,
    Swipe,
    Custom,
}

/// A completed resource load as handed over by the network-instrumentation
/// collaborator. The tracker stamps it with session/view context and a
/// timestamp before it is persisted.
#[derive(Debug, Clone)]
pub struct ResourceInfo {
    pub url: String,
    pub method: String,
    pub status_code: Option<u16>,
    pub duration: std::time::Duration,
    pub error: Option<String>,
}

impl EventRecord {
    /// Create a new event record with the given context.
    #[must_use]
    pub fn new(
        timestamp: DateTime<Utc>,
        session_id: Uuid,
        view_id: Uuid,
        payload: EventPayload,
    ) -> Self {
        Self {
            timestamp,
            session_id,
            view_id,
            payload,
        }
    }

    /// The view snapshot version, for view events only.
    #[must_use]
    pub fn document_version(&self) -> Option<u64> {
        match &self.payload {
            EventPayload::View {
                document_version, ..
            } => Some(*document_version),
            _ => None,
        }
    }
}
