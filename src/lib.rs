//! Vigil - the telemetry core of a client-side monitoring SDK: view and
//! session tracking, a durable local event queue, and batched delivery
//! with retry to a remote collector.

// ============================================================================
// Core Infrastructure
// ============================================================================

pub mod clock;
pub mod config;
pub mod diagnostics;
pub mod event;

// ============================================================================
// Domain
// ============================================================================

pub mod session;
pub mod store;
pub mod telemetry;
pub mod tracker;
pub mod upload;

// ============================================================================
// Re-exports
// ============================================================================

pub use config::{ConfigError, OrphanPolicy, TelemetryConfig};
pub use diagnostics::DiagnosticsSnapshot;
pub use event::{ActionType, EventPayload, EventRecord, ResourceInfo};
pub use store::{BatchStore, StoreError, UploadBatch};
pub use telemetry::Telemetry;
pub use tracker::{TrackerError, ViewTracker};
pub use upload::{HttpTransport, Transport, TransportError, UploadGate, UploadRequest};
