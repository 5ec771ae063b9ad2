//! Batch upload engine: transport boundary, delivery state machine, and
//! the cadence that drives them.

mod scheduler;
mod transport;
mod uploader;

pub use scheduler::UploadGate;
pub use transport::{HttpTransport, Transport, TransportError, UploadRequest};

pub(crate) use scheduler::UploadScheduler;
pub(crate) use uploader::Uploader;
