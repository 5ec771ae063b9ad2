//! Upload transport boundary.
//!
//! The uploader only needs "send bytes, get a status code or a network
//! failure"; everything HTTP-specific lives behind the [`Transport`] trait
//! so tests can script responses without a collector.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use ulid::Ulid;

use crate::config::TelemetryConfig;

/// Source tag sent with every upload.
const SOURCE: &str = "vigil-rust";

/// Errors from a delivery attempt that never reached a status code.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection failure or timeout. Always retryable.
    #[error("network failure: {0}")]
    Network(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        Self::Network(e.to_string())
    }
}

/// One delivery attempt for a sealed batch.
///
/// Everything here is a pure function of the batch and startup config, so
/// retries of the same batch are byte-identical (headers included), which
/// lets the collector deduplicate on the batch id.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub batch_id: Ulid,
    /// Creation time of the batch, not of the attempt.
    pub batch_time: DateTime<Utc>,
    /// Newline-delimited serialized event records.
    pub payload: Vec<u8>,
}

/// Capability to deliver a batch to the collector.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Attempt delivery; returns the HTTP status code, or a network error
    /// if no response arrived within the bounded timeout.
    async fn send(&self, request: &UploadRequest) -> Result<u16, TransportError>;
}

/// Production transport: HTTP POST to the collector endpoint.
pub struct HttpTransport {
    http: reqwest::Client,
    endpoint: String,
    tags: String,
}

impl HttpTransport {
    /// Build a transport from the configuration snapshot.
    pub fn new(config: &TelemetryConfig) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .timeout(config.upload.request_timeout())
            .build()?;

        Ok(Self {
            http,
            endpoint: config.endpoint.clone(),
            tags: config.tags(),
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &UploadRequest) -> Result<u16, TransportError> {
        let response = self
            .http
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .header("x-vigil-source", SOURCE)
            .header("x-vigil-tags", &self.tags)
            .header("x-vigil-batch-id", request.batch_id.to_string())
            .header(
                "x-vigil-batch-time",
                request.batch_time.timestamp_millis().to_string(),
            )
            .body(request.payload.clone())
            .send()
            .await?;

        Ok(response.status().as_u16())
    }
}
