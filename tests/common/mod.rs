//! Common test utilities.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use vigil::{TelemetryConfig, Transport, TransportError, UploadRequest};

/// One scripted reply for the mock transport.
#[derive(Debug, Clone, Copy)]
pub enum MockResponse {
    Status(u16),
    NetworkError,
}

/// A delivery attempt recorded by the mock transport.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub batch_id: String,
    pub payload: Vec<u8>,
}

/// Transport double: replays a script of responses and records every
/// request it sees.
pub struct MockTransport {
    script: Mutex<VecDeque<MockResponse>>,
    fallback: MockResponse,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl MockTransport {
    /// Always responds 200.
    pub fn ok() -> Arc<Self> {
        Self::scripted(vec![], MockResponse::Status(200))
    }

    /// Always fails with a network error.
    #[allow(dead_code)]
    pub fn failing() -> Arc<Self> {
        Self::scripted(vec![], MockResponse::NetworkError)
    }

    /// Replays `script`, then falls back to `fallback` forever.
    pub fn scripted(script: Vec<MockResponse>, fallback: MockResponse) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            fallback,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: &UploadRequest) -> Result<u16, TransportError> {
        self.requests.lock().unwrap().push(RecordedRequest {
            batch_id: request.batch_id.to_string(),
            payload: request.payload.clone(),
        });

        let response = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.fallback);
        match response {
            MockResponse::Status(code) => Ok(code),
            MockResponse::NetworkError => Err(TransportError::Network(
                "simulated connection failure".to_string(),
            )),
        }
    }
}

/// Poll `cond` until it holds or `deadline` passes.
pub async fn wait_for(deadline: std::time::Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    cond()
}

/// Config tuned for fast tests: tight upload cadence and backoff.
pub fn fast_config(queue_dir: &Path) -> TelemetryConfig {
    let mut config = TelemetryConfig::default();
    config.queue_dir = queue_dir.to_path_buf();
    config.upload.interval_seconds = 1;
    config.upload.initial_backoff_ms = 5;
    config.upload.max_backoff_seconds = 1;
    config.batch.max_age_seconds = 0;
    config
}
