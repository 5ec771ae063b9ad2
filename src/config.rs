//! Telemetry configuration.
//!
//! Loaded once at startup and treated as an immutable snapshot; there is no
//! hot reload. Every field has a default so a missing or partial config file
//! still yields a working pipeline.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

// -----------------------------------------------------------------------------
// TelemetryConfig (root)
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    /// Service name reported in upload tags.
    #[serde(default = "default_service")]
    pub service: String,
    /// Deployment environment reported in upload tags.
    #[serde(default = "default_env")]
    pub env: String,
    /// Application version reported in upload tags.
    #[serde(default = "default_version")]
    pub version: String,
    /// Collector endpoint for batch uploads.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Directory holding the durable event queue.
    #[serde(default = "default_queue_dir")]
    pub queue_dir: PathBuf,
    /// Probability in `[0, 1]` that a new session is sampled in.
    #[serde(default = "default_sampling_rate")]
    pub sampling_rate: f64,
    /// What to do with sub-events reported while no view is active.
    #[serde(default)]
    pub orphan_policy: OrphanPolicy,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub upload: UploadConfig,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service: default_service(),
            env: default_env(),
            version: default_version(),
            endpoint: default_endpoint(),
            queue_dir: default_queue_dir(),
            sampling_rate: default_sampling_rate(),
            orphan_policy: OrphanPolicy::default(),
            session: SessionConfig::default(),
            batch: BatchConfig::default(),
            upload: UploadConfig::default(),
        }
    }
}

impl TelemetryConfig {
    /// Load configuration from a YAML file.
    ///
    /// A missing file yields the defaults; a malformed file is an error.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(ConfigError::Io(e)),
        };
        serde_saphyr::from_str(&contents).map_err(ConfigError::Yaml)
    }

    /// Tags string sent with every upload: `service:x,env:y,version:z`.
    #[must_use]
    pub fn tags(&self) -> String {
        format!(
            "service:{},env:{},version:{}",
            self.service, self.env, self.version
        )
    }
}

fn default_service() -> String {
    "unknown-service".to_string()
}

fn default_env() -> String {
    "production".to_string()
}

fn default_version() -> String {
    "0.0.0".to_string()
}

fn default_endpoint() -> String {
    "http://localhost:8080/v1/input".to_string()
}

fn default_queue_dir() -> PathBuf {
    PathBuf::from(".vigil/queue")
}

fn default_sampling_rate() -> f64 {
    1.0
}

// -----------------------------------------------------------------------------
// OrphanPolicy
// -----------------------------------------------------------------------------

/// Policy for sub-events (actions, resources, errors, long tasks) reported
/// while no view is active.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrphanPolicy {
    /// Discard the event and bump the dropped-events diagnostic counter.
    #[default]
    Drop,
    /// Start an implicit view named `background` and attribute the event
    /// to it.
    BackgroundView,
}

// -----------------------------------------------------------------------------
// SessionConfig
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// A session expires after this much inactivity.
    #[serde(default = "default_inactivity_timeout")]
    pub inactivity_timeout_seconds: u64,
    /// A session expires after this total age regardless of activity.
    #[serde(default = "default_max_duration")]
    pub max_duration_seconds: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout_seconds: default_inactivity_timeout(),
            max_duration_seconds: default_max_duration(),
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_seconds)
    }

    #[must_use]
    pub fn max_duration(&self) -> Duration {
        Duration::from_secs(self.max_duration_seconds)
    }
}

fn default_inactivity_timeout() -> u64 {
    15 * 60
}

fn default_max_duration() -> u64 {
    4 * 60 * 60
}

// -----------------------------------------------------------------------------
// BatchConfig
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct BatchConfig {
    /// Seal the open batch once it holds this many events.
    #[serde(default = "default_batch_max_events")]
    pub max_events: usize,
    /// Seal the open batch once it reaches this many bytes.
    #[serde(default = "default_batch_max_bytes")]
    pub max_bytes: u64,
    /// Seal the open batch once it is this old, even if small.
    #[serde(default = "default_batch_max_age")]
    pub max_age_seconds: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_events: default_batch_max_events(),
            max_bytes: default_batch_max_bytes(),
            max_age_seconds: default_batch_max_age(),
        }
    }
}

impl BatchConfig {
    #[must_use]
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_seconds)
    }
}

fn default_batch_max_events() -> usize {
    500
}

fn default_batch_max_bytes() -> u64 {
    512 * 1024
}

fn default_batch_max_age() -> u64 {
    30
}

// -----------------------------------------------------------------------------
// UploadConfig
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Base cadence between upload ticks.
    #[serde(default = "default_upload_interval")]
    pub interval_seconds: u64,
    /// First retry delay; doubles per attempt.
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    /// Retry delays never exceed this.
    #[serde(default = "default_max_backoff")]
    pub max_backoff_seconds: u64,
    /// Total delivery attempts per batch before it is abandoned.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Extra backoff scaling applied when the collector rate-limits.
    #[serde(default = "default_rate_limit_multiplier")]
    pub rate_limit_multiplier: u32,
    /// Bound on each network request.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    /// Whether uploads may run while the app is backgrounded.
    #[serde(default)]
    pub allow_background: bool,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_upload_interval(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_seconds: default_max_backoff(),
            max_retries: default_max_retries(),
            rate_limit_multiplier: default_rate_limit_multiplier(),
            request_timeout_seconds: default_request_timeout(),
            allow_background: false,
        }
    }
}

impl UploadConfig {
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    #[must_use]
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    #[must_use]
    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_seconds)
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

fn default_upload_interval() -> u64 {
    5
}

fn default_initial_backoff() -> u64 {
    500
}

fn default_max_backoff() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    5
}

fn default_rate_limit_multiplier() -> u32 {
    4
}

fn default_request_timeout() -> u64 {
    30
}

// -----------------------------------------------------------------------------
// ConfigError
// -----------------------------------------------------------------------------

/// Errors loading the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Yaml(#[from] serde_saphyr::Error),
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------
