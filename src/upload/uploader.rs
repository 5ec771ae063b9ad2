//! Batch delivery state machine.
//!
//! Drains the store strictly oldest-first, one batch per call. A batch
//! moves through pending → in flight → delivered, retrying, or abandoned.
//! A retrying batch blocks the queue, so document-version order per view
//! is preserved all the way to the collector even across retries.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::config::UploadConfig;
use crate::diagnostics::Diagnostics;
use crate::store::BatchStore;

use super::transport::{Transport, UploadRequest};

/// Result of one drain pass, steering the scheduler's next tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DrainOutcome {
    /// A batch was resolved (delivered or discarded). `more_pending` asks
    /// for an immediate follow-up tick.
    Resolved { more_pending: bool },
    /// Nothing sealed to upload.
    Idle,
    /// Delivery failed; retry the same batch after this delay.
    Backoff(Duration),
}

/// Exponential backoff with jitter, capped in delay and attempt count.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BackoffPolicy {
    initial: Duration,
    max: Duration,
    max_retries: u32,
    rate_limit_multiplier: u32,
}

impl BackoffPolicy {
    pub fn from_config(config: &UploadConfig) -> Self {
        Self {
            initial: config.initial_backoff(),
            max: config.max_backoff(),
            max_retries: config.max_retries,
            rate_limit_multiplier: config.rate_limit_multiplier,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    ///
    /// Doubles per attempt, scales up when rate-limited, caps at the
    /// configured maximum. Jitter shaves up to 20% off so clients that
    /// failed together do not retry together; the cap is never exceeded.
    fn delay_for(&self, attempt: u32, rate_limited: bool) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let mut delay = self.initial.saturating_mul(1 << shift);
        if rate_limited {
            delay = delay.saturating_mul(self.rate_limit_multiplier);
        }
        let capped = delay.min(self.max);

        let factor = rand::thread_rng().gen_range(0.8..=1.0);
        Duration::from_millis((capped.as_millis() as f64 * factor) as u64)
    }
}

struct RetryState {
    batch_id: Ulid,
    attempts: u32,
}

/// Drives delivery of sealed batches through the transport.
pub(crate) struct Uploader {
    store: Arc<BatchStore>,
    transport: Arc<dyn Transport>,
    diagnostics: Arc<Diagnostics>,
    backoff: BackoffPolicy,
    retry: Option<RetryState>,
}

impl Uploader {
    pub fn new(
        store: Arc<BatchStore>,
        transport: Arc<dyn Transport>,
        diagnostics: Arc<Diagnostics>,
        config: &UploadConfig,
    ) -> Self {
        Self {
            store,
            transport,
            diagnostics,
            backoff: BackoffPolicy::from_config(config),
            retry: None,
        }
    }

    /// Attempt delivery of the oldest sealed batch.
    pub async fn drain_one(&mut self) -> DrainOutcome {
        // Age-based sealing rides the upload cadence so a trickle of events
        // still becomes uploadable.
        if let Err(e) = self.store.seal_aged().await {
            warn!(error = %e, "failed to seal aged batch");
            self.diagnostics.record_storage_error();
        }

        let batch = match self.store.next_batch_for_upload().await {
            Ok(Some(batch)) => batch,
            Ok(None) => return DrainOutcome::Idle,
            Err(e) => {
                warn!(error = %e, "failed to claim batch for upload");
                self.diagnostics.record_storage_error();
                return DrainOutcome::Idle;
            }
        };

        let attempts_so_far = match self.retry.as_ref() {
            Some(retry) if retry.batch_id == batch.id => retry.attempts,
            _ => 0,
        };

        let event_count = batch.event_count();
        let request = UploadRequest {
            batch_id: batch.id,
            batch_time: batch.created_at,
            payload: batch.payload,
        };

        match self.transport.send(&request).await {
            Ok(code) if (200..300).contains(&code) => {
                debug!(
                    batch_id = %request.batch_id,
                    events = event_count,
                    attempt = attempts_so_far + 1,
                    "batch delivered"
                );
                self.delete_batch(request.batch_id).await;
                self.diagnostics.record_batch_delivered();
                self.retry = None;
                self.resolved()
            }
            Ok(429) => {
                warn!(batch_id = %request.batch_id, "collector rate-limited upload");
                self.retry_later(request.batch_id, attempts_so_far, true)
                    .await
            }
            Ok(code) if (400..500).contains(&code) => {
                // A payload the collector refuses will never succeed on
                // retry.
                warn!(
                    batch_id = %request.batch_id,
                    status = code,
                    "collector rejected batch, discarding"
                );
                self.delete_batch(request.batch_id).await;
                self.diagnostics.record_batch_rejected();
                self.retry = None;
                self.resolved()
            }
            Ok(code) => {
                warn!(batch_id = %request.batch_id, status = code, "upload failed");
                self.retry_later(request.batch_id, attempts_so_far, false)
                    .await
            }
            Err(e) => {
                warn!(batch_id = %request.batch_id, error = %e, "upload failed");
                self.retry_later(request.batch_id, attempts_so_far, false)
                    .await
            }
        }
    }

    async fn retry_later(
        &mut self,
        batch_id: Ulid,
        attempts_so_far: u32,
        rate_limited: bool,
    ) -> DrainOutcome {
        let attempts = attempts_so_far + 1;

        if attempts >= self.backoff.max_retries {
            // Bounded local storage beats unbounded retry.
            warn!(batch_id = %batch_id, attempts, "retry budget exhausted, abandoning batch");
            self.delete_batch(batch_id).await;
            self.diagnostics.record_batch_abandoned();
            self.retry = None;
            return self.resolved();
        }

        self.store.release(batch_id);
        self.retry = Some(RetryState { batch_id, attempts });
        self.diagnostics.record_upload_retry();

        let delay = self.backoff.delay_for(attempts, rate_limited);
        debug!(
            batch_id = %batch_id,
            attempt = attempts,
            delay_ms = delay.as_millis() as u64,
            "backing off before retry"
        );
        DrainOutcome::Backoff(delay)
    }

    fn resolved(&self) -> DrainOutcome {
        DrainOutcome::Resolved {
            more_pending: self.store.pending_batches() > 0,
        }
    }

    async fn delete_batch(&self, batch_id: Ulid) {
        if let Err(e) = self.store.delete(batch_id).await {
            warn!(batch_id = %batch_id, error = %e, "failed to delete batch");
            self.diagnostics.record_storage_error();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ActionType, EventPayload, EventRecord};
    use crate::store::BatchLimits;
    use crate::upload::transport::TransportError;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use uuid::Uuid;

    struct ScriptedTransport {
        responses: Mutex<VecDeque<Result<u16, TransportError>>>,
        requests: Mutex<Vec<(Ulid, Vec<u8>)>>,
    }

    impl ScriptedTransport {
        fn new(responses: Vec<Result<u16, TransportError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn recorded(&self) -> Vec<(Ulid, Vec<u8>)> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&self, request: &UploadRequest) -> Result<u16, TransportError> {
            self.requests
                .lock()
                .unwrap()
                .push((request.batch_id, request.payload.clone()));
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(200))
        }
    }

    fn upload_config(max_retries: u32) -> UploadConfig {
        UploadConfig {
            interval_seconds: 1,
            initial_backoff_ms: 100,
            max_backoff_seconds: 60,
            max_retries,
            rate_limit_multiplier: 4,
            request_timeout_seconds: 5,
            allow_background: false,
        }
    }

    async fn store_with_batches(dir: &TempDir, batches: &[usize]) -> Arc<BatchStore> {
        let store = Arc::new(
            BatchStore::open(
                dir.path(),
                BatchLimits {
                    max_events: 10_000,
                    max_bytes: 16 * 1024 * 1024,
                    max_age: Duration::from_secs(3600),
                },
            )
            .await
            .unwrap(),
        );
        for count in batches {
            for _ in 0..*count {
                let record = EventRecord::new(
                    Utc::now(),
                    Uuid::from_u128(1),
                    Uuid::from_u128(2),
                    EventPayload::Action {
                        action_type: ActionType::Tap,
                    },
                );
                store.write(&record).await.unwrap();
            }
            store.seal_current().await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn delivers_and_deletes_on_success() {
        let dir = TempDir::new().unwrap();
        let store = store_with_batches(&dir, &[2]).await;
        let transport = ScriptedTransport::new(vec![Ok(200)]);
        let diagnostics = Arc::new(Diagnostics::default());
        let mut uploader = Uploader::new(
            store.clone(),
            transport.clone(),
            diagnostics.clone(),
            &upload_config(5),
        );

        let outcome = uploader.drain_one().await;
        assert_eq!(
            outcome,
            DrainOutcome::Resolved {
                more_pending: false
            }
        );
        assert_eq!(store.pending_batches(), 0);
        assert_eq!(diagnostics.snapshot().batches_delivered, 1);
    }

    #[tokio::test]
    async fn idle_when_nothing_sealed() {
        let dir = TempDir::new().unwrap();
        let store = store_with_batches(&dir, &[]).await;
        let transport = ScriptedTransport::new(vec![]);
        let mut uploader = Uploader::new(
            store,
            transport,
            Arc::new(Diagnostics::default()),
            &upload_config(5),
        );

        assert_eq!(uploader.drain_one().await, DrainOutcome::Idle);
    }

    #[tokio::test]
    async fn rejected_batch_is_discarded_not_retried() {
        let dir = TempDir::new().unwrap();
        let store = store_with_batches(&dir, &[1]).await;
        let transport = ScriptedTransport::new(vec![Ok(400)]);
        let diagnostics = Arc::new(Diagnostics::default());
        let mut uploader = Uploader::new(
            store.clone(),
            transport,
            diagnostics.clone(),
            &upload_config(5),
        );

        let outcome = uploader.drain_one().await;
        assert_eq!(
            outcome,
            DrainOutcome::Resolved {
                more_pending: false
            }
        );
        assert_eq!(store.pending_batches(), 0);
        let snap = diagnostics.snapshot();
        assert_eq!(snap.batches_rejected, 1);
        assert_eq!(snap.upload_retries, 0);
    }

    #[tokio::test]
    async fn retries_503_with_increasing_delay_then_delivers() {
        let dir = TempDir::new().unwrap();
        let store = store_with_batches(&dir, &[3]).await;
        let transport = ScriptedTransport::new(vec![Ok(503), Ok(503), Ok(503), Ok(200)]);
        let diagnostics = Arc::new(Diagnostics::default());
        let mut uploader = Uploader::new(
            store.clone(),
            transport.clone(),
            diagnostics.clone(),
            &upload_config(10),
        );

        let mut delays = Vec::new();
        for _ in 0..3 {
            match uploader.drain_one().await {
                DrainOutcome::Backoff(d) => delays.push(d),
                other => panic!("expected backoff, got {other:?}"),
            }
        }
        assert!(delays[0] < delays[1] && delays[1] < delays[2]);

        let outcome = uploader.drain_one().await;
        assert_eq!(
            outcome,
            DrainOutcome::Resolved {
                more_pending: false
            }
        );
        assert_eq!(store.pending_batches(), 0);

        // Every attempt resent the same batch with byte-identical payload.
        let recorded = transport.recorded();
        assert_eq!(recorded.len(), 4);
        assert!(recorded.iter().all(|(id, _)| *id == recorded[0].0));
        assert!(
            recorded
                .iter()
                .all(|(_, payload)| *payload == recorded[0].1)
        );
        assert_eq!(diagnostics.snapshot().upload_retries, 3);
        assert_eq!(diagnostics.snapshot().batches_delivered, 1);
    }

    #[tokio::test]
    async fn network_error_is_retryable() {
        let dir = TempDir::new().unwrap();
        let store = store_with_batches(&dir, &[1]).await;
        let transport = ScriptedTransport::new(vec![Err(TransportError::Network(
            "connection reset".to_string(),
        ))]);
        let mut uploader = Uploader::new(
            store.clone(),
            transport,
            Arc::new(Diagnostics::default()),
            &upload_config(5),
        );

        assert!(matches!(
            uploader.drain_one().await,
            DrainOutcome::Backoff(_)
        ));
        // Released back to the sealed pool for the next tick.
        assert_eq!(store.pending_batches(), 1);
    }

    #[tokio::test]
    async fn abandons_after_retry_budget() {
        let dir = TempDir::new().unwrap();
        let store = store_with_batches(&dir, &[1]).await;
        let transport =
            ScriptedTransport::new(vec![Ok(503), Ok(503), Ok(503), Ok(503), Ok(503)]);
        let diagnostics = Arc::new(Diagnostics::default());
        let mut uploader = Uploader::new(
            store.clone(),
            transport.clone(),
            diagnostics.clone(),
            &upload_config(3),
        );

        assert!(matches!(
            uploader.drain_one().await,
            DrainOutcome::Backoff(_)
        ));
        assert!(matches!(
            uploader.drain_one().await,
            DrainOutcome::Backoff(_)
        ));
        // Third attempt exhausts the budget.
        let outcome = uploader.drain_one().await;
        assert_eq!(
            outcome,
            DrainOutcome::Resolved {
                more_pending: false
            }
        );

        assert_eq!(transport.recorded().len(), 3);
        assert_eq!(store.pending_batches(), 0);
        assert_eq!(diagnostics.snapshot().batches_abandoned, 1);
        // No further attempts once abandoned.
        assert_eq!(uploader.drain_one().await, DrainOutcome::Idle);
    }

    #[tokio::test]
    async fn drains_strictly_oldest_first() {
        let dir = TempDir::new().unwrap();
        let store = store_with_batches(&dir, &[1, 2]).await;
        let transport = ScriptedTransport::new(vec![Ok(200), Ok(200)]);
        let mut uploader = Uploader::new(
            store.clone(),
            transport.clone(),
            Arc::new(Diagnostics::default()),
            &upload_config(5),
        );

        let first = uploader.drain_one().await;
        assert_eq!(first, DrainOutcome::Resolved { more_pending: true });
        let second = uploader.drain_one().await;
        assert_eq!(
            second,
            DrainOutcome::Resolved {
                more_pending: false
            }
        );

        let recorded = transport.recorded();
        assert_eq!(recorded.len(), 2);
        assert!(recorded[0].0 < recorded[1].0);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = BackoffPolicy {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(60),
            max_retries: 10,
            rate_limit_multiplier: 4,
        };

        // Jitter shaves at most 20%, so consecutive delays still increase.
        let d1 = policy.delay_for(1, false);
        let d2 = policy.delay_for(2, false);
        let d3 = policy.delay_for(3, false);
        assert!(d1 < d2 && d2 < d3);
        assert!(d1 >= Duration::from_millis(80) && d1 <= Duration::from_millis(100));

        // Far attempts hit the cap.
        let capped = policy.delay_for(30, false);
        assert!(capped <= Duration::from_secs(60));
        assert!(capped >= Duration::from_secs(48));
    }

    #[test]
    fn rate_limited_backoff_is_larger() {
        let policy = BackoffPolicy {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(60),
            max_retries: 10,
            rate_limit_multiplier: 4,
        };

        let plain = policy.delay_for(1, false);
        let limited = policy.delay_for(1, true);
        assert!(limited > plain);
    }
}
