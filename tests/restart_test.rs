//! At-least-once delivery across process restarts.

mod common;

use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;
use uuid::Uuid;

use common::{MockTransport, fast_config, wait_for};
use vigil::store::{BatchLimits, BatchStore};
use vigil::{ActionType, EventPayload, EventRecord, Telemetry};

#[tokio::test]
async fn event_written_before_crash_is_delivered_after_restart() {
    let dir = TempDir::new().unwrap();
    let queue_dir = dir.path().join("queue");

    // First run: the event is durably written but the process dies before
    // the batch is sealed or uploaded.
    {
        let store = BatchStore::open(
            &queue_dir,
            BatchLimits {
                max_events: 500,
                max_bytes: 512 * 1024,
                max_age: Duration::from_secs(30),
            },
        )
        .await
        .unwrap();
        let record = EventRecord::new(
            Utc::now(),
            Uuid::from_u128(11),
            Uuid::from_u128(12),
            EventPayload::Action {
                action_type: ActionType::Tap,
            },
        );
        store.write(&record).await.unwrap();
        // Dropped without sealing: simulated crash.
    }

    // Second run: recovery seals the leftover batch and uploads it.
    let transport = MockTransport::ok();
    let telemetry = Telemetry::start(fast_config(&queue_dir), transport.clone())
        .await
        .unwrap();

    assert!(wait_for(Duration::from_secs(10), || transport.request_count() >= 1).await);

    let requests = transport.requests();
    let payload = String::from_utf8(requests[0].payload.clone()).unwrap();
    let recovered: EventRecord = serde_json::from_str(payload.lines().next().unwrap()).unwrap();
    assert_eq!(recovered.session_id, Uuid::from_u128(11));
    assert!(matches!(recovered.payload, EventPayload::Action { .. }));

    telemetry.shutdown().await;
}

#[tokio::test]
async fn offline_shutdown_preserves_batches_for_next_run() {
    let dir = TempDir::new().unwrap();
    let queue_dir = dir.path().join("queue");

    // First run: network is down the whole time, then a clean shutdown.
    let offline_transport = MockTransport::failing();
    {
        let telemetry = Telemetry::start(fast_config(&queue_dir), offline_transport.clone())
            .await
            .unwrap();
        telemetry.set_network_reachable(false);

        telemetry.start_view("checkout").await.unwrap();
        telemetry.add_action(ActionType::Tap).await.unwrap();
        telemetry.stop_view().await.unwrap();

        telemetry.shutdown().await;
    }
    // The closed gate means the failing transport never even saw a request.
    assert_eq!(offline_transport.request_count(), 0);

    // Second run: connectivity is back; everything drains exactly once.
    let transport = MockTransport::ok();
    let telemetry = Telemetry::start(fast_config(&queue_dir), transport.clone())
        .await
        .unwrap();

    // 3 view snapshots + 1 action event from the first run.
    assert!(
        wait_for(Duration::from_secs(10), || {
            transport
                .requests()
                .iter()
                .map(|r| {
                    String::from_utf8(r.payload.clone())
                        .unwrap()
                        .lines()
                        .count()
                })
                .sum::<usize>()
                >= 4
        })
        .await
    );

    let requests = transport.requests();
    let events: Vec<EventRecord> = requests
        .iter()
        .flat_map(|r| {
            String::from_utf8(r.payload.clone())
                .unwrap()
                .lines()
                .map(|line| serde_json::from_str(line).unwrap())
                .collect::<Vec<EventRecord>>()
        })
        .collect();

    assert_eq!(events.len(), 4);

    // Each batch was delivered once: no duplicate batch ids.
    let mut ids: Vec<&str> = requests.iter().map(|r| r.batch_id.as_str()).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), requests.len());

    // Versions arrive contiguous and in order for the recovered view.
    let view_id = events[0].view_id;
    let versions: Vec<u64> = events
        .iter()
        .filter(|e| e.view_id == view_id)
        .filter_map(EventRecord::document_version)
        .collect();
    assert_eq!(versions, vec![1, 2, 3]);

    telemetry.shutdown().await;
}
