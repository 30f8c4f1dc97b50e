//! Redis-backed queue tests.
//!
//! Run with `cargo test -p medx-queue -- --ignored` against a live Redis.

use std::sync::Arc;
use std::time::Duration;

use medx_models::{ExtractionRequest, JobStatus, Lane};
use medx_queue::{Broker, JobStore, QueueClient, QueueConfig, RedisBroker, RedisJobStore};

fn test_config() -> QueueConfig {
    dotenvy::dotenv().ok();
    QueueConfig {
        stream_prefix: format!("medx-test:{}", std::process::id()),
        consumer_group: "medx-test-workers".to_string(),
        unique_window: Duration::from_secs(30),
        job_retention: Duration::from_secs(120),
        ..QueueConfig::from_env()
    }
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_submit_dequeue_ack_roundtrip() {
    let config = test_config();
    let broker = Arc::new(RedisBroker::new(config.clone()).expect("Failed to create broker"));
    let store = Arc::new(RedisJobStore::new(&config).expect("Failed to create store"));
    broker.init().await.expect("Failed to init broker");

    let client = QueueClient::new(broker.clone(), store.clone(), config);
    let request = ExtractionRequest::new(format!("https://youtu.be/{}", std::process::id()))
        .with_quality("1080p");

    let first = client.submit(request.clone()).await.expect("Failed to submit");
    assert_eq!(first.lane, Lane::Default);
    let second = client.submit(request).await.expect("Failed to submit duplicate");
    assert_eq!(second.job_id, first.job_id);
    assert!(second.duplicate);

    let deliveries = broker
        .dequeue(Lane::Default, "tester", 10, Some(Duration::from_millis(500)))
        .await
        .expect("Failed to dequeue");
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].job_id, first.job_id);

    let claimed = broker
        .claim_stale(Lane::Default, "rescuer", Duration::ZERO, 10)
        .await
        .expect("Failed to claim");
    assert_eq!(claimed.len(), 1);

    let job = client
        .update_status(&first.job_id, JobStatus::Processing, 10, None)
        .await
        .expect("Failed to update");
    assert_eq!(job.progress, 10);

    broker.ack(&deliveries[0]).await.expect("Failed to ack");
    assert!(client.release_uniqueness(&job).await.expect("Failed to release"));
    assert!(store.delete(&job.id).await.expect("Failed to delete"));
}
