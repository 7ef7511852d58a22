//! End-to-end tests of the assembled pipeline against in-memory backends.

use futures::future::join_all;
use loghouse::{Backends, IngestConfig, IngestError, Pipeline, RawRecord};
use loghouse_db::{MemoryDeadLetter, MemoryIdempotency, MemoryStore};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use streamq::{MemoryStream, ReplayStream};

struct Harness {
    pipeline: Pipeline,
    stream: Arc<MemoryStream>,
    store: Arc<MemoryStore>,
    dead_letter: Arc<MemoryDeadLetter>,
    idempotency: Arc<MemoryIdempotency>,
}

fn fast_config() -> IngestConfig {
    IngestConfig {
        coalescer_max_wait_time_ms: 5,
        stream_block_ms: 20,
        poll_interval_ms: 2,
        buffer_max_wait_time_ms: 20,
        claim_min_idle_ms: 50,
        stream_processor_count: 2,
        ..IngestConfig::default()
    }
}

async fn start(config: IngestConfig) -> Harness {
    let stream = Arc::new(MemoryStream::new());
    let store = Arc::new(MemoryStore::new());
    let dead_letter = Arc::new(MemoryDeadLetter::new());
    let idempotency = Arc::new(MemoryIdempotency::new());

    let backends = Backends {
        producer_stream: stream.clone(),
        worker_streams: (0..config.stream_processor_count)
            .map(|_| stream.clone() as Arc<dyn ReplayStream>)
            .collect(),
        store: store.clone(),
        idempotency: idempotency.clone(),
        dead_letter: dead_letter.clone(),
    };

    Harness {
        pipeline: Pipeline::start(config, backends).await,
        stream,
        store,
        dead_letter,
        idempotency,
    }
}

fn record(app: &str, message: &str) -> RawRecord {
    json!({"app_id": app, "message": message, "level": "info", "source": "api"})
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within the test budget");
}

#[tokio::test]
async fn single_valid_record_reaches_the_store() {
    let harness = start(fast_config()).await;

    let result = harness
        .pipeline
        .ingest(vec![record("A", "m")], None)
        .await
        .unwrap();
    assert_eq!(result.accepted, 1);
    assert_eq!(result.rejected, 0);
    assert!(result.errors.is_empty());

    // Exactly one stream append, then one commit and one ack downstream
    assert_eq!(harness.stream.log_len(), 1);
    let store = harness.store.clone();
    wait_until(move || store.rows().len() == 1).await;
    let stream = harness.stream.clone();
    wait_until(move || stream.pending_count() == 0).await;

    let row = &harness.store.rows()[0];
    assert_eq!(row["app_id"], "A");
    assert_eq!(row["level"], "INFO");

    harness.pipeline.shutdown().await;
}

#[tokio::test]
async fn mixed_batch_reports_the_bad_record_and_ships_the_rest() {
    let harness = start(fast_config()).await;

    let result = harness
        .pipeline
        .ingest(
            vec![
                record("A", "ok"),
                json!({"app_id": "A", "level": "info", "source": "api"}),
            ],
            None,
        )
        .await
        .unwrap();

    assert_eq!(result.accepted, 1);
    assert_eq!(result.rejected, 1);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].index, 1);
    assert_eq!(result.errors[0].error, "message required");

    // The stream receives exactly the one valid record
    assert_eq!(harness.stream.log_len(), 1);

    harness.pipeline.shutdown().await;
}

#[tokio::test]
async fn empty_batch_is_rejected_outright() {
    let harness = start(fast_config()).await;

    let result = harness.pipeline.ingest(Vec::new(), None).await;
    assert!(matches!(result, Err(IngestError::EmptyBatch)));
    assert_eq!(harness.stream.log_len(), 0);

    harness.pipeline.shutdown().await;
}

#[tokio::test]
async fn repeated_idempotency_key_appends_once_and_replays_the_response() {
    let harness = start(fast_config()).await;

    let first = harness
        .pipeline
        .ingest(vec![record("A", "m")], Some("K"))
        .await
        .unwrap();
    assert_eq!(harness.stream.log_len(), 1);

    let second = harness
        .pipeline
        .ingest(vec![record("A", "m")], Some("K"))
        .await
        .unwrap();

    // Same response, no second append
    assert_eq!(second, first);
    assert_eq!(harness.stream.log_len(), 1);
    assert_eq!(harness.idempotency.len(), 1);

    let stats = harness.pipeline.stats();
    assert_eq!(stats.idempotency.hits, 1);
    assert_eq!(stats.idempotency.stored, 1);

    harness.pipeline.shutdown().await;
}

#[tokio::test]
async fn concurrent_duplicate_keys_share_one_append() {
    let harness = start(fast_config()).await;
    let pipeline = &harness.pipeline;

    let (first, second) = tokio::join!(
        pipeline.ingest(vec![record("A", "m")], Some("K")),
        pipeline.ingest(vec![record("A", "m")], Some("K")),
    );
    let first = first.unwrap();
    let second = second.unwrap();

    assert_eq!(first, second);
    assert_eq!(harness.stream.log_len(), 1);

    harness.pipeline.shutdown().await;
}

#[tokio::test]
async fn idempotency_outage_degrades_open() {
    let harness = start(fast_config()).await;
    // One failing get, one failing set
    harness.idempotency.fail_next(2);

    let result = harness
        .pipeline
        .ingest(vec![record("A", "m")], Some("K"))
        .await
        .unwrap();
    assert_eq!(result.accepted, 1);
    assert_eq!(harness.stream.log_len(), 1);
    assert_eq!(harness.pipeline.stats().idempotency.degraded, 2);

    harness.pipeline.shutdown().await;
}

#[tokio::test]
async fn concurrent_small_calls_coalesce_into_one_batch() {
    let mut config = fast_config();
    config.coalescer_max_wait_time_ms = 50;
    let harness = start(config).await;

    let adds = (0..10).map(|n| {
        let pipeline = &harness.pipeline;
        let records = vec![record("A", &format!("m{n}"))];
        async move { pipeline.ingest(records, None).await }
    });
    let results = join_all(adds).await;
    for result in results {
        assert_eq!(result.unwrap().accepted, 1);
    }

    let stats = harness.pipeline.stats();
    assert_eq!(stats.coalescer.batches_dispatched, 1);
    assert_eq!(stats.coalescer.records_dispatched, 10);
    assert_eq!(harness.stream.log_len(), 10);

    harness.pipeline.shutdown().await;
}

#[tokio::test]
async fn failed_commit_is_dead_lettered_then_retried_from_the_stream() {
    let mut config = fast_config();
    // One worker, so the whole batch fails (and retries) as a unit
    config.stream_processor_count = 1;
    let harness = start(config).await;
    harness.store.fail_next(1);

    let result = harness
        .pipeline
        .ingest(vec![record("A", "m1"), record("A", "m2"), record("A", "m3")], None)
        .await
        .unwrap();
    assert_eq!(result.accepted, 3);

    // First commit attempt fails and lands in the dead-letter queue
    let dead_letter = harness.dead_letter.clone();
    wait_until(move || !dead_letter.items().is_empty()).await;
    let items = harness.dead_letter.items();
    assert_eq!(items[0].records.len(), 3);
    assert_eq!(items[0].attempt, 0);

    // Nothing was acked, so the claim sweep redelivers and the next commit
    // succeeds; the store ends up with every record exactly once here
    let store = harness.store.clone();
    wait_until(move || store.rows().len() == 3).await;
    let stream = harness.stream.clone();
    wait_until(move || stream.pending_count() == 0).await;

    harness.pipeline.shutdown().await;
}

#[tokio::test]
async fn stream_append_failure_fails_the_call_without_accepting_records() {
    let harness = start(fast_config()).await;
    harness.stream.fail_next_appends(1);

    let result = harness.pipeline.ingest(vec![record("A", "m")], None).await;
    assert!(matches!(result, Err(IngestError::StorageUnavailable(_))));
    assert_eq!(harness.stream.log_len(), 0);

    harness.pipeline.shutdown().await;
}

#[tokio::test]
async fn shutdown_drains_buffered_work() {
    let mut config = fast_config();
    // Only a drain can flush the workers' buffers
    config.buffer_max_wait_time_ms = 600_000;
    config.buffer_max_batch_size = 1_000_000;
    let harness = start(config).await;

    harness
        .pipeline
        .ingest(vec![record("A", "m1"), record("A", "m2")], None)
        .await
        .unwrap();

    // Wait for some worker to pick the entries up, then drain
    let stream = harness.stream.clone();
    wait_until(move || stream.pending_count() == 2).await;
    harness.pipeline.shutdown().await;

    assert_eq!(harness.store.rows().len(), 2);
    assert_eq!(harness.stream.pending_count(), 0);
}

#[tokio::test]
async fn ingest_after_shutdown_is_refused() {
    let harness = start(fast_config()).await;
    harness.pipeline.shutdown().await;

    let result = harness.pipeline.ingest(vec![record("A", "m")], None).await;
    assert!(matches!(result, Err(IngestError::ShuttingDown)));
}

#[tokio::test]
async fn retention_sweep_trims_committed_entries() {
    let mut config = fast_config();
    // Zero retention: anything committed is trimmable on the next sweep
    config.stream_retention_minutes = 0;
    config.stream_trim_interval_ms = 30;
    let harness = start(config).await;

    harness
        .pipeline
        .ingest(
            (0..4).map(|n| record("A", &format!("m{n}"))).collect(),
            None,
        )
        .await
        .unwrap();

    let store = harness.store.clone();
    wait_until(move || store.rows().len() == 4).await;
    let stream = harness.stream.clone();
    wait_until(move || stream.pending_count() == 0).await;

    // Everything below the group's last-delivered id gets swept
    let stream = harness.stream.clone();
    wait_until(move || stream.log_len() <= 1).await;

    harness.pipeline.shutdown().await;
}

#[tokio::test]
async fn disabled_worker_validation_keeps_the_pipeline_working() {
    let mut config = fast_config();
    config.worker_validation_enabled = false;
    let harness = start(config).await;

    let result = harness
        .pipeline
        .ingest(vec![record("A", "m")], None)
        .await
        .unwrap();
    assert_eq!(result.accepted, 1);

    let stats = harness.pipeline.stats();
    assert!(stats.worker_pool.is_none());
    assert_eq!(stats.service.validations_inline, 1);

    harness.pipeline.shutdown().await;
}

#[tokio::test]
async fn stats_snapshot_is_coherent() {
    let harness = start(fast_config()).await;

    for n in 0..4 {
        harness
            .pipeline
            .ingest(vec![record("A", &format!("m{n}"))], None)
            .await
            .unwrap();
    }
    let store = harness.store.clone();
    wait_until(move || store.rows().len() == 4).await;

    let stats = harness.pipeline.stats();
    assert_eq!(stats.service.records_accepted, 4);
    assert_eq!(stats.service.records_rejected, 0);
    assert!(stats.coalescer.batches_dispatched >= 1);
    let committed: u64 = stats
        .stream_workers
        .iter()
        .map(|w| w.records_committed)
        .sum();
    assert_eq!(committed, 4);
    assert_eq!(stats.dead_letter.queued_batches, 0);
    // The snapshot serializes for operators who want to scrape it
    serde_json::to_string(&stats).unwrap();

    harness.pipeline.shutdown().await;
}
