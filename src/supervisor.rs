use crate::coalescer::Coalescer;
use crate::config::IngestConfig;
use crate::record::{IngestResult, RawRecord};
use crate::service::{IngestError, IngestService};
use crate::stats::{DeadLetterStats, IdempotencyCounters, PipelineStats};
use crate::stream_worker::{StreamWorker, WorkerCounters, WorkerError};
use crate::worker_pool::ValidationPool;
use hashbrown::HashMap;
use itertools::Itertools;
use log::{info, warn};
use loghouse_db::{
    ClickHouseStore, ColumnarStore, DeadLetterQueue, IdempotencyStore, InsertOptions,
    MemoryDeadLetter, MemoryIdempotency, MemoryStore, RedisDeadLetter, RedisIdempotency,
    clickhouse_url_from_environment, redis_url_from_environment,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use streamq::{MemoryStream, RedisStream, ReplayStream};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("could not connect to the replayable stream")]
    Stream(#[from] streamq::StreamError),

    #[error("could not connect to the idempotency backend")]
    Idempotency(#[from] loghouse_db::IdempotencyError),

    #[error("could not connect to the dead-letter backend")]
    DeadLetter(#[from] loghouse_db::DeadLetterError),

    #[error("could not reach the columnar store")]
    Columnar(#[from] loghouse_db::ColumnarError),
}

/// Everything external the pipeline talks to. The stream appears twice:
/// once for producers and once per stream worker, because each worker holds
/// a dedicated connection for its blocking group reads.
pub struct Backends {
    pub producer_stream: Arc<dyn ReplayStream>,
    pub worker_streams: Vec<Arc<dyn ReplayStream>>,
    pub store: Arc<dyn ColumnarStore>,
    pub idempotency: Arc<dyn IdempotencyStore>,
    pub dead_letter: Arc<dyn DeadLetterQueue>,
}

impl Backends {
    /// Wire every capability to its real backend: Redis for the stream, the
    /// idempotency cache and the dead-letter list, ClickHouse for the
    /// columnar store. Connection parameters come from the environment.
    pub async fn connect(config: &IngestConfig) -> Result<Backends, StartupError> {
        let redis_url = redis_url_from_environment();

        let idempotency =
            RedisIdempotency::connect(&redis_url, config.idempotency_key_prefix.clone()).await?;

        let producer_stream = RedisStream::connect(
            &redis_url,
            config.stream_key.clone(),
            config.consumer_group.clone(),
        )
        .await?;

        let mut worker_streams: Vec<Arc<dyn ReplayStream>> =
            Vec::with_capacity(config.stream_processor_count);
        for _ in 0..config.stream_processor_count {
            let stream = RedisStream::connect(
                &redis_url,
                config.stream_key.clone(),
                config.consumer_group.clone(),
            )
            .await?;
            worker_streams.push(Arc::new(stream));
        }

        let dead_letter = RedisDeadLetter::connect(&redis_url, config.dead_letter_key.clone()).await?;

        let store = ClickHouseStore::new(clickhouse_url_from_environment(), InsertOptions::default());
        store.ping().await?;

        Ok(Backends {
            producer_stream: Arc::new(producer_stream),
            worker_streams,
            store: Arc::new(store),
            idempotency: Arc::new(idempotency),
            dead_letter: Arc::new(dead_letter),
        })
    }

    /// All-in-memory backends sharing one stream, for tests and local runs.
    pub fn in_memory(config: &IngestConfig) -> Backends {
        let stream = Arc::new(MemoryStream::new());
        let worker_streams = (0..config.stream_processor_count)
            .map(|_| stream.clone() as Arc<dyn ReplayStream>)
            .collect();
        Backends {
            producer_stream: stream,
            worker_streams,
            store: Arc::new(MemoryStore::new()),
            idempotency: Arc::new(MemoryIdempotency::new()),
            dead_letter: Arc::new(MemoryDeadLetter::new()),
        }
    }
}

type SharedResult = Result<IngestResult, IngestError>;

/// The assembled pipeline. Components start in dependency order (worker
/// pool, then stream workers with their recovery pass, then the ingestion
/// service, then the coalescer) and drain in the inverse order on shutdown.
pub struct Pipeline {
    config: IngestConfig,
    coalescer: Coalescer,
    service: Arc<IngestService>,
    pool: Option<Arc<ValidationPool>>,
    idempotency: Arc<dyn IdempotencyStore>,
    dead_letter: Arc<dyn DeadLetterQueue>,
    worker_handles: Mutex<Vec<(String, JoinHandle<Result<(), WorkerError>>)>>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
    worker_counters: Vec<(String, Arc<WorkerCounters>)>,
    idempotency_counters: Arc<IdempotencyCounters>,
    inflight_keys: Arc<Mutex<HashMap<String, Vec<oneshot::Sender<SharedResult>>>>>,
    inflight_calls: Arc<AtomicU64>,
    accepting: AtomicBool,
    drain_workers: CancellationToken,
    shutdown: CancellationToken,
}

impl Pipeline {
    pub async fn start(config: IngestConfig, backends: Backends) -> Pipeline {
        let shutdown = CancellationToken::new();
        let drain_workers = CancellationToken::new();

        let pool = if config.worker_validation_enabled {
            Some(Arc::new(ValidationPool::start(config.worker_pool())))
        } else {
            None
        };

        // Stream workers next; each one runs its recovery passes before it
        // serves new traffic
        let mut worker_handles = Vec::with_capacity(config.stream_processor_count);
        let mut worker_counters = Vec::with_capacity(config.stream_processor_count);
        for (index, stream) in backends.worker_streams.into_iter().enumerate() {
            let consumer = format!("{}-{index}", config.consumer_prefix);
            let worker = StreamWorker::new(
                consumer.clone(),
                stream,
                backends.store.clone(),
                backends.dead_letter.clone(),
                config.stream_worker(),
                drain_workers.clone(),
            );
            worker_counters.push((consumer.clone(), worker.counters()));
            worker_handles.push((consumer, tokio::spawn(worker.run())));
        }

        // Retention sweep shares the producer connection; it runs rarely
        let maintenance = tokio::spawn(stream_maintenance(
            backends.producer_stream.clone(),
            Duration::from_millis(config.stream_trim_interval_ms),
            Duration::from_secs(config.stream_retention_minutes * 60),
            shutdown.clone(),
        ));

        let service = Arc::new(IngestService::new(
            config.service(),
            pool.clone(),
            backends.producer_stream,
        ));

        let coalescer = Coalescer::new(config.coalescer(), service.clone(), shutdown.clone());

        info!(
            "pipeline started: {} stream workers, coalescing {}",
            config.stream_processor_count,
            if config.coalescer_enabled { "on" } else { "off" }
        );

        Pipeline {
            config,
            coalescer,
            service,
            pool,
            idempotency: backends.idempotency,
            dead_letter: backends.dead_letter,
            worker_handles: Mutex::new(worker_handles),
            maintenance: Mutex::new(Some(maintenance)),
            worker_counters,
            idempotency_counters: Arc::new(IdempotencyCounters::default()),
            inflight_keys: Arc::new(Mutex::new(HashMap::new())),
            inflight_calls: Arc::new(AtomicU64::new(0)),
            accepting: AtomicBool::new(true),
            drain_workers,
            shutdown,
        }
    }

    /// The single inbound operation: validate, stage, append, respond.
    /// With an idempotency key, a repeat of an already-answered call returns
    /// the cached result and appends nothing; concurrent duplicates wait for
    /// the first call's result instead of racing it.
    pub async fn ingest(
        &self,
        records: Vec<RawRecord>,
        idempotency_key: Option<&str>,
    ) -> Result<IngestResult, IngestError> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(IngestError::ShuttingDown);
        }

        let Some(key) = idempotency_key else {
            return self.submit(records).await;
        };

        // Cached response from a previous call with this key
        match self.idempotency.get(key).await {
            Ok(Some(snapshot)) => match serde_json::from_str::<IngestResult>(&snapshot) {
                Ok(result) => {
                    self.idempotency_counters
                        .hits
                        .fetch_add(1, Ordering::Relaxed);
                    return Ok(result);
                }
                Err(err) => {
                    warn!("ignoring unparseable idempotency snapshot for {key}: {err}");
                }
            },
            Ok(None) => {
                self.idempotency_counters
                    .misses
                    .fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                // Degrade open: a cache outage must not block ingestion
                self.idempotency_counters
                    .degraded
                    .fetch_add(1, Ordering::Relaxed);
                warn!("idempotency lookup for {key} failed, proceeding without it: {err}");
            }
        }

        // In-process single flight: the first call with a key runs, any
        // concurrent duplicate waits for that result
        let waiter = {
            let mut inflight = self.inflight_keys.lock();
            match inflight.get_mut(key) {
                Some(waiters) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Some(rx)
                }
                None => {
                    inflight.insert(key.to_string(), Vec::new());
                    None
                }
            }
        };
        if let Some(rx) = waiter {
            self.idempotency_counters
                .duplicate_waiters
                .fetch_add(1, Ordering::Relaxed);
            return rx.await.unwrap_or(Err(IngestError::ShuttingDown));
        }

        let mut guard = InflightKeyGuard {
            inflight: self.inflight_keys.clone(),
            key: key.to_string(),
            result: None,
        };

        let result = self.submit(records).await;

        if let Ok(ok_result) = &result {
            let snapshot = serde_json::to_string(ok_result)
                .expect("an ingest result always serializes to JSON");
            match self
                .idempotency
                .set(key, &snapshot, self.config.idempotency_ttl())
                .await
            {
                Ok(loghouse_db::SetOutcome::Inserted) => {
                    self.idempotency_counters
                        .stored
                        .fetch_add(1, Ordering::Relaxed);
                }
                Ok(loghouse_db::SetOutcome::Preexisting) => {
                    // Another process answered this key first; our own result
                    // is still the one this caller gets
                }
                Err(err) => {
                    self.idempotency_counters
                        .degraded
                        .fetch_add(1, Ordering::Relaxed);
                    warn!("storing idempotency snapshot for {key} failed: {err}");
                }
            }
        }

        guard.result = Some(result.clone());
        drop(guard);
        result
    }

    /// Force the coalescer to dispatch whatever is staged right now.
    pub async fn force_flush(&self) {
        self.coalescer.force_flush().await;
    }

    /// Pure composition of every component's counters. No I/O.
    pub fn stats(&self) -> PipelineStats {
        let stream_workers = self
            .worker_counters
            .iter()
            .map(|(consumer, counters)| counters.snapshot(consumer))
            .collect_vec();
        let queued_batches = stream_workers.iter().map(|w| w.dead_lettered_batches).sum();

        PipelineStats {
            coalescer: self.coalescer.snapshot(),
            service: self.service.snapshot(),
            worker_pool: self.pool.as_ref().map(|pool| pool.snapshot()),
            stream_workers,
            idempotency: self.idempotency_counters.snapshot(),
            dead_letter: DeadLetterStats { queued_batches },
        }
    }

    /// Current length of the dead-letter queue, straight from the backend.
    pub async fn dead_letter_length(&self) -> Result<u64, loghouse_db::DeadLetterError> {
        self.dead_letter.queue_length().await
    }

    /// Ordered drain: stop intake, flush the coalescer, wait out in-flight
    /// service calls, drain each stream worker (one buffer flush and commit
    /// each), then stop the validation pool. Every step has the same grace
    /// budget; an expired budget logs and moves on so shutdown can never
    /// deadlock.
    pub async fn shutdown(&self) {
        let budget = self.config.shutdown_step_budget();
        self.accepting.store(false, Ordering::Release);
        info!("pipeline shutting down");

        if tokio::time::timeout(budget, self.coalescer.force_flush())
            .await
            .is_err()
        {
            warn!("coalescer flush exceeded its shutdown budget; proceeding");
        }

        if tokio::time::timeout(budget, self.wait_for_inflight_calls())
            .await
            .is_err()
        {
            warn!("in-flight ingest calls exceeded the shutdown budget; proceeding");
        }

        self.drain_workers.cancel();
        let handles = std::mem::take(&mut *self.worker_handles.lock());
        for (consumer, handle) in handles {
            match tokio::time::timeout(budget, handle).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(err))) => warn!("stream worker {consumer} exited with error: {err}"),
                Ok(Err(join_err)) => warn!("stream worker {consumer} panicked: {join_err}"),
                Err(_) => warn!(
                    "stream worker {consumer} exceeded its shutdown budget; \
                    its pending entries stay in the stream"
                ),
            }
        }

        if let Some(pool) = &self.pool {
            if tokio::time::timeout(budget, pool.shutdown()).await.is_err() {
                warn!("validation pool exceeded its shutdown budget; proceeding");
            }
        }

        // Cancels any armed coalescer timers and the retention sweep
        self.shutdown.cancel();
        let maintenance = self.maintenance.lock().take();
        if let Some(handle) = maintenance {
            if tokio::time::timeout(budget, handle).await.is_err() {
                warn!("retention sweep exceeded its shutdown budget; proceeding");
            }
        }
        info!("pipeline stopped");
    }

    async fn submit(&self, records: Vec<RawRecord>) -> Result<IngestResult, IngestError> {
        self.inflight_calls.fetch_add(1, Ordering::AcqRel);
        let _guard = InflightCallGuard {
            counter: self.inflight_calls.clone(),
        };
        self.coalescer.add(records).await
    }

    async fn wait_for_inflight_calls(&self) {
        while self.inflight_calls.load(Ordering::Acquire) > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

struct InflightCallGuard {
    counter: Arc<AtomicU64>,
}

impl Drop for InflightCallGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Periodic retention sweep: drop committed entries older than the retention
/// window from the stream. The watermark never passes the group's
/// last-delivered id or the lowest pending id, so unprocessed and unacked
/// entries always survive, whatever the window says.
async fn stream_maintenance(
    stream: Arc<dyn ReplayStream>,
    interval: Duration,
    retention: Duration,
    shutdown: CancellationToken,
) {
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = shutdown.cancelled() => return,
        }

        match trim_committed_entries(stream.as_ref(), retention).await {
            Ok(0) => {}
            Ok(trimmed) => info!("retention sweep trimmed {trimmed} committed stream entries"),
            Err(err) => warn!("retention sweep failed: {err}"),
        }
    }
}

async fn trim_committed_entries(
    stream: &dyn ReplayStream,
    retention: Duration,
) -> Result<u64, streamq::StreamError> {
    let Some(last_delivered) = stream.last_delivered_id().await? else {
        // Nothing delivered yet, so nothing is safe to trim
        return Ok(0);
    };

    let cutoff_ms = (chrono::Utc::now().timestamp_millis() as u64)
        .saturating_sub(retention.as_millis() as u64);
    let mut watermark = format!("{cutoff_ms}-0");

    let pending = stream.pending_info().await?;
    for bound in [Some(last_delivered), pending.lowest_id].into_iter().flatten() {
        if streamq::parse_id(&bound) < streamq::parse_id(&watermark) {
            watermark = bound;
        }
    }

    stream.trim_older_than(&watermark).await
}

/// Removes the in-flight key entry and resolves any waiters when the leader
/// call finishes, including when its future is dropped mid-way.
struct InflightKeyGuard {
    inflight: Arc<Mutex<HashMap<String, Vec<oneshot::Sender<SharedResult>>>>>,
    key: String,
    result: Option<SharedResult>,
}

impl Drop for InflightKeyGuard {
    fn drop(&mut self) {
        let waiters = self.inflight.lock().remove(&self.key).unwrap_or_default();
        let result = self
            .result
            .take()
            .unwrap_or(Err(IngestError::ShuttingDown));
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }
}
