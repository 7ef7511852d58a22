use crate::record::NormalizedRecord;
use chrono::Utc;
use log::{debug, error, info, warn};
use loghouse_db::{ColumnarStore, DeadLetterItem, DeadLetterQueue};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use streamq::{ReplayStream, SCAN_START, StreamEntry, StreamError};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("stream worker could not set up its consumer group")]
    GroupSetup(#[source] StreamError),

    #[error("stream worker failed while recovering pending entries")]
    Recovery(#[source] StreamError),
}

#[derive(Debug, Clone)]
pub struct StreamWorkerConfig {
    /// Columnar table the worker commits into.
    pub table: String,
    /// Entries per group read.
    pub read_batch: usize,
    /// Block time for one group read. Kept sub-second so shutdown stays
    /// responsive.
    pub block: Duration,
    /// Idle sleep when the stream has nothing new.
    pub poll_interval: Duration,
    /// Size-based flush trigger for the commit buffer.
    pub buffer_max_batch_size: usize,
    /// Time-based flush trigger, measured from the first buffered entry.
    pub buffer_max_wait: Duration,
    /// Pending entries idle longer than this are considered abandoned.
    pub claim_min_idle: Duration,
    /// How often the running worker sweeps for abandoned entries.
    pub claim_interval: Duration,
}

impl Default for StreamWorkerConfig {
    fn default() -> Self {
        StreamWorkerConfig {
            table: "logs".to_string(),
            read_batch: 2_000,
            block: Duration::from_millis(250),
            poll_interval: Duration::from_millis(5),
            buffer_max_batch_size: 100_000,
            buffer_max_wait: Duration::from_secs(1),
            claim_min_idle: Duration::from_secs(30),
            claim_interval: Duration::from_secs(30),
        }
    }
}

/// Lifecycle of one worker, exposed through its stats snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum WorkerState {
    Init,
    RecoverSelf,
    RecoverAbandoned,
    Running,
    Draining,
    Stopped,
}

impl WorkerState {
    fn from_u8(value: u8) -> WorkerState {
        match value {
            0 => WorkerState::Init,
            1 => WorkerState::RecoverSelf,
            2 => WorkerState::RecoverAbandoned,
            3 => WorkerState::Running,
            4 => WorkerState::Draining,
            _ => WorkerState::Stopped,
        }
    }
}

#[derive(Debug, Default)]
pub struct WorkerCounters {
    pub state: AtomicU8,
    pub entries_read: AtomicU64,
    pub entries_recovered: AtomicU64,
    pub entries_claimed: AtomicU64,
    pub poison_entries: AtomicU64,
    pub commits: AtomicU64,
    pub commit_failures: AtomicU64,
    pub records_committed: AtomicU64,
    pub entries_acked: AtomicU64,
    pub ack_failures: AtomicU64,
    pub dead_lettered_batches: AtomicU64,
    pub buffer_fill: AtomicU64,
    pub commit_time_ms: AtomicU64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct WorkerSnapshot {
    pub consumer: String,
    pub state: String,
    pub entries_read: u64,
    pub entries_recovered: u64,
    pub entries_claimed: u64,
    pub poison_entries: u64,
    pub commits: u64,
    pub commit_failures: u64,
    pub records_committed: u64,
    pub entries_acked: u64,
    pub ack_failures: u64,
    pub dead_lettered_batches: u64,
    pub buffer_fill: u64,
    /// mean wall time of one store insert, 0.0 before the first commit
    pub average_commit_ms: f64,
}

impl WorkerCounters {
    pub fn snapshot(&self, consumer: &str) -> WorkerSnapshot {
        let commits = self.commits.load(Ordering::Relaxed);
        WorkerSnapshot {
            consumer: consumer.to_string(),
            state: WorkerState::from_u8(self.state.load(Ordering::Relaxed)).to_string(),
            entries_read: self.entries_read.load(Ordering::Relaxed),
            entries_recovered: self.entries_recovered.load(Ordering::Relaxed),
            entries_claimed: self.entries_claimed.load(Ordering::Relaxed),
            poison_entries: self.poison_entries.load(Ordering::Relaxed),
            commits,
            commit_failures: self.commit_failures.load(Ordering::Relaxed),
            records_committed: self.records_committed.load(Ordering::Relaxed),
            entries_acked: self.entries_acked.load(Ordering::Relaxed),
            ack_failures: self.ack_failures.load(Ordering::Relaxed),
            dead_lettered_batches: self.dead_lettered_batches.load(Ordering::Relaxed),
            buffer_fill: self.buffer_fill.load(Ordering::Relaxed),
            average_commit_ms: if commits > 0 {
                self.commit_time_ms.load(Ordering::Relaxed) as f64 / commits as f64
            } else {
                0.0
            },
        }
    }
}

struct BufferedEntry {
    id: String,
    row: serde_json::Value,
    deliveries: u64,
}

/// One consumer of the group: reads entries over a dedicated connection,
/// accumulates them, commits to the columnar store, and acks only after the
/// commit succeeded. The stream stays authoritative the whole way: anything
/// this worker buffers is still pending in the group, so a crash at any
/// point is recovered by re-delivery.
///
/// Commits run as their own task so the read loop keeps pulling entries into
/// a successor buffer while a flush is in flight. At most one flush runs at
/// a time per worker; while one is in flight the buffer simply keeps
/// accumulating.
pub struct StreamWorker {
    consumer: String,
    stream: Arc<dyn ReplayStream>,
    config: StreamWorkerConfig,
    counters: Arc<WorkerCounters>,
    drain: CancellationToken,
    committer: Committer,
    buffer: Vec<BufferedEntry>,
    buffer_started: Option<Instant>,
    in_flight: Option<tokio::task::JoinHandle<()>>,
}

impl StreamWorker {
    pub fn new(
        consumer: impl Into<String>,
        stream: Arc<dyn ReplayStream>,
        store: Arc<dyn ColumnarStore>,
        dead_letter: Arc<dyn DeadLetterQueue>,
        config: StreamWorkerConfig,
        drain: CancellationToken,
    ) -> StreamWorker {
        let consumer = consumer.into();
        let counters = Arc::new(WorkerCounters::default());
        let committer = Committer {
            consumer: consumer.clone(),
            table: config.table.clone(),
            stream: stream.clone(),
            store,
            dead_letter,
            counters: counters.clone(),
        };
        StreamWorker {
            consumer,
            stream,
            config,
            counters,
            drain,
            committer,
            buffer: Vec::new(),
            buffer_started: None,
            in_flight: None,
        }
    }

    pub fn counters(&self) -> Arc<WorkerCounters> {
        self.counters.clone()
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    fn set_state(&self, state: WorkerState) {
        debug!("worker {} entering state {state}", self.consumer);
        self.counters.state.store(state as u8, Ordering::Relaxed);
    }

    /// Run until the drain token fires, then flush once and stop.
    pub async fn run(mut self) -> Result<(), WorkerError> {
        self.set_state(WorkerState::Init);
        self.stream
            .create_group()
            .await
            .map_err(WorkerError::GroupSetup)?;

        self.recover_own_pending().await?;
        self.recover_abandoned().await?;

        self.set_state(WorkerState::Running);
        info!("worker {} is running", self.consumer);

        let mut next_claim = Instant::now() + self.config.claim_interval;
        let mut claim_cursor = SCAN_START.to_string();

        while !self.drain.is_cancelled() {
            let block = self.next_block_time();
            let read = tokio::select! {
                result = self.stream.read_new(&self.consumer, self.config.read_batch, block) => result,
                _ = self.drain.cancelled() => break,
            };

            match read {
                Ok(entries) if !entries.is_empty() => {
                    self.counters
                        .entries_read
                        .fetch_add(entries.len() as u64, Ordering::Relaxed);
                    self.buffer_entries(entries).await;
                }
                Ok(_) => {
                    if self.buffer.is_empty() {
                        tokio::select! {
                            _ = tokio::time::sleep(self.config.poll_interval) => {}
                            _ = self.drain.cancelled() => break,
                        }
                    }
                }
                Err(err) => {
                    warn!("worker {} read failed: {err}", self.consumer);
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.block) => {}
                        _ = self.drain.cancelled() => break,
                    }
                }
            }

            self.maybe_flush();

            if Instant::now() >= next_claim {
                claim_cursor = self.claim_sweep(claim_cursor).await;
                next_claim = Instant::now() + self.config.claim_interval;
            }
        }

        // Draining: no more reads, wait for the in-flight commit, flush the
        // buffer once, then stop. Anything that cannot be flushed in time
        // stays pending for the next process life.
        self.set_state(WorkerState::Draining);
        if let Some(handle) = self.in_flight.take() {
            if let Err(err) = handle.await {
                warn!("worker {} in-flight commit panicked: {err}", self.consumer);
            }
        }
        let remainder = std::mem::take(&mut self.buffer);
        self.counters.buffer_fill.store(0, Ordering::Relaxed);
        self.committer.commit(remainder).await;
        self.set_state(WorkerState::Stopped);
        info!("worker {} stopped", self.consumer);
        Ok(())
    }

    /// Page through entries this consumer name already owned in a previous
    /// life and feed them back through the buffer as if freshly read.
    async fn recover_own_pending(&mut self) -> Result<(), WorkerError> {
        self.set_state(WorkerState::RecoverSelf);

        let mut cursor = SCAN_START.to_string();
        loop {
            let entries = self
                .stream
                .read_pending(&self.consumer, &cursor, self.config.read_batch)
                .await
                .map_err(WorkerError::Recovery)?;
            if entries.is_empty() {
                break;
            }

            cursor = entries
                .last()
                .expect("the empty case breaks out above")
                .id
                .clone();
            self.counters
                .entries_recovered
                .fetch_add(entries.len() as u64, Ordering::Relaxed);
            info!(
                "worker {} recovered {} of its own pending entries",
                self.consumer,
                entries.len()
            );
            self.buffer_entries(entries).await;
        }
        Ok(())
    }

    /// Claim entries abandoned by crashed or wedged consumers anywhere in
    /// the group.
    async fn recover_abandoned(&mut self) -> Result<(), WorkerError> {
        self.set_state(WorkerState::RecoverAbandoned);

        let mut cursor = SCAN_START.to_string();
        loop {
            let (next_cursor, entries) = self
                .stream
                .auto_claim(
                    &self.consumer,
                    self.config.claim_min_idle,
                    &cursor,
                    self.config.read_batch,
                )
                .await
                .map_err(WorkerError::Recovery)?;

            if !entries.is_empty() {
                self.counters
                    .entries_claimed
                    .fetch_add(entries.len() as u64, Ordering::Relaxed);
                info!(
                    "worker {} claimed {} abandoned entries",
                    self.consumer,
                    entries.len()
                );
                self.buffer_entries(entries).await;
            }

            if next_cursor == SCAN_START {
                break;
            }
            cursor = next_cursor;
        }
        Ok(())
    }

    /// One page of the periodic abandoned-entry sweep. Returns the cursor to
    /// resume from next time.
    async fn claim_sweep(&mut self, cursor: String) -> String {
        match self
            .stream
            .auto_claim(
                &self.consumer,
                self.config.claim_min_idle,
                &cursor,
                self.config.read_batch,
            )
            .await
        {
            Ok((next_cursor, entries)) => {
                if !entries.is_empty() {
                    self.counters
                        .entries_claimed
                        .fetch_add(entries.len() as u64, Ordering::Relaxed);
                    info!(
                        "worker {} claimed {} stale entries in a sweep",
                        self.consumer,
                        entries.len()
                    );
                    self.buffer_entries(entries).await;
                }
                next_cursor
            }
            Err(err) => {
                warn!("worker {} claim sweep failed: {err}", self.consumer);
                cursor
            }
        }
    }

    /// Parse and buffer delivered entries. Malformed entries are acked and
    /// dropped right here so they can never wedge the group.
    async fn buffer_entries(&mut self, entries: Vec<StreamEntry>) {
        let mut poison = Vec::new();
        for entry in entries {
            match serde_json::from_str::<NormalizedRecord>(&entry.payload) {
                Ok(record) => {
                    if self.buffer.is_empty() {
                        self.buffer_started = Some(Instant::now());
                    }
                    self.buffer.push(BufferedEntry {
                        id: entry.id,
                        row: serde_json::to_value(&record)
                            .expect("a normalized record always serializes to JSON"),
                        deliveries: entry.deliveries,
                    });
                }
                Err(err) => {
                    warn!(
                        "worker {} dropping malformed entry {}: {err}",
                        self.consumer, entry.id
                    );
                    poison.push(entry.id);
                }
            }
        }

        if !poison.is_empty() {
            self.counters
                .poison_entries
                .fetch_add(poison.len() as u64, Ordering::Relaxed);
            if let Err(err) = self.stream.ack(&poison).await {
                // They will be redelivered and dropped again; annoying but
                // harmless
                warn!(
                    "worker {} failed to ack {} poison entries: {err}",
                    self.consumer,
                    poison.len()
                );
            }
        }

        self.counters
            .buffer_fill
            .store(self.buffer.len() as u64, Ordering::Relaxed);

        self.maybe_flush();
    }

    fn commit_in_flight(&self) -> bool {
        self.in_flight
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    fn next_block_time(&self) -> Duration {
        // While a commit is in flight nothing can be flushed anyway, so a
        // full block is fine even when the buffer deadline has passed
        if self.commit_in_flight() {
            return self.config.block;
        }
        match self.buffer_started {
            // Nothing buffered: a full block keeps the read cheap
            None => self.config.block,
            // Something buffered: never block past the flush deadline
            Some(started) => {
                let deadline = started + self.config.buffer_max_wait;
                deadline
                    .saturating_duration_since(Instant::now())
                    .min(self.config.block)
            }
        }
    }

    /// Hand the buffer to a commit task when a flush trigger has fired and
    /// no commit is already in flight. Reads keep going while the spawned
    /// commit runs; the buffer that replaces the handed-off one is the
    /// successor buffer, and it simply keeps accumulating if a trigger fires
    /// again before the commit finishes.
    fn maybe_flush(&mut self) {
        if self.buffer.is_empty() || self.commit_in_flight() {
            return;
        }

        let over_size = self.buffer.len() >= self.config.buffer_max_batch_size;
        let over_time = self
            .buffer_started
            .is_some_and(|started| started.elapsed() >= self.config.buffer_max_wait);
        if !(over_size || over_time) {
            return;
        }

        let batch = std::mem::take(&mut self.buffer);
        self.buffer_started = None;
        self.counters.buffer_fill.store(0, Ordering::Relaxed);

        let committer = self.committer.clone();
        self.in_flight = Some(tokio::spawn(async move {
            committer.commit(batch).await;
        }));
    }
}

/// The commit phase of one worker, split out so it can run as its own task
/// while the worker's read loop keeps going.
#[derive(Clone)]
struct Committer {
    consumer: String,
    table: String,
    stream: Arc<dyn ReplayStream>,
    store: Arc<dyn ColumnarStore>,
    dead_letter: Arc<dyn DeadLetterQueue>,
    counters: Arc<WorkerCounters>,
}

impl Committer {
    /// Step order is load-bearing: insert first, ack only after the insert
    /// succeeded. A failed insert leaves every id pending in the stream and
    /// copies the batch to the dead-letter queue; a failed ack after a
    /// successful insert is tolerated (the entries will be committed again,
    /// which the store-side deduplication absorbs).
    async fn commit(&self, batch: Vec<BufferedEntry>) {
        if batch.is_empty() {
            return;
        }

        let mut ids = Vec::with_capacity(batch.len());
        let mut rows = Vec::with_capacity(batch.len());
        let mut max_deliveries = 1u64;
        for entry in batch {
            ids.push(entry.id);
            rows.push(entry.row);
            max_deliveries = max_deliveries.max(entry.deliveries);
        }

        let commit_start = Instant::now();
        match self.store.insert(&self.table, &rows).await {
            Ok(()) => {
                self.counters.commits.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .records_committed
                    .fetch_add(rows.len() as u64, Ordering::Relaxed);
                self.counters.commit_time_ms.fetch_add(
                    commit_start.elapsed().as_millis() as u64,
                    Ordering::Relaxed,
                );
                debug!(
                    "worker {} committed {} records in {:?}",
                    self.consumer,
                    rows.len(),
                    commit_start.elapsed()
                );

                match self.stream.ack(&ids).await {
                    Ok(acked) => {
                        self.counters.entries_acked.fetch_add(acked, Ordering::Relaxed);
                    }
                    Err(err) => {
                        // Committed but not acked: the entries stay pending
                        // and will be claimed and committed again
                        self.counters.ack_failures.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            "worker {} committed {} records but failed to ack: {err}",
                            self.consumer,
                            ids.len()
                        );
                    }
                }
            }
            Err(err) => {
                self.counters.commit_failures.fetch_add(1, Ordering::Relaxed);
                error!(
                    "worker {} commit of {} records failed: {err}",
                    self.consumer,
                    rows.len()
                );

                let now = Utc::now();
                let item = DeadLetterItem {
                    records: rows,
                    error: err.to_string(),
                    attempt: max_deliveries.saturating_sub(1),
                    first_seen: now,
                    last_error: now,
                    source_component: self.consumer.clone(),
                };
                match self.dead_letter.queue_for_retry(item).await {
                    Ok(()) => {
                        self.counters
                            .dead_lettered_batches
                            .fetch_add(1, Ordering::Relaxed);
                    }
                    Err(dl_err) => {
                        // The stream still holds the entries as pending, so
                        // nothing is lost even when the dead letter fails
                        error!(
                            "worker {} could not dead-letter a failed batch: {dl_err}",
                            self.consumer
                        );
                    }
                }
                // No ack: the ids stay pending for re-claim
            }
        }
    }
}
