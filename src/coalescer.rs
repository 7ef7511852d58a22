use crate::record::{IngestResult, RawRecord};
use crate::service::{IngestError, IngestService};
use log::{debug, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct CoalescerConfig {
    /// Flush window measured from the first pending record in a buffer.
    pub max_wait: Duration,
    /// Records per staging buffer; reaching it flushes immediately, and a
    /// single call of this size or larger bypasses staging entirely.
    pub max_batch_size: usize,
    pub enabled: bool,
}

impl Default for CoalescerConfig {
    fn default() -> Self {
        CoalescerConfig {
            max_wait: Duration::from_millis(10),
            max_batch_size: 100,
            enabled: true,
        }
    }
}

#[derive(Debug, Default)]
pub struct CoalescerCounters {
    pub calls: AtomicU64,
    pub records_staged: AtomicU64,
    pub bypassed_calls: AtomicU64,
    pub flushes_size: AtomicU64,
    pub flushes_time: AtomicU64,
    pub flushes_forced: AtomicU64,
    pub batches_dispatched: AtomicU64,
    pub records_dispatched: AtomicU64,
    pub pending_records: AtomicU64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CoalescerSnapshot {
    pub calls: u64,
    pub records_staged: u64,
    pub bypassed_calls: u64,
    pub flushes_size: u64,
    pub flushes_time: u64,
    pub flushes_forced: u64,
    pub batches_dispatched: u64,
    pub records_dispatched: u64,
    pub pending_records: u64,
    /// callers merged per dispatched batch, 0.0 before the first flush
    pub coalescing_rate: f64,
}

impl CoalescerCounters {
    pub fn snapshot(&self) -> CoalescerSnapshot {
        let batches = self.batches_dispatched.load(Ordering::Relaxed);
        let calls = self.calls.load(Ordering::Relaxed);
        let bypassed = self.bypassed_calls.load(Ordering::Relaxed);
        CoalescerSnapshot {
            calls,
            records_staged: self.records_staged.load(Ordering::Relaxed),
            bypassed_calls: bypassed,
            flushes_size: self.flushes_size.load(Ordering::Relaxed),
            flushes_time: self.flushes_time.load(Ordering::Relaxed),
            flushes_forced: self.flushes_forced.load(Ordering::Relaxed),
            batches_dispatched: batches,
            records_dispatched: self.records_dispatched.load(Ordering::Relaxed),
            pending_records: self.pending_records.load(Ordering::Relaxed),
            coalescing_rate: if batches > 0 {
                (calls - bypassed) as f64 / batches as f64
            } else {
                0.0
            },
        }
    }
}

enum FlushTrigger {
    Size,
    // Carries the staging generation the timer was armed for, so a timer
    // whose buffer was already flushed by the size trigger is absorbed
    Timer(u64),
    Forced,
}

struct StagedCall {
    records: Vec<RawRecord>,
    reply: oneshot::Sender<Result<IngestResult, IngestError>>,
}

struct Staging {
    active: Vec<StagedCall>,
    /// The buffer not currently staging: either waiting to be swapped in, or
    /// momentarily owned by the in-flight flush.
    spare: Option<Vec<StagedCall>>,
    pending_records: usize,
    generation: u64,
}

/// Merges concurrent small `add` calls into one coalesced batch for the
/// ingestion service.
///
/// Staging is double-buffered: two pre-allocated buffers swap roles on every
/// flush, so the hot path never reallocates and never copies the staged
/// region. The state lock is held only for push/swap bookkeeping, never
/// across the dispatch into the service. Exactly one flush runs at a time;
/// callers are resolved individually through one-shot handles once their
/// batch's results come back.
#[derive(Clone)]
pub struct Coalescer {
    inner: Arc<Inner>,
}

struct Inner {
    config: CoalescerConfig,
    service: Arc<IngestService>,
    state: Mutex<Staging>,
    flush_lock: tokio::sync::Mutex<()>,
    counters: Arc<CoalescerCounters>,
    shutdown: CancellationToken,
}

impl Coalescer {
    pub fn new(
        config: CoalescerConfig,
        service: Arc<IngestService>,
        shutdown: CancellationToken,
    ) -> Coalescer {
        let capacity = config.max_batch_size;
        Coalescer {
            inner: Arc::new(Inner {
                config,
                service,
                state: Mutex::new(Staging {
                    active: Vec::with_capacity(capacity),
                    spare: Some(Vec::with_capacity(capacity)),
                    pending_records: 0,
                    generation: 0,
                }),
                flush_lock: tokio::sync::Mutex::new(()),
                counters: Arc::new(CoalescerCounters::default()),
                shutdown,
            }),
        }
    }

    pub fn counters(&self) -> Arc<CoalescerCounters> {
        self.inner.counters.clone()
    }

    pub fn snapshot(&self) -> CoalescerSnapshot {
        self.inner.counters.snapshot()
    }

    /// Stage one caller's records and wait for the flush that carries them.
    /// Record positions within this call are preserved end-to-end; there is
    /// no ordering guarantee across callers.
    pub async fn add(&self, records: Vec<RawRecord>) -> Result<IngestResult, IngestError> {
        let inner = &self.inner;
        inner.counters.calls.fetch_add(1, Ordering::Relaxed);

        if records.is_empty() {
            return Err(IngestError::EmptyBatch);
        }

        // Coalescing off, or the call alone fills a buffer: skip staging
        if !inner.config.enabled || records.len() >= inner.config.max_batch_size {
            inner.counters.bypassed_calls.fetch_add(1, Ordering::Relaxed);
            return inner.service.process_single(records).await;
        }

        let mut records = Some(records);
        let reply_rx = loop {
            let staged = {
                let mut staging = inner.state.lock();
                let len = records
                    .as_ref()
                    .expect("records are only taken once staging succeeds")
                    .len();

                // The staged region is bounded by the buffer size. If this
                // call does not fit, flush what is there and restage.
                if staging.pending_records + len > inner.config.max_batch_size {
                    Err(staging.generation)
                } else {
                    if staging.pending_records == 0 {
                        self.arm_timer(staging.generation);
                    }

                    let (reply_tx, reply_rx) = oneshot::channel();
                    staging.pending_records += len;
                    inner
                        .counters
                        .records_staged
                        .fetch_add(len as u64, Ordering::Relaxed);
                    inner
                        .counters
                        .pending_records
                        .store(staging.pending_records as u64, Ordering::Relaxed);
                    let full = staging.pending_records >= inner.config.max_batch_size;
                    staging.active.push(StagedCall {
                        records: records.take().expect("checked non-empty just above"),
                        reply: reply_tx,
                    });
                    Ok((reply_rx, full.then_some(staging.generation)))
                }
            };

            match staged {
                Ok((reply_rx, Some(generation))) => {
                    // This call filled the buffer; push it out on the way in
                    self.flush(FlushTrigger::Size, Some(generation)).await;
                    break reply_rx;
                }
                Ok((reply_rx, None)) => break reply_rx,
                Err(generation) => {
                    self.flush(FlushTrigger::Size, Some(generation)).await;
                }
            }
        };

        reply_rx.await.unwrap_or(Err(IngestError::ShuttingDown))
    }

    /// Flush whatever is currently staged, regardless of the window.
    pub async fn force_flush(&self) {
        self.flush(FlushTrigger::Forced, None).await;
    }

    fn arm_timer(&self, generation: u64) {
        let coalescer = self.clone();
        let max_wait = self.inner.config.max_wait;
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(max_wait) => {
                    coalescer
                        .flush(FlushTrigger::Timer(generation), Some(generation))
                        .await;
                }
                _ = coalescer.inner.shutdown.cancelled() => {
                    // Shutdown drains through force_flush; the timer just goes away
                }
            }
        });
    }

    async fn flush(&self, trigger: FlushTrigger, target_generation: Option<u64>) {
        let inner = &self.inner;
        let _flush_guard = inner.flush_lock.lock().await;

        let mut batch = {
            let mut staging = inner.state.lock();
            if let Some(generation) = target_generation {
                if staging.generation != generation {
                    // Another trigger beat this one to the same buffer
                    return;
                }
            }
            if staging.active.is_empty() {
                return;
            }

            staging.generation += 1;
            staging.pending_records = 0;
            inner.counters.pending_records.store(0, Ordering::Relaxed);

            let spare = staging
                .spare
                .take()
                .expect("the spare buffer is always returned before the flush lock is released");
            std::mem::replace(&mut staging.active, spare)
        };

        match trigger {
            FlushTrigger::Size => inner.counters.flushes_size.fetch_add(1, Ordering::Relaxed),
            FlushTrigger::Timer(_) => inner.counters.flushes_time.fetch_add(1, Ordering::Relaxed),
            FlushTrigger::Forced => inner.counters.flushes_forced.fetch_add(1, Ordering::Relaxed),
        };

        let mut calls = Vec::with_capacity(batch.len());
        let mut replies = Vec::with_capacity(batch.len());
        let mut record_count = 0;
        for staged in batch.drain(..) {
            record_count += staged.records.len();
            calls.push(staged.records);
            replies.push(staged.reply);
        }

        debug!(
            "flushing {} records from {} callers",
            record_count,
            calls.len()
        );
        inner
            .counters
            .batches_dispatched
            .fetch_add(1, Ordering::Relaxed);
        inner
            .counters
            .records_dispatched
            .fetch_add(record_count as u64, Ordering::Relaxed);

        // The dispatch happens with no locks held except the flush guard
        match inner.service.process_batch(calls).await {
            Ok(results) => {
                debug_assert_eq!(results.len(), replies.len());
                for (reply, result) in replies.into_iter().zip(results) {
                    let _ = reply.send(Ok(result));
                }
            }
            Err(error) => {
                warn!("coalesced batch failed as a whole: {error}");
                // Batch-wide infrastructure failure: no partial resolution
                for reply in replies {
                    let _ = reply.send(Err(error.clone()));
                }
            }
        }

        // Hand the (now empty, still allocated) buffer back for the next swap
        inner.state.lock().spare = Some(batch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::ServiceConfig;
    use futures::future::join_all;
    use serde_json::json;
    use streamq::MemoryStream;

    fn record(message: &str) -> RawRecord {
        json!({"app_id": "A", "message": message, "level": "info", "source": "s"})
    }

    fn coalescer_with(
        config: CoalescerConfig,
        stream: Arc<MemoryStream>,
    ) -> (Coalescer, CancellationToken) {
        let service = Arc::new(IngestService::new(ServiceConfig::default(), None, stream));
        let shutdown = CancellationToken::new();
        (Coalescer::new(config, service, shutdown.clone()), shutdown)
    }

    #[tokio::test(start_paused = true)]
    async fn window_flush_merges_concurrent_calls() {
        let stream = Arc::new(MemoryStream::new());
        let (coalescer, _shutdown) = coalescer_with(
            CoalescerConfig {
                max_wait: Duration::from_millis(50),
                max_batch_size: 100,
                enabled: true,
            },
            stream.clone(),
        );

        let adds = (0..10).map(|n| {
            let coalescer = coalescer.clone();
            async move { coalescer.add(vec![record(&format!("m{n}"))]).await }
        });
        let results = join_all(adds).await;

        for result in results {
            let result = result.unwrap();
            assert_eq!(result.accepted, 1);
            assert_eq!(result.rejected, 0);
        }

        // One flush carried all ten callers
        let snapshot = coalescer.snapshot();
        assert_eq!(snapshot.batches_dispatched, 1);
        assert_eq!(snapshot.flushes_time, 1);
        assert_eq!(snapshot.records_dispatched, 10);
        assert_eq!(stream.log_len(), 10);
    }

    #[tokio::test]
    async fn filling_the_buffer_flushes_without_waiting_for_the_window() {
        let stream = Arc::new(MemoryStream::new());
        let (coalescer, _shutdown) = coalescer_with(
            CoalescerConfig {
                // Window long enough that only the size trigger can fire
                max_wait: Duration::from_secs(60),
                max_batch_size: 5,
                enabled: true,
            },
            stream.clone(),
        );

        let adds = (0..5).map(|n| {
            let coalescer = coalescer.clone();
            async move { coalescer.add(vec![record(&format!("m{n}"))]).await }
        });
        for result in join_all(adds).await {
            assert_eq!(result.unwrap().accepted, 1);
        }

        let snapshot = coalescer.snapshot();
        assert_eq!(snapshot.flushes_size, 1);
        assert_eq!(snapshot.batches_dispatched, 1);
        assert_eq!(stream.log_len(), 5);
    }

    #[tokio::test]
    async fn oversized_call_bypasses_staging() {
        let stream = Arc::new(MemoryStream::new());
        let (coalescer, _shutdown) = coalescer_with(
            CoalescerConfig {
                max_wait: Duration::from_secs(60),
                max_batch_size: 5,
                enabled: true,
            },
            stream.clone(),
        );

        let records: Vec<RawRecord> = (0..5).map(|n| record(&format!("m{n}"))).collect();
        let result = coalescer.add(records).await.unwrap();

        assert_eq!(result.accepted, 5);
        let snapshot = coalescer.snapshot();
        assert_eq!(snapshot.bypassed_calls, 1);
        assert_eq!(snapshot.batches_dispatched, 0);
        assert_eq!(stream.log_len(), 5);
    }

    #[tokio::test]
    async fn disabled_coalescing_goes_straight_through() {
        let stream = Arc::new(MemoryStream::new());
        let (coalescer, _shutdown) = coalescer_with(
            CoalescerConfig {
                enabled: false,
                ..CoalescerConfig::default()
            },
            stream.clone(),
        );

        let result = coalescer.add(vec![record("solo")]).await.unwrap();
        assert_eq!(result.accepted, 1);
        assert_eq!(coalescer.snapshot().bypassed_calls, 1);
        assert_eq!(stream.log_len(), 1);
    }

    #[tokio::test]
    async fn empty_call_is_rejected_before_staging() {
        let stream = Arc::new(MemoryStream::new());
        let (coalescer, _shutdown) = coalescer_with(CoalescerConfig::default(), stream.clone());

        let result = coalescer.add(Vec::new()).await;
        assert!(matches!(result, Err(IngestError::EmptyBatch)));
        assert_eq!(stream.log_len(), 0);
    }

    #[tokio::test]
    async fn force_flush_resolves_staged_callers() {
        let stream = Arc::new(MemoryStream::new());
        let (coalescer, _shutdown) = coalescer_with(
            CoalescerConfig {
                max_wait: Duration::from_secs(60),
                max_batch_size: 100,
                enabled: true,
            },
            stream.clone(),
        );

        let add = {
            let coalescer = coalescer.clone();
            tokio::spawn(async move { coalescer.add(vec![record("staged")]).await })
        };
        // Let the add stage before flushing
        tokio::time::sleep(Duration::from_millis(10)).await;
        coalescer.force_flush().await;

        let result = add.await.unwrap().unwrap();
        assert_eq!(result.accepted, 1);
        assert_eq!(coalescer.snapshot().flushes_forced, 1);
    }

    #[tokio::test]
    async fn batch_wide_failure_reaches_every_caller() {
        let stream = Arc::new(MemoryStream::new());
        stream.fail_next_appends(1);
        let (coalescer, _shutdown) = coalescer_with(
            CoalescerConfig {
                max_wait: Duration::from_millis(5),
                max_batch_size: 100,
                enabled: true,
            },
            stream.clone(),
        );

        let adds = (0..3).map(|n| {
            let coalescer = coalescer.clone();
            async move { coalescer.add(vec![record(&format!("m{n}"))]).await }
        });
        let results = join_all(adds).await;

        for result in results {
            assert!(matches!(result, Err(IngestError::StorageUnavailable(_))));
        }
        assert_eq!(stream.log_len(), 0);
    }
}
