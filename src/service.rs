use crate::record::{IngestResult, PositionalError, RawRecord};
use crate::validate::{ValidationOutcome, validate_batch};
use crate::worker_pool::{PoolError, ValidationPool};
use chrono::Utc;
use itertools::Itertools;
use log::{debug, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use streamq::{ReplayStream, StreamError};
use thiserror::Error;

/// Batch-wide failures. These carry a single identity for every caller in
/// the coalesced batch, so the error must be cheap to clone.
#[derive(Debug, Clone, Error)]
pub enum IngestError {
    #[error("batch is empty")]
    EmptyBatch,

    #[error("ingestion pipeline is overloaded")]
    Overloaded,

    #[error("appending accepted records to the stream failed: {0}")]
    StorageUnavailable(Arc<StreamError>),

    #[error("pipeline is shutting down")]
    ShuttingDown,
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// At or below this many records, validation runs inline on the calling
    /// task instead of being shipped to the worker pool.
    pub small_batch_threshold: usize,
    pub worker_validation_enabled: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            small_batch_threshold: 50,
            worker_validation_enabled: true,
        }
    }
}

#[derive(Debug, Default)]
pub struct ServiceCounters {
    pub batches: AtomicU64,
    pub calls: AtomicU64,
    pub records_in: AtomicU64,
    pub records_accepted: AtomicU64,
    pub records_rejected: AtomicU64,
    pub validations_inline: AtomicU64,
    pub validations_offloaded: AtomicU64,
    pub worker_lost_fallbacks: AtomicU64,
    pub append_failures: AtomicU64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ServiceSnapshot {
    pub batches: u64,
    pub calls: u64,
    pub records_in: u64,
    pub records_accepted: u64,
    pub records_rejected: u64,
    pub validations_inline: u64,
    pub validations_offloaded: u64,
    pub worker_lost_fallbacks: u64,
    pub append_failures: u64,
    /// records per dispatched batch, 0.0 before the first batch
    pub average_batch_size: f64,
}

impl ServiceCounters {
    pub fn snapshot(&self) -> ServiceSnapshot {
        let batches = self.batches.load(Ordering::Relaxed);
        let records_in = self.records_in.load(Ordering::Relaxed);
        ServiceSnapshot {
            batches,
            calls: self.calls.load(Ordering::Relaxed),
            records_in,
            records_accepted: self.records_accepted.load(Ordering::Relaxed),
            records_rejected: self.records_rejected.load(Ordering::Relaxed),
            validations_inline: self.validations_inline.load(Ordering::Relaxed),
            validations_offloaded: self.validations_offloaded.load(Ordering::Relaxed),
            worker_lost_fallbacks: self.worker_lost_fallbacks.load(Ordering::Relaxed),
            append_failures: self.append_failures.load(Ordering::Relaxed),
            average_batch_size: if batches > 0 {
                records_in as f64 / batches as f64
            } else {
                0.0
            },
        }
    }
}

/// Takes one coalesced batch from the coalescer, validates it (inline or via
/// the worker pool), appends every surviving record to the replayable stream
/// as one all-or-nothing operation, and shapes one `IngestResult` per caller.
pub struct IngestService {
    config: ServiceConfig,
    pool: Option<Arc<ValidationPool>>,
    stream: Arc<dyn ReplayStream>,
    counters: Arc<ServiceCounters>,
}

impl IngestService {
    pub fn new(
        config: ServiceConfig,
        pool: Option<Arc<ValidationPool>>,
        stream: Arc<dyn ReplayStream>,
    ) -> IngestService {
        IngestService {
            config,
            pool,
            stream,
            counters: Arc::new(ServiceCounters::default()),
        }
    }

    pub fn counters(&self) -> Arc<ServiceCounters> {
        self.counters.clone()
    }

    pub fn snapshot(&self) -> ServiceSnapshot {
        self.counters.snapshot()
    }

    /// Process one coalesced batch. The return vec has exactly one element
    /// per caller sub-batch, in order. Positional error indices in each
    /// result are relative to that caller's own input.
    pub async fn process_batch(
        &self,
        calls: Vec<Vec<RawRecord>>,
    ) -> Result<Vec<IngestResult>, IngestError> {
        let started = Instant::now();

        // One pass for totals, then exact-size allocations throughout
        let total: usize = calls.iter().map(Vec::len).sum();
        let call_count = calls.len();
        self.counters.batches.fetch_add(1, Ordering::Relaxed);
        self.counters
            .calls
            .fetch_add(call_count as u64, Ordering::Relaxed);
        self.counters
            .records_in
            .fetch_add(total as u64, Ordering::Relaxed);

        // Flat-index -> caller table and per-caller offsets, so mapping an
        // error back to its caller is one array read
        let mut caller_of = Vec::with_capacity(total);
        let mut offsets = Vec::with_capacity(call_count);
        let mut flat = Vec::with_capacity(total);
        for (caller, records) in calls.into_iter().enumerate() {
            offsets.push(flat.len());
            caller_of.resize(caller_of.len() + records.len(), caller);
            flat.extend(records);
        }

        let outcome = self.validate(flat, total).await?;

        let mut errors_per_caller: Vec<Vec<PositionalError>> = vec![Vec::new(); call_count];
        for error in &outcome.errors {
            let caller = caller_of[error.index];
            errors_per_caller[caller].push(PositionalError {
                index: error.index - offsets[caller],
                kind: error.kind,
                message: error.message.clone(),
            });
        }

        if !outcome.valid.is_empty() {
            let payloads = outcome
                .valid
                .iter()
                .map(|record| {
                    serde_json::to_string(record)
                        .expect("a normalized record always serializes to JSON")
                })
                .collect_vec();

            if let Err(err) = self.stream.append_many(&payloads).await {
                self.counters.append_failures.fetch_add(1, Ordering::Relaxed);
                warn!("stream append of {} records failed: {err}", payloads.len());
                // Nothing is considered accepted; every caller in this batch
                // gets the same failure
                return Err(IngestError::StorageUnavailable(Arc::new(err)));
            }
            debug!("appended {} records to the stream", payloads.len());
        }

        self.counters
            .records_accepted
            .fetch_add(outcome.valid.len() as u64, Ordering::Relaxed);
        self.counters
            .records_rejected
            .fetch_add(outcome.errors.len() as u64, Ordering::Relaxed);

        let elapsed = started.elapsed();
        let mut results = Vec::with_capacity(call_count);
        for (caller, errors) in errors_per_caller.iter().enumerate() {
            let len = if caller + 1 < call_count {
                offsets[caller + 1] - offsets[caller]
            } else {
                total - offsets[caller]
            };
            results.push(IngestResult::from_errors(len, errors, elapsed));
        }
        Ok(results)
    }

    /// Process one caller's records outside of any coalesced batch (the
    /// coalescer's disabled/bypass path).
    pub async fn process_single(&self, records: Vec<RawRecord>) -> Result<IngestResult, IngestError> {
        let mut results = self.process_batch(vec![records]).await?;
        Ok(results
            .pop()
            .expect("process_batch returns one result per call"))
    }

    async fn validate(
        &self,
        flat: Vec<RawRecord>,
        total: usize,
    ) -> Result<ValidationOutcome, IngestError> {
        let now = Utc::now();

        let use_pool = self.config.worker_validation_enabled
            && total > self.config.small_batch_threshold
            && self.pool.is_some();

        if !use_pool {
            self.counters
                .validations_inline
                .fetch_add(1, Ordering::Relaxed);
            return Ok(validate_batch(&flat, now));
        }

        let pool = self
            .pool
            .as_ref()
            .expect("use_pool implies the pool is present");
        let shared = Arc::new(flat);
        self.counters
            .validations_offloaded
            .fetch_add(1, Ordering::Relaxed);

        match pool.execute_validation(shared.clone(), now).await {
            Ok(outcome) => Ok(outcome),
            Err(PoolError::WorkerLost) | Err(PoolError::TimedOut) => {
                // The batch is still in hand; one inline pass is cheaper than
                // failing the whole coalesced batch
                self.counters
                    .worker_lost_fallbacks
                    .fetch_add(1, Ordering::Relaxed);
                warn!("worker pool lost a validation task; validating inline");
                Ok(validate_batch(&shared, now))
            }
            Err(PoolError::Overloaded) => Err(IngestError::Overloaded),
            Err(PoolError::ShuttingDown) => Err(IngestError::ShuttingDown),
        }
    }
}
