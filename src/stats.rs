use crate::coalescer::CoalescerSnapshot;
use crate::service::ServiceSnapshot;
use crate::stream_worker::WorkerSnapshot;
use crate::worker_pool::PoolSnapshot;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct IdempotencyCounters {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub stored: AtomicU64,
    /// Backend failures that were degraded open
    pub degraded: AtomicU64,
    /// Concurrent duplicate calls that waited on the first call's result
    pub duplicate_waiters: AtomicU64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct IdempotencySnapshot {
    pub hits: u64,
    pub misses: u64,
    pub stored: u64,
    pub degraded: u64,
    pub duplicate_waiters: u64,
}

impl IdempotencyCounters {
    pub fn snapshot(&self) -> IdempotencySnapshot {
        IdempotencySnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stored: self.stored.load(Ordering::Relaxed),
            degraded: self.degraded.load(Ordering::Relaxed),
            duplicate_waiters: self.duplicate_waiters.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct DeadLetterStats {
    /// Failed batches handed to the dead-letter queue by this process
    pub queued_batches: u64,
}

/// One pure snapshot of the whole pipeline, composed from the counters each
/// component maintains. Taking a snapshot performs no I/O.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PipelineStats {
    pub coalescer: CoalescerSnapshot,
    pub service: ServiceSnapshot,
    pub worker_pool: Option<PoolSnapshot>,
    pub stream_workers: Vec<WorkerSnapshot>,
    pub idempotency: IdempotencySnapshot,
    pub dead_letter: DeadLetterStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotency_snapshot_reflects_counters() {
        let counters = IdempotencyCounters::default();
        counters.hits.fetch_add(3, Ordering::Relaxed);
        counters.degraded.fetch_add(1, Ordering::Relaxed);

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.hits, 3);
        assert_eq!(snapshot.degraded, 1);
        assert_eq!(snapshot.misses, 0);
    }
}
