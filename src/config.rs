use crate::coalescer::CoalescerConfig;
use crate::service::ServiceConfig;
use crate::stream_worker::StreamWorkerConfig;
use crate::worker_pool::PoolConfig;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use std::num::NonZero;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct IngestConfig {
    /// Coalescer flush window in milliseconds.
    pub coalescer_max_wait_time_ms: u64,
    pub coalescer_max_batch_size: usize,
    pub coalescer_enabled: bool,

    /// At or below this batch size validation runs inline.
    pub validation_small_batch_threshold: usize,
    pub worker_validation_enabled: bool,
    pub worker_pool_min: usize,
    /// Upper bound on pool workers; `None` means min(available cores, 8).
    pub worker_pool_max: Option<NonZero<usize>>,
    pub worker_task_timeout_ms: u64,
    pub worker_queue_depth: usize,

    pub stream_key: String,
    pub consumer_group: String,
    /// Consumer names are `<prefix>-<index>`.
    pub consumer_prefix: String,
    pub stream_read_batch: usize,
    pub stream_block_ms: u64,
    pub buffer_max_batch_size: usize,
    pub buffer_max_wait_time_ms: u64,
    pub poll_interval_ms: u64,
    pub claim_min_idle_ms: u64,
    pub stream_processor_count: usize,

    /// How long committed (acked) entries stay in the stream before the
    /// retention sweep trims them.
    pub stream_retention_minutes: u64,
    pub stream_trim_interval_ms: u64,

    pub idempotency_ttl_seconds: u64,
    pub idempotency_key_prefix: String,

    /// Retry budget for the out-of-band dead-letter worker.
    pub dead_letter_max_retries: u32,
    pub dead_letter_key: String,

    pub columnar_table: String,

    /// Per-step grace budget during shutdown; an expired step logs a warning
    /// and moves on.
    pub shutdown_step_budget_ms: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        IngestConfig {
            coalescer_max_wait_time_ms: 10,
            coalescer_max_batch_size: 100,
            coalescer_enabled: true,
            validation_small_batch_threshold: 50,
            worker_validation_enabled: true,
            worker_pool_min: 2,
            worker_pool_max: None,
            worker_task_timeout_ms: 30_000,
            worker_queue_depth: 256,
            stream_key: "loghouse:records".to_string(),
            consumer_group: "loghouse-committers".to_string(),
            consumer_prefix: "worker".to_string(),
            stream_read_batch: 2_000,
            stream_block_ms: 250,
            buffer_max_batch_size: 100_000,
            buffer_max_wait_time_ms: 1_000,
            poll_interval_ms: 5,
            claim_min_idle_ms: 30_000,
            stream_processor_count: 3,
            stream_retention_minutes: 120,
            stream_trim_interval_ms: 60_000,
            idempotency_ttl_seconds: 86_400,
            idempotency_key_prefix: "loghouse:idem".to_string(),
            dead_letter_max_retries: 3,
            dead_letter_key: "loghouse:dead-letter".to_string(),
            columnar_table: "logs".to_string(),
            shutdown_step_budget_ms: 5_000,
        }
    }
}

impl IngestConfig {
    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file("LOGHOUSE.toml"))
            .merge(Env::prefixed("LOGHOUSE_"))
    }

    pub fn config() -> figment::Result<Self> {
        Self::figment().extract()
    }

    pub fn coalescer(&self) -> CoalescerConfig {
        CoalescerConfig {
            max_wait: Duration::from_millis(self.coalescer_max_wait_time_ms),
            max_batch_size: self.coalescer_max_batch_size,
            enabled: self.coalescer_enabled,
        }
    }

    pub fn service(&self) -> ServiceConfig {
        ServiceConfig {
            small_batch_threshold: self.validation_small_batch_threshold,
            worker_validation_enabled: self.worker_validation_enabled,
        }
    }

    pub fn worker_pool(&self) -> PoolConfig {
        let defaults = PoolConfig::default();
        let max_workers = self
            .worker_pool_max
            .map(|max| max.get())
            .unwrap_or(defaults.max_workers)
            .max(self.worker_pool_min);
        PoolConfig {
            min_workers: self.worker_pool_min,
            max_workers,
            task_timeout: Duration::from_millis(self.worker_task_timeout_ms),
            max_queue_depth: self.worker_queue_depth,
            ..defaults
        }
    }

    pub fn stream_worker(&self) -> StreamWorkerConfig {
        StreamWorkerConfig {
            table: self.columnar_table.clone(),
            read_batch: self.stream_read_batch,
            block: Duration::from_millis(self.stream_block_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            buffer_max_batch_size: self.buffer_max_batch_size,
            buffer_max_wait: Duration::from_millis(self.buffer_max_wait_time_ms),
            claim_min_idle: Duration::from_millis(self.claim_min_idle_ms),
            claim_interval: Duration::from_millis(self.claim_min_idle_ms),
        }
    }

    pub fn idempotency_ttl(&self) -> Duration {
        Duration::from_secs(self.idempotency_ttl_seconds)
    }

    pub fn shutdown_step_budget(&self) -> Duration {
        Duration::from_millis(self.shutdown_step_budget_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = IngestConfig::default();
        assert_eq!(config.coalescer_max_wait_time_ms, 10);
        assert_eq!(config.coalescer_max_batch_size, 100);
        assert_eq!(config.validation_small_batch_threshold, 50);
        assert_eq!(config.buffer_max_batch_size, 100_000);
        assert_eq!(config.claim_min_idle_ms, 30_000);
        assert_eq!(config.stream_processor_count, 3);
        assert_eq!(config.idempotency_ttl_seconds, 86_400);
        assert_eq!(config.dead_letter_max_retries, 3);
    }

    #[test]
    fn figment_defaults_round_trip() {
        let config: IngestConfig = Figment::from(Serialized::defaults(IngestConfig::default()))
            .extract()
            .unwrap();
        assert_eq!(config, IngestConfig::default());
    }

    #[test]
    fn worker_pool_max_never_drops_below_min() {
        let config = IngestConfig {
            worker_pool_min: 6,
            worker_pool_max: NonZero::new(2),
            ..IngestConfig::default()
        };
        let pool = config.worker_pool();
        assert_eq!(pool.min_workers, 6);
        assert!(pool.max_workers >= pool.min_workers);
    }

    #[test]
    fn durations_convert_from_milliseconds() {
        let config = IngestConfig::default();
        assert_eq!(config.coalescer().max_wait, Duration::from_millis(10));
        assert_eq!(
            config.stream_worker().buffer_max_wait,
            Duration::from_millis(1_000)
        );
        assert_eq!(config.idempotency_ttl(), Duration::from_secs(86_400));
    }
}
