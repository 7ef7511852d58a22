mod client;
mod memory;

pub use client::RedisStream;
pub use memory::MemoryStream;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Cursor value that means "start scanning from the beginning of the
/// pending entries list".
pub const SCAN_START: &str = "0-0";

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream connection could not be established")]
    Connect(#[source] redis::RedisError),

    #[error("error talking to the stream backend")]
    Backend(#[source] redis::RedisError),

    #[error("unexpected reply shape from the stream backend: {0}")]
    MalformedReply(&'static str),

    #[error("stream unavailable: {0}")]
    Unavailable(String),
}

/// One entry as delivered to a consumer. `deliveries` counts how many times
/// the group has handed this entry to some consumer (1 for a fresh read).
#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub id: String,
    pub payload: String,
    pub deliveries: u64,
}

/// Group-level pending summary, one `(consumer name, pending count)` pair
/// per consumer that currently owns entries.
#[derive(Debug, Clone, Default)]
pub struct PendingSummary {
    pub count: u64,
    pub lowest_id: Option<String>,
    pub highest_id: Option<String>,
    pub consumers: Vec<(String, u64)>,
}

/// A replayable stream with consumer-group semantics.
///
/// Entries appended to the stream remain visible until acked. Each entry is
/// delivered to exactly one consumer of the group at a time; an unacked entry
/// stays "pending" under that consumer and can be reassigned with
/// [`auto_claim`](ReplayStream::auto_claim) once its owner has been idle past
/// a threshold. The stream is the authoritative record of accepted-but-not-
/// committed data, so producers must treat a successful append as the
/// durability point.
#[async_trait]
pub trait ReplayStream: Send + Sync {
    /// Append one serialized record. Returns the stream-assigned id, which is
    /// monotonic per stream.
    async fn append(&self, payload: &str) -> Result<String, StreamError>;

    /// Append many records as one all-or-nothing operation.
    async fn append_many(&self, payloads: &[String]) -> Result<Vec<String>, StreamError>;

    /// Create the consumer group, starting from the beginning of the stream.
    /// Idempotent; a pre-existing group is not an error.
    async fn create_group(&self) -> Result<(), StreamError>;

    /// Blocking group read of entries nobody has seen yet. Returns an empty
    /// vec when `block` elapses without new entries.
    async fn read_new(
        &self,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StreamError>;

    /// Read this consumer's own pending entries with ids greater than
    /// `start_id`. Used to page through self-owned pending on startup.
    async fn read_pending(
        &self,
        consumer: &str,
        start_id: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StreamError>;

    /// Atomically reassign pending entries whose current owner has been idle
    /// at least `min_idle`, scanning from `cursor`. Returns the next cursor
    /// ([`SCAN_START`] once the scan has wrapped) and the claimed entries.
    async fn auto_claim(
        &self,
        consumer: &str,
        min_idle: Duration,
        cursor: &str,
        count: usize,
    ) -> Result<(String, Vec<StreamEntry>), StreamError>;

    /// Acknowledge delivered entries, removing them from the pending set.
    /// Returns how many ids were actually still pending.
    async fn ack(&self, ids: &[String]) -> Result<u64, StreamError>;

    /// Summary of the group's pending entries.
    async fn pending_info(&self) -> Result<PendingSummary, StreamError>;

    /// The id of the newest entry the group has handed to any consumer, or
    /// `None` while the group has not delivered anything yet.
    async fn last_delivered_id(&self) -> Result<Option<String>, StreamError>;

    /// Drop entries with ids strictly below `min_id` from the stream's log,
    /// returning how many were removed. Acked entries are the intended
    /// target; callers must keep `min_id` at or below both the lowest
    /// pending id and the group's last-delivered id, otherwise unprocessed
    /// entries are lost.
    async fn trim_older_than(&self, min_id: &str) -> Result<u64, StreamError>;
}

/// Split a stream id of the form `<ms>-<seq>` into its numeric parts, for
/// numeric ordering. Malformed ids sort first, which is the safe direction
/// for cursors and trim watermarks.
pub fn parse_id(id: &str) -> (u64, u64) {
    let mut parts = id.splitn(2, '-');
    let ms = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let seq = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    (ms, seq)
}
