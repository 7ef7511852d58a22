use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeadLetterError {
    #[error("dead-letter backend connection could not be established")]
    Connect(#[source] redis::RedisError),

    #[error("error talking to the dead-letter backend")]
    Backend(#[source] redis::RedisError),

    #[error("error serializing dead-letter item")]
    Serialize(#[source] serde_json::Error),
}

/// A failed commit, preserved with enough context for an out-of-band retry
/// worker to re-attempt the insert or for an operator to decide disposition.
/// Nothing here relies on in-process timers, so items survive restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterItem {
    pub records: Vec<serde_json::Value>,
    pub error: String,
    pub attempt: u64,
    pub first_seen: DateTime<Utc>,
    pub last_error: DateTime<Utc>,
    pub source_component: String,
}

/// Append-only queue of failed batches. The live path only ever appends;
/// consumption is an operator concern outside this pipeline.
#[async_trait]
pub trait DeadLetterQueue: Send + Sync {
    async fn queue_for_retry(&self, item: DeadLetterItem) -> Result<(), DeadLetterError>;

    async fn queue_length(&self) -> Result<u64, DeadLetterError>;
}

/// Redis list implementation: RPUSH of one JSON document per failed batch.
pub struct RedisDeadLetter {
    conn: MultiplexedConnection,
    list_key: String,
}

impl RedisDeadLetter {
    pub async fn connect(
        url: &str,
        list_key: impl Into<String>,
    ) -> Result<RedisDeadLetter, DeadLetterError> {
        let client = redis::Client::open(url).map_err(DeadLetterError::Connect)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(DeadLetterError::Connect)?;
        Ok(RedisDeadLetter {
            conn,
            list_key: list_key.into(),
        })
    }
}

#[async_trait]
impl DeadLetterQueue for RedisDeadLetter {
    async fn queue_for_retry(&self, item: DeadLetterItem) -> Result<(), DeadLetterError> {
        let payload = serde_json::to_string(&item).map_err(DeadLetterError::Serialize)?;
        redis::cmd("RPUSH")
            .arg(&self.list_key)
            .arg(payload)
            .query_async::<u64>(&mut self.conn.clone())
            .await
            .map_err(DeadLetterError::Backend)?;
        Ok(())
    }

    async fn queue_length(&self) -> Result<u64, DeadLetterError> {
        redis::cmd("LLEN")
            .arg(&self.list_key)
            .query_async::<u64>(&mut self.conn.clone())
            .await
            .map_err(DeadLetterError::Backend)
    }
}

/// In-memory implementation for tests and local development.
#[derive(Default)]
pub struct MemoryDeadLetter {
    items: Mutex<Vec<DeadLetterItem>>,
}

impl MemoryDeadLetter {
    pub fn new() -> MemoryDeadLetter {
        MemoryDeadLetter::default()
    }

    pub fn items(&self) -> Vec<DeadLetterItem> {
        self.items.lock().clone()
    }
}

#[async_trait]
impl DeadLetterQueue for MemoryDeadLetter {
    async fn queue_for_retry(&self, item: DeadLetterItem) -> Result<(), DeadLetterError> {
        self.items.lock().push(item);
        Ok(())
    }

    async fn queue_length(&self) -> Result<u64, DeadLetterError> {
        Ok(self.items.lock().len() as u64)
    }
}
