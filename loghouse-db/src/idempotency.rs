use async_trait::async_trait;
use hashbrown::HashMap;
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IdempotencyError {
    #[error("idempotency backend connection could not be established")]
    Connect(#[source] redis::RedisError),

    #[error("error talking to the idempotency backend")]
    Backend(#[source] redis::RedisError),

    #[error("idempotency backend unavailable: {0}")]
    Unavailable(String),
}

/// Result of an atomic check-and-insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    Inserted,
    Preexisting,
}

/// At-most-once response cache keyed by a caller-supplied identifier.
///
/// `set` is an atomic check-and-insert so two racing writers cannot both
/// believe they inserted. Callers are expected to degrade open when `get`
/// fails; a transient backend outage must never block ingestion.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, IdempotencyError>;

    async fn set(
        &self,
        key: &str,
        snapshot: &str,
        ttl: Duration,
    ) -> Result<SetOutcome, IdempotencyError>;
}

/// Redis-backed store using `SET NX EX`. Keys are namespaced with a prefix
/// so the cache can share a database with the stream and dead-letter list.
pub struct RedisIdempotency {
    conn: MultiplexedConnection,
    prefix: String,
}

impl RedisIdempotency {
    pub async fn connect(
        url: &str,
        prefix: impl Into<String>,
    ) -> Result<RedisIdempotency, IdempotencyError> {
        let client = redis::Client::open(url).map_err(IdempotencyError::Connect)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(IdempotencyError::Connect)?;
        Ok(RedisIdempotency {
            conn,
            prefix: prefix.into(),
        })
    }

    fn key_for(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }
}

#[async_trait]
impl IdempotencyStore for RedisIdempotency {
    async fn get(&self, key: &str) -> Result<Option<String>, IdempotencyError> {
        redis::cmd("GET")
            .arg(self.key_for(key))
            .query_async::<Option<String>>(&mut self.conn.clone())
            .await
            .map_err(IdempotencyError::Backend)
    }

    async fn set(
        &self,
        key: &str,
        snapshot: &str,
        ttl: Duration,
    ) -> Result<SetOutcome, IdempotencyError> {
        // NX makes the check-and-insert atomic on the server
        let reply = redis::cmd("SET")
            .arg(self.key_for(key))
            .arg(snapshot)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async::<Option<String>>(&mut self.conn.clone())
            .await
            .map_err(IdempotencyError::Backend)?;

        Ok(match reply {
            Some(_) => SetOutcome::Inserted,
            None => SetOutcome::Preexisting,
        })
    }
}

/// In-memory store with lazy TTL expiry, for tests and local development.
/// Outages can be staged to exercise the degrade-open path.
#[derive(Default)]
pub struct MemoryIdempotency {
    state: Mutex<MemoryIdempotencyState>,
}

#[derive(Default)]
struct MemoryIdempotencyState {
    entries: HashMap<String, (String, Instant)>,
    fail_next: usize,
}

impl MemoryIdempotency {
    pub fn new() -> MemoryIdempotency {
        MemoryIdempotency::default()
    }

    /// Make the next `count` calls (get or set) fail.
    pub fn fail_next(&self, count: usize) {
        self.state.lock().fail_next = count;
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_staged_failure(state: &mut MemoryIdempotencyState) -> Result<(), IdempotencyError> {
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(IdempotencyError::Unavailable(
                "staged failure for testing".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl IdempotencyStore for MemoryIdempotency {
    async fn get(&self, key: &str) -> Result<Option<String>, IdempotencyError> {
        let mut state = self.state.lock();
        Self::check_staged_failure(&mut state)?;

        match state.entries.get(key) {
            Some((_, expires)) if *expires <= Instant::now() => {
                state.entries.remove(key);
                Ok(None)
            }
            Some((snapshot, _)) => Ok(Some(snapshot.clone())),
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        key: &str,
        snapshot: &str,
        ttl: Duration,
    ) -> Result<SetOutcome, IdempotencyError> {
        let mut state = self.state.lock();
        Self::check_staged_failure(&mut state)?;

        let now = Instant::now();
        match state.entries.get(key) {
            Some((_, expires)) if *expires > now => Ok(SetOutcome::Preexisting),
            _ => {
                state
                    .entries
                    .insert(key.to_string(), (snapshot.to_string(), now + ttl));
                Ok(SetOutcome::Inserted)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn set_is_check_and_insert() {
        let store = MemoryIdempotency::new();

        let first = store.set("k", "snapshot-a", TTL).await.unwrap();
        assert_eq!(first, SetOutcome::Inserted);

        let second = store.set("k", "snapshot-b", TTL).await.unwrap();
        assert_eq!(second, SetOutcome::Preexisting);

        // The losing write must not clobber the stored snapshot
        let got = store.get("k").await.unwrap();
        assert_eq!(got.as_deref(), Some("snapshot-a"));
    }

    #[tokio::test]
    async fn expired_entries_are_gone() {
        let store = MemoryIdempotency::new();
        store
            .set("k", "snapshot", Duration::from_millis(0))
            .await
            .unwrap();

        assert_eq!(store.get("k").await.unwrap(), None);
        // And the slot is reusable
        assert_eq!(
            store.set("k", "fresh", TTL).await.unwrap(),
            SetOutcome::Inserted
        );
    }

    #[tokio::test]
    async fn staged_failures_surface_as_errors() {
        let store = MemoryIdempotency::new();
        store.fail_next(1);
        assert!(store.get("k").await.is_err());
        assert!(store.get("k").await.is_ok());
    }
}
