use async_trait::async_trait;
use log::debug;
use parking_lot::Mutex;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ColumnarError {
    #[error("error executing columnar insert request")]
    Http(#[source] reqwest::Error),

    #[error("columnar store rejected the insert with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("error serializing rows for insert")]
    Serialize(#[source] serde_json::Error),

    #[error("columnar store unavailable: {0}")]
    Unavailable(String),
}

/// Insert tuning passed through to the store on every insert. The defaults
/// match the write path this pipeline is built for: the server accumulates
/// small inserts into larger commits and the client does not wait for the
/// commit to land.
#[derive(Debug, Clone)]
pub struct InsertOptions {
    pub async_insert: bool,
    pub wait_for_async_insert: bool,
    pub max_execution_time: Duration,
}

impl Default for InsertOptions {
    fn default() -> Self {
        InsertOptions {
            async_insert: true,
            wait_for_async_insert: false,
            max_execution_time: Duration::from_secs(30),
        }
    }
}

/// The columnar analytical store, reduced to the operations the write path
/// needs. Rows are self-describing JSON objects.
#[async_trait]
pub trait ColumnarStore: Send + Sync {
    async fn insert(&self, table: &str, rows: &[serde_json::Value]) -> Result<(), ColumnarError>;

    /// Cheap reachability probe, used once at startup so a misconfigured
    /// endpoint fails before the pipeline starts accepting traffic.
    async fn ping(&self) -> Result<(), ColumnarError> {
        Ok(())
    }
}

/// ClickHouse over its HTTP interface. One insert is one POST of
/// `INSERT INTO <table> FORMAT JSONEachRow` with the rows as newline-
/// delimited JSON in the body.
pub struct ClickHouseStore {
    client: reqwest::Client,
    base_url: String,
    options: InsertOptions,
}

impl ClickHouseStore {
    pub fn new(base_url: impl Into<String>, options: InsertOptions) -> ClickHouseStore {
        let client = reqwest::Client::builder()
            .timeout(options.max_execution_time + Duration::from_secs(5))
            .build()
            .expect("constructing a reqwest client with static options must not fail");

        ClickHouseStore {
            client,
            base_url: base_url.into(),
            options,
        }
    }
}

#[async_trait]
impl ColumnarStore for ClickHouseStore {
    async fn insert(&self, table: &str, rows: &[serde_json::Value]) -> Result<(), ColumnarError> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut body = String::new();
        for row in rows {
            let line = serde_json::to_string(row).map_err(ColumnarError::Serialize)?;
            body.push_str(&line);
            body.push('\n');
        }

        let query = format!("INSERT INTO {table} FORMAT JSONEachRow");
        let max_execution_time = self.options.max_execution_time.as_secs().to_string();
        let response = self
            .client
            .post(&self.base_url)
            .query(&[
                ("query", query.as_str()),
                ("async_insert", flag(self.options.async_insert)),
                (
                    "wait_for_async_insert",
                    flag(self.options.wait_for_async_insert),
                ),
                ("max_execution_time", max_execution_time.as_str()),
            ])
            .body(body)
            .send()
            .await
            .map_err(ColumnarError::Http)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ColumnarError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        debug!("inserted {} rows into {table}", rows.len());
        Ok(())
    }

    async fn ping(&self) -> Result<(), ColumnarError> {
        let response = self
            .client
            .get(&self.base_url)
            .query(&[("query", "SELECT 1")])
            .send()
            .await
            .map_err(ColumnarError::Http)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ColumnarError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

fn flag(value: bool) -> &'static str {
    if value { "1" } else { "0" }
}

/// In-memory store for tests and local development. Failures can be staged
/// to exercise the dead-letter path.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryStoreState>,
}

#[derive(Default)]
struct MemoryStoreState {
    rows: Vec<(String, serde_json::Value)>,
    fail_next: usize,
    inserts: u64,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }

    /// Make the next `count` insert calls fail with `Unavailable`.
    pub fn fail_next(&self, count: usize) {
        self.state.lock().fail_next = count;
    }

    pub fn rows(&self) -> Vec<serde_json::Value> {
        self.state
            .lock()
            .rows
            .iter()
            .map(|(_, row)| row.clone())
            .collect()
    }

    pub fn insert_count(&self) -> u64 {
        self.state.lock().inserts
    }
}

#[async_trait]
impl ColumnarStore for MemoryStore {
    async fn insert(&self, table: &str, rows: &[serde_json::Value]) -> Result<(), ColumnarError> {
        let mut state = self.state.lock();
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(ColumnarError::Unavailable(
                "staged failure for testing".to_string(),
            ));
        }
        state.inserts += 1;
        state
            .rows
            .extend(rows.iter().map(|row| (table.to_string(), row.clone())));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn memory_store_records_rows() {
        let store = MemoryStore::new();
        store
            .insert("logs", &[json!({"message": "hello"})])
            .await
            .unwrap();
        assert_eq!(store.rows().len(), 1);
        assert_eq!(store.insert_count(), 1);
    }

    #[tokio::test]
    async fn staged_failures_then_recovery() {
        let store = MemoryStore::new();
        store.fail_next(1);

        let err = store
            .insert("logs", &[json!({"message": "boom"})])
            .await
            .unwrap_err();
        assert!(matches!(err, ColumnarError::Unavailable(_)));
        assert!(store.rows().is_empty());

        store
            .insert("logs", &[json!({"message": "ok"})])
            .await
            .unwrap();
        assert_eq!(store.rows().len(), 1);
    }
}
