use crate::{PendingSummary, ReplayStream, SCAN_START, StreamEntry, StreamError, parse_id};
use async_trait::async_trait;
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::time::timeout;

/// In-memory stream with the same consumer-group semantics as the Redis
/// implementation. Backs the test suite and local development; the log lives
/// only as long as the process, so it provides replay across consumer crashes
/// but not across process restarts.
pub struct MemoryStream {
    state: Mutex<State>,
    appended: Notify,
}

#[derive(Default)]
struct State {
    next_id: u64,
    log: Vec<LogEntry>,
    // Index into `log` of the first entry the group has never delivered
    cursor: usize,
    pending: HashMap<String, Pending>,
    fail_next_appends: usize,
}

struct LogEntry {
    id: String,
    payload: String,
}

struct Pending {
    consumer: String,
    payload: String,
    delivered_at: Instant,
    deliveries: u64,
}

impl MemoryStream {
    pub fn new() -> MemoryStream {
        MemoryStream {
            state: Mutex::new(State::default()),
            appended: Notify::new(),
        }
    }

    /// Number of entries ever appended. Acks remove entries from the pending
    /// set, not from the log, same as the real stream.
    pub fn log_len(&self) -> usize {
        self.state.lock().log.len()
    }

    /// Number of delivered-but-unacked entries across all consumers.
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Test hook: make the next `count` append operations fail as if the
    /// backend were unreachable.
    pub fn fail_next_appends(&self, count: usize) {
        self.state.lock().fail_next_appends = count;
    }

    /// Test hook: pretend `consumer` stopped heartbeating `age` ago, so its
    /// pending entries become claimable without real waiting.
    pub fn age_pending(&self, consumer: &str, age: Duration) {
        let mut state = self.state.lock();
        for pending in state.pending.values_mut() {
            if pending.consumer == consumer {
                pending.delivered_at = Instant::now() - age;
            }
        }
    }

    fn take_new(&self, consumer: &str, count: usize) -> Vec<StreamEntry> {
        let mut state = self.state.lock();
        let start = state.cursor;
        let end = (start + count).min(state.log.len());
        if start >= end {
            return Vec::new();
        }

        let mut out = Vec::with_capacity(end - start);
        for index in start..end {
            let entry = &state.log[index];
            let (id, payload) = (entry.id.clone(), entry.payload.clone());
            out.push(StreamEntry {
                id: id.clone(),
                payload: payload.clone(),
                deliveries: 1,
            });
            state.pending.insert(
                id,
                Pending {
                    consumer: consumer.to_string(),
                    payload,
                    delivered_at: Instant::now(),
                    deliveries: 1,
                },
            );
        }
        state.cursor = end;
        out
    }
}

impl Default for MemoryStream {
    fn default() -> Self {
        MemoryStream::new()
    }
}

#[async_trait]
impl ReplayStream for MemoryStream {
    async fn append(&self, payload: &str) -> Result<String, StreamError> {
        let id = {
            let mut state = self.state.lock();
            if state.fail_next_appends > 0 {
                state.fail_next_appends -= 1;
                return Err(StreamError::Unavailable(
                    "staged failure for testing".to_string(),
                ));
            }
            state.next_id += 1;
            let id = format!("{}-0", state.next_id);
            state.log.push(LogEntry {
                id: id.clone(),
                payload: payload.to_string(),
            });
            id
        };
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn append_many(&self, payloads: &[String]) -> Result<Vec<String>, StreamError> {
        let ids = {
            let mut state = self.state.lock();
            if state.fail_next_appends > 0 {
                state.fail_next_appends -= 1;
                return Err(StreamError::Unavailable(
                    "staged failure for testing".to_string(),
                ));
            }
            payloads
                .iter()
                .map(|payload| {
                    state.next_id += 1;
                    let id = format!("{}-0", state.next_id);
                    state.log.push(LogEntry {
                        id: id.clone(),
                        payload: payload.clone(),
                    });
                    id
                })
                .collect()
        };
        self.appended.notify_waiters();
        Ok(ids)
    }

    async fn create_group(&self) -> Result<(), StreamError> {
        // Nothing to set up: the single in-memory group always exists
        Ok(())
    }

    async fn read_new(
        &self,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StreamError> {
        let deadline = Instant::now() + block;
        loop {
            // Register interest before checking, so an append between the
            // check and the wait cannot be missed
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let entries = self.take_new(consumer, count);
            if !entries.is_empty() {
                return Ok(entries);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Vec::new());
            }
            if timeout(remaining, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn read_pending(
        &self,
        consumer: &str,
        start_id: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StreamError> {
        let state = self.state.lock();
        let floor = parse_id(start_id);

        let mut owned: Vec<&String> = state
            .pending
            .iter()
            .filter(|(id, pending)| pending.consumer == consumer && parse_id(id) > floor)
            .map(|(id, _)| id)
            .collect();
        owned.sort_by_key(|id| parse_id(id));
        owned.truncate(count);

        Ok(owned
            .into_iter()
            .map(|id| {
                let pending = &state.pending[id];
                StreamEntry {
                    id: id.clone(),
                    payload: pending.payload.clone(),
                    deliveries: pending.deliveries,
                }
            })
            .collect())
    }

    async fn auto_claim(
        &self,
        consumer: &str,
        min_idle: Duration,
        cursor: &str,
        count: usize,
    ) -> Result<(String, Vec<StreamEntry>), StreamError> {
        let mut state = self.state.lock();
        let floor = parse_id(cursor);
        let now = Instant::now();

        let mut scan: Vec<String> = state
            .pending
            .keys()
            .filter(|id| parse_id(id) >= floor)
            .cloned()
            .collect();
        scan.sort_by_key(|id| parse_id(id));

        let mut claimed = Vec::new();
        let mut next_cursor = SCAN_START.to_string();
        for id in &scan {
            if claimed.len() >= count {
                next_cursor = id.clone();
                break;
            }
            let pending = state
                .pending
                .get_mut(id)
                .expect("scanned ids come from the pending map");
            if now.duration_since(pending.delivered_at) < min_idle {
                continue;
            }

            pending.consumer = consumer.to_string();
            pending.delivered_at = now;
            pending.deliveries += 1;
            claimed.push(StreamEntry {
                id: id.clone(),
                payload: pending.payload.clone(),
                deliveries: pending.deliveries,
            });
        }

        Ok((next_cursor, claimed))
    }

    async fn ack(&self, ids: &[String]) -> Result<u64, StreamError> {
        let mut state = self.state.lock();
        let mut acked = 0;
        for id in ids {
            if state.pending.remove(id).is_some() {
                acked += 1;
            }
        }
        Ok(acked)
    }

    async fn pending_info(&self) -> Result<PendingSummary, StreamError> {
        let state = self.state.lock();

        let mut ids: Vec<&String> = state.pending.keys().collect();
        ids.sort_by_key(|id| parse_id(id));

        let mut per_consumer: HashMap<&str, u64> = HashMap::new();
        for pending in state.pending.values() {
            *per_consumer.entry(&pending.consumer).or_default() += 1;
        }
        let mut consumers: Vec<(String, u64)> = per_consumer
            .into_iter()
            .map(|(name, owned)| (name.to_string(), owned))
            .collect();
        consumers.sort();

        Ok(PendingSummary {
            count: state.pending.len() as u64,
            lowest_id: ids.first().map(|id| (*id).clone()),
            highest_id: ids.last().map(|id| (*id).clone()),
            consumers,
        })
    }

    async fn last_delivered_id(&self) -> Result<Option<String>, StreamError> {
        let state = self.state.lock();
        if state.cursor == 0 {
            return Ok(None);
        }
        Ok(Some(state.log[state.cursor - 1].id.clone()))
    }

    async fn trim_older_than(&self, min_id: &str) -> Result<u64, StreamError> {
        let mut state = self.state.lock();
        let floor = parse_id(min_id);

        // Never drop what the group has not delivered yet, no matter how
        // aggressive the watermark is
        let deliverable = state.cursor;
        let keep_from = state.log[..deliverable]
            .iter()
            .position(|entry| parse_id(&entry.id) >= floor)
            .unwrap_or(deliverable);

        state.log.drain(..keep_from);
        state.cursor -= keep_from;
        Ok(keep_from as u64)
    }
}
