use crate::{PendingSummary, ReplayStream, SCAN_START, StreamEntry, StreamError, parse_id};
use async_trait::async_trait;
use hashbrown::HashMap;
use log::{debug, warn};
use redis::Value;
use redis::aio::MultiplexedConnection;
use std::time::Duration;

/// Field name under which the serialized record is stored in each entry.
const DATA_FIELD: &str = "data";

const CONNECT_ATTEMPTS: u32 = 8;
const CONNECT_BACKOFF_START: Duration = Duration::from_millis(200);
const CONNECT_BACKOFF_CAP: Duration = Duration::from_secs(5);

/// Consumer-group client for one Redis stream.
///
/// Each instance owns its own connection. Stream workers are expected to hold
/// a dedicated instance so a blocking group read on one connection cannot
/// starve appends or other workers.
pub struct RedisStream {
    conn: MultiplexedConnection,
    stream_key: String,
    group: String,
}

impl RedisStream {
    /// Connect with exponential backoff. Connection failures at startup are
    /// common when the stream backend comes up in parallel with this service.
    pub async fn connect(
        url: &str,
        stream_key: impl Into<String>,
        group: impl Into<String>,
    ) -> Result<RedisStream, StreamError> {
        let client = redis::Client::open(url).map_err(StreamError::Connect)?;

        let mut delay = CONNECT_BACKOFF_START;
        let mut last_err = None;
        for _ in 0..CONNECT_ATTEMPTS {
            match client.get_multiplexed_async_connection().await {
                Ok(conn) => {
                    return Ok(RedisStream {
                        conn,
                        stream_key: stream_key.into(),
                        group: group.into(),
                    });
                }
                Err(err) => {
                    warn!(
                        "stream connect failed, retrying in {}ms: {err}",
                        delay.as_millis()
                    );
                    last_err = Some(err);
                    tokio::time::sleep(delay).await;
                    delay = std::cmp::min(delay * 2, CONNECT_BACKOFF_CAP);
                }
            }
        }

        // last_err is always set here because CONNECT_ATTEMPTS > 0
        Err(StreamError::Connect(last_err.expect(
            "connect loop must have recorded an error before falling through",
        )))
    }

    fn conn(&self) -> MultiplexedConnection {
        // MultiplexedConnection is a cheap handle onto one shared pipeline
        self.conn.clone()
    }

    /// Fetch delivery counts for a span of pending ids. XAUTOCLAIM does not
    /// report them, so claimed entries need one extra XPENDING range call.
    async fn delivery_counts(
        &self,
        first: &str,
        last: &str,
        count: usize,
    ) -> Result<HashMap<String, u64>, StreamError> {
        let reply = redis::cmd("XPENDING")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(first)
            .arg(last)
            .arg(count)
            .query_async::<Value>(&mut self.conn())
            .await
            .map_err(StreamError::Backend)?;

        let mut counts = HashMap::new();
        if let Some(rows) = as_array(&reply) {
            for row in rows {
                let Some(fields) = as_array(row) else { continue };
                let (Some(id), Some(deliveries)) = (
                    fields.first().and_then(as_string),
                    fields.get(3).and_then(as_int),
                ) else {
                    continue;
                };
                counts.insert(id, deliveries.max(0) as u64);
            }
        }
        Ok(counts)
    }
}

#[async_trait]
impl ReplayStream for RedisStream {
    async fn append(&self, payload: &str) -> Result<String, StreamError> {
        redis::cmd("XADD")
            .arg(&self.stream_key)
            .arg("*")
            .arg(DATA_FIELD)
            .arg(payload)
            .query_async::<String>(&mut self.conn())
            .await
            .map_err(StreamError::Backend)
    }

    async fn append_many(&self, payloads: &[String]) -> Result<Vec<String>, StreamError> {
        if payloads.is_empty() {
            return Ok(Vec::new());
        }

        // MULTI/EXEC so the whole batch lands or none of it does
        let mut pipe = redis::pipe();
        pipe.atomic();
        for payload in payloads {
            pipe.cmd("XADD")
                .arg(&self.stream_key)
                .arg("*")
                .arg(DATA_FIELD)
                .arg(payload);
        }

        pipe.query_async::<Vec<String>>(&mut self.conn())
            .await
            .map_err(StreamError::Backend)
    }

    async fn create_group(&self) -> Result<(), StreamError> {
        let result = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async::<Value>(&mut self.conn())
            .await;

        match result {
            Ok(_) => Ok(()),
            // The group surviving a previous process lifetime is the normal
            // restart path, not a failure.
            Err(err) if err.code() == Some("BUSYGROUP") => {
                debug!("consumer group {} already exists", self.group);
                Ok(())
            }
            Err(err) => Err(StreamError::Backend(err)),
        }
    }

    async fn read_new(
        &self,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StreamError> {
        let reply = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count)
            .arg("BLOCK")
            .arg(block.as_millis() as u64)
            .arg("STREAMS")
            .arg(&self.stream_key)
            .arg(">")
            .query_async::<Value>(&mut self.conn())
            .await
            .map_err(StreamError::Backend)?;

        parse_read_reply(&reply, 1)
    }

    async fn read_pending(
        &self,
        consumer: &str,
        start_id: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StreamError> {
        // With an explicit id (instead of ">") XREADGROUP serves entries from
        // this consumer's own pending list, ids strictly greater than the
        // given one, without blocking.
        let reply = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count)
            .arg("STREAMS")
            .arg(&self.stream_key)
            .arg(start_id)
            .query_async::<Value>(&mut self.conn())
            .await
            .map_err(StreamError::Backend)?;

        parse_read_reply(&reply, 1)
    }

    async fn auto_claim(
        &self,
        consumer: &str,
        min_idle: Duration,
        cursor: &str,
        count: usize,
    ) -> Result<(String, Vec<StreamEntry>), StreamError> {
        let reply = redis::cmd("XAUTOCLAIM")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(consumer)
            .arg(min_idle.as_millis() as u64)
            .arg(cursor)
            .arg("COUNT")
            .arg(count)
            .query_async::<Value>(&mut self.conn())
            .await
            .map_err(StreamError::Backend)?;

        let parts =
            as_array(&reply).ok_or(StreamError::MalformedReply("XAUTOCLAIM reply not an array"))?;
        let next_cursor = parts
            .first()
            .and_then(as_string)
            .ok_or(StreamError::MalformedReply("XAUTOCLAIM cursor missing"))?;
        let entries_value = parts
            .get(1)
            .ok_or(StreamError::MalformedReply("XAUTOCLAIM entries missing"))?;

        let mut entries = parse_entries(entries_value)?;

        // Claimed entries have been through at least one failed delivery, so
        // their delivery count matters for dead-letter attempt metadata.
        // XAUTOCLAIM does not report it; one XPENDING range call does.
        let span = match (entries.first(), entries.last()) {
            (Some(first), Some(last)) => Some((first.id.clone(), last.id.clone())),
            _ => None,
        };
        if let Some((first, last)) = span {
            let counts = self.delivery_counts(&first, &last, entries.len()).await?;
            for entry in &mut entries {
                if let Some(deliveries) = counts.get(&entry.id) {
                    entry.deliveries = *deliveries;
                }
            }
        }

        Ok((next_cursor, entries))
    }

    async fn ack(&self, ids: &[String]) -> Result<u64, StreamError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut cmd = redis::cmd("XACK");
        cmd.arg(&self.stream_key).arg(&self.group);
        for id in ids {
            cmd.arg(id);
        }

        cmd.query_async::<u64>(&mut self.conn())
            .await
            .map_err(StreamError::Backend)
    }

    async fn pending_info(&self) -> Result<PendingSummary, StreamError> {
        let reply = redis::cmd("XPENDING")
            .arg(&self.stream_key)
            .arg(&self.group)
            .query_async::<Value>(&mut self.conn())
            .await
            .map_err(StreamError::Backend)?;

        parse_pending_summary(&reply)
    }

    async fn last_delivered_id(&self) -> Result<Option<String>, StreamError> {
        let reply = redis::cmd("XINFO")
            .arg("GROUPS")
            .arg(&self.stream_key)
            .query_async::<Value>(&mut self.conn())
            .await
            .map_err(StreamError::Backend)?;

        Ok(parse_last_delivered(&reply, &self.group))
    }

    async fn trim_older_than(&self, min_id: &str) -> Result<u64, StreamError> {
        // "~" asks for approximate trimming, which is much cheaper and only
        // ever keeps a few extra entries
        redis::cmd("XTRIM")
            .arg(&self.stream_key)
            .arg("MINID")
            .arg("~")
            .arg(min_id)
            .query_async::<u64>(&mut self.conn())
            .await
            .map_err(StreamError::Backend)
    }
}

/// Find our group in an XINFO GROUPS reply and pull its last-delivered-id.
/// The reply is one flat `[key, value, key, value, ...]` array per group.
fn parse_last_delivered(reply: &Value, group: &str) -> Option<String> {
    let groups = as_array(reply)?;
    for info in groups {
        let Some(fields) = as_array(info) else { continue };

        let mut name = None;
        let mut last_delivered = None;
        for pair in fields.chunks(2) {
            let (Some(key), Some(value)) = (
                pair.first().and_then(as_string),
                pair.get(1).and_then(as_string),
            ) else {
                continue;
            };
            match key.as_str() {
                "name" => name = Some(value),
                "last-delivered-id" => last_delivered = Some(value),
                _ => {}
            }
        }

        if name.as_deref() == Some(group) {
            // "0-0" means the group exists but has never delivered
            return last_delivered.filter(|id| id != SCAN_START);
        }
    }
    None
}

/// Parse the summary form of XPENDING:
/// `[count, lowest-id, highest-id, [[consumer, owned-count], ...]]`.
/// The per-consumer count arrives as a string, not an integer.
fn parse_pending_summary(reply: &Value) -> Result<PendingSummary, StreamError> {
    let parts =
        as_array(reply).ok_or(StreamError::MalformedReply("XPENDING reply not an array"))?;

    let count = parts.first().and_then(as_int).unwrap_or(0).max(0) as u64;
    let lowest_id = parts.get(1).and_then(as_string);
    let highest_id = parts.get(2).and_then(as_string);

    let mut consumers = Vec::new();
    if let Some(rows) = parts.get(3).and_then(as_array) {
        for row in rows {
            let Some(pair) = as_array(row) else { continue };
            let (Some(name), Some(owned)) = (
                pair.first().and_then(as_string),
                pair.get(1).and_then(as_string),
            ) else {
                continue;
            };
            consumers.push((name, owned.parse().unwrap_or(0)));
        }
    }

    Ok(PendingSummary {
        count,
        lowest_id,
        highest_id,
        consumers,
    })
}

/// Parse the `[[stream, [[id, [k, v, ...]], ...]], ...]` shape shared by the
/// XREADGROUP variants. A Nil reply (blocking read timeout) is an empty batch.
fn parse_read_reply(reply: &Value, deliveries: u64) -> Result<Vec<StreamEntry>, StreamError> {
    if matches!(reply, Value::Nil) {
        return Ok(Vec::new());
    }

    let streams =
        as_array(reply).ok_or(StreamError::MalformedReply("XREADGROUP reply not an array"))?;

    let mut out = Vec::new();
    for stream in streams {
        let Some(parts) = as_array(stream) else { continue };
        let Some(entries_value) = parts.get(1) else {
            continue;
        };
        let mut entries = parse_entries(entries_value)?;
        for entry in &mut entries {
            entry.deliveries = deliveries;
        }
        out.append(&mut entries);
    }
    Ok(out)
}

/// Parse `[[id, [k, v, ...]], ...]`. Entries whose field list is Nil (trimmed
/// from the stream while still pending) or that lack the data field come back
/// with an empty payload; the consumer treats those as poison and acks them.
fn parse_entries(value: &Value) -> Result<Vec<StreamEntry>, StreamError> {
    let rows = as_array(value).ok_or(StreamError::MalformedReply("entry list not an array"))?;

    let mut entries = Vec::with_capacity(rows.len());
    for row in rows {
        let Some(parts) = as_array(row) else { continue };
        let Some(id) = parts.first().and_then(as_string) else {
            continue;
        };

        let mut payload = String::new();
        if let Some(fields) = parts.get(1).and_then(as_array) {
            for pair in fields.chunks(2) {
                if let (Some(key), Some(val)) =
                    (pair.first().and_then(as_string), pair.get(1).and_then(as_string))
                {
                    if key == DATA_FIELD {
                        payload = val;
                        break;
                    }
                }
            }
        }

        entries.push(StreamEntry {
            id,
            payload,
            deliveries: 1,
        });
    }

    entries.sort_by(|a, b| parse_id(&a.id).cmp(&parse_id(&b.id)));
    Ok(entries)
}

fn as_array(v: &Value) -> Option<&Vec<Value>> {
    match v {
        Value::Array(items) => Some(items),
        _ => None,
    }
}

fn as_string(v: &Value) -> Option<String> {
    match v {
        Value::BulkString(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        Value::SimpleString(s) => Some(s.clone()),
        _ => None,
    }
}

fn as_int(v: &Value) -> Option<i64> {
    match v {
        Value::Int(n) => Some(*n),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk(s: &str) -> Value {
        Value::BulkString(s.as_bytes().to_vec())
    }

    fn entry(id: &str, payload: &str) -> Value {
        Value::Array(vec![
            bulk(id),
            Value::Array(vec![bulk(DATA_FIELD), bulk(payload)]),
        ])
    }

    #[test]
    fn read_reply_timeout_is_empty() {
        let entries = parse_read_reply(&Value::Nil, 1).unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn read_reply_extracts_entries_in_id_order() {
        let reply = Value::Array(vec![Value::Array(vec![
            bulk("logs"),
            Value::Array(vec![entry("10-0", "b"), entry("9-0", "a")]),
        ])]);

        let entries = parse_read_reply(&reply, 1).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, "9-0");
        assert_eq!(entries[0].payload, "a");
        assert_eq!(entries[1].id, "10-0");
    }

    #[test]
    fn trimmed_entry_has_empty_payload() {
        let reply = Value::Array(vec![bulk("5-0"), Value::Nil]);
        let entries = parse_entries(&Value::Array(vec![reply])).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].payload, "");
    }

    #[test]
    fn malformed_reply_is_an_error() {
        assert!(matches!(
            parse_read_reply(&Value::Int(3), 1),
            Err(StreamError::MalformedReply(_))
        ));
    }

    #[test]
    fn pending_summary_parses_consumer_counts() {
        let reply = Value::Array(vec![
            Value::Int(7),
            bulk("3-0"),
            bulk("12-0"),
            Value::Array(vec![
                Value::Array(vec![bulk("worker-0"), bulk("4")]),
                Value::Array(vec![bulk("worker-1"), bulk("3")]),
            ]),
        ]);

        let summary = parse_pending_summary(&reply).unwrap();
        assert_eq!(summary.count, 7);
        assert_eq!(summary.lowest_id.as_deref(), Some("3-0"));
        assert_eq!(summary.highest_id.as_deref(), Some("12-0"));
        assert_eq!(
            summary.consumers,
            vec![("worker-0".to_string(), 4), ("worker-1".to_string(), 3)]
        );
    }

    #[test]
    fn pending_summary_with_no_pending_entries() {
        let reply = Value::Array(vec![Value::Int(0), Value::Nil, Value::Nil, Value::Nil]);
        let summary = parse_pending_summary(&reply).unwrap();
        assert_eq!(summary.count, 0);
        assert!(summary.lowest_id.is_none());
        assert!(summary.consumers.is_empty());
    }

    #[test]
    fn last_delivered_id_is_found_by_group_name() {
        let group_info = |name: &str, id: &str| {
            Value::Array(vec![
                bulk("name"),
                bulk(name),
                bulk("consumers"),
                Value::Int(3),
                bulk("pending"),
                Value::Int(0),
                bulk("last-delivered-id"),
                bulk(id),
            ])
        };
        let reply = Value::Array(vec![
            group_info("other-group", "99-0"),
            group_info("committers", "41-7"),
        ]);

        assert_eq!(
            parse_last_delivered(&reply, "committers").as_deref(),
            Some("41-7")
        );
        assert_eq!(parse_last_delivered(&reply, "missing"), None);
        // A group that has never delivered reports the zero id
        let fresh = Value::Array(vec![group_info("committers", "0-0")]);
        assert_eq!(parse_last_delivered(&fresh, "committers"), None);
    }
}
