//! Redis Streams-backed broker (durable, at-least-once delivery).
//!
//! - **Topics**: one stream per topic, `{prefix}:{topic}`. A stream is a single
//!   ordered log, so every message reports partition `0`.
//! - **Consumer groups**: one Redis consumer group per [`ConsumerGroupId`],
//!   created on first subscribe (`XGROUP CREATE … MKSTREAM`).
//! - **Commit**: `XACK`. Unacknowledged entries stay in the member's pending
//!   list and are read again first when the member re-subscribes under the
//!   same name.
//! - **Orphaned entries**: entries pending on another member for longer than
//!   `claim_idle` (a member that crashed and never came back) are moved to
//!   the polling member with `XAUTOCLAIM`, on subscribe and then once per
//!   `claim_idle`, and redelivered from its pending list.
//! - Entries that cannot be decoded (or were trimmed from the stream while
//!   pending) are acknowledged and dropped so they do not pin the pending list.
//!
//! Record headers are stored as `h:<name>` fields next to `key` and `payload`.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use eventbus_core::ConsumerGroupId;
use eventbus_events::{
    Broker, BrokerConsumer, BrokerError, Headers, Message, MessagePosition, ProducerRecord,
    PublishAck, SubscribeOptions,
};

/// Default stream key prefix.
const DEFAULT_PREFIX: &str = "eventbus";

const FIELD_KEY: &str = "key";
const FIELD_PAYLOAD: &str = "payload";
const HEADER_PREFIX: &str = "h:";

/// Default idle time before another member's pending entry is reclaimed.
const DEFAULT_CLAIM_IDLE: Duration = Duration::from_secs(60);
const CLAIM_BATCH: usize = 100;
/// Upper bound on `XAUTOCLAIM` round trips per sweep.
const MAX_CLAIM_ROUNDS: usize = 16;

#[derive(Debug, Clone)]
pub struct RedisStreamsBroker {
    client: redis::Client,
    prefix: String,
    claim_idle: Duration,
}

impl RedisStreamsBroker {
    /// Create a broker for `redis_url` (e.g. `redis://localhost:6379`).
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, BrokerError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        Ok(Self {
            client,
            prefix: DEFAULT_PREFIX.to_string(),
            claim_idle: DEFAULT_CLAIM_IDLE,
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// How long an entry may sit unacknowledged on another member before it
    /// is reclaimed. Keep it well above the slowest handler's batch time.
    pub fn with_claim_idle(mut self, idle: Duration) -> Self {
        self.claim_idle = idle;
        self
    }

    pub fn stream_key(&self, topic: &str) -> String {
        format!("{}:{}", self.prefix, topic)
    }

    fn connection(&self) -> Result<redis::Connection, BrokerError> {
        self.client
            .get_connection()
            .map_err(|e| BrokerError::Connection(e.to_string()))
    }

    /// Ensure a consumer group exists (idempotent).
    fn ensure_group(
        &self,
        conn: &mut redis::Connection,
        stream_key: &str,
        group: &ConsumerGroupId,
    ) -> Result<(), BrokerError> {
        // "0": a new group starts from the beginning of the stream.
        let created: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream_key)
            .arg(group.as_str())
            .arg("0")
            .arg("MKSTREAM")
            .query(conn);

        match created {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(BrokerError::Command(format!("XGROUP CREATE failed: {e}"))),
        }
    }
}

impl Broker for RedisStreamsBroker {
    #[instrument(skip(self, record), fields(topic = %record.topic), err)]
    fn publish(&self, record: ProducerRecord) -> Result<PublishAck, BrokerError> {
        let stream_key = self.stream_key(&record.topic);
        let mut conn = self.connection()?;

        let mut cmd = redis::cmd("XADD");
        cmd.arg(&stream_key)
            .arg("*")
            .arg(FIELD_KEY)
            .arg(&record.key)
            .arg(FIELD_PAYLOAD)
            .arg(&record.payload[..]);
        for (name, value) in &record.headers {
            cmd.arg(format!("{HEADER_PREFIX}{name}")).arg(value);
        }

        let id: String = cmd
            .query(&mut conn)
            .map_err(|e| BrokerError::Command(format!("XADD failed: {e}")))?;

        Ok(PublishAck {
            topic: record.topic,
            partition: 0,
            offset: stream_offset(&id),
        })
    }

    fn subscribe(
        &self,
        topic: &str,
        group: &ConsumerGroupId,
        options: SubscribeOptions,
    ) -> Result<Box<dyn BrokerConsumer>, BrokerError> {
        let stream_key = self.stream_key(topic);
        let mut conn = self.connection()?;
        self.ensure_group(&mut conn, &stream_key, group)?;

        debug!(%stream_key, %group, member = %options.member, "joined redis consumer group");
        Ok(Box::new(RedisStreamsConsumer {
            conn: Some(conn),
            topic: topic.to_string(),
            stream_key,
            group: group.clone(),
            member: options.member,
            auto_commit: options.auto_commit_interval,
            last_auto_commit: Instant::now(),
            delivered: Vec::new(),
            pending_cursor: Some("0".to_string()),
            claim_idle: self.claim_idle,
            last_claim: None,
        }))
    }
}

/// One member of a Redis consumer group.
pub struct RedisStreamsConsumer {
    conn: Option<redis::Connection>,
    topic: String,
    stream_key: String,
    group: ConsumerGroupId,
    member: String,
    auto_commit: Option<Duration>,
    last_auto_commit: Instant,
    /// Delivered but not yet acknowledged (auto-commit mode only).
    delivered: Vec<String>,
    /// Position within this member's pending list; `None` once it is drained.
    pending_cursor: Option<String>,
    claim_idle: Duration,
    last_claim: Option<Instant>,
}

impl RedisStreamsConsumer {
    fn conn(&mut self) -> Result<&mut redis::Connection, BrokerError> {
        self.conn.as_mut().ok_or(BrokerError::Closed)
    }

    fn ack(&mut self, ids: &[String]) -> Result<(), BrokerError> {
        if ids.is_empty() {
            return Ok(());
        }
        let stream_key = self.stream_key.clone();
        let group = self.group.clone();
        let _: u64 = redis::cmd("XACK")
            .arg(&stream_key)
            .arg(group.as_str())
            .arg(ids)
            .query(self.conn()?)
            .map_err(|e| BrokerError::Command(format!("XACK failed: {e}")))?;
        Ok(())
    }

    fn read(&mut self, from: &str, count: usize, block: Option<Duration>) -> Result<EntryBatch, BrokerError> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(self.group.as_str())
            .arg(&self.member)
            .arg("COUNT")
            .arg(count.max(1));
        if let Some(block) = block {
            cmd.arg("BLOCK").arg((block.as_millis() as u64).max(1));
        }
        cmd.arg("STREAMS").arg(&self.stream_key).arg(from);

        let reply: redis::Value = cmd
            .query(self.conn()?)
            .map_err(|e| BrokerError::Command(format!("XREADGROUP failed: {e}")))?;
        let batch = parse_read_reply(&self.topic, reply);
        self.drop_unreadable(&batch.unreadable)?;
        Ok(batch)
    }

    fn drop_unreadable(&mut self, ids: &[String]) -> Result<(), BrokerError> {
        if !ids.is_empty() {
            warn!(
                stream_key = %self.stream_key,
                count = ids.len(),
                "acknowledging unreadable stream entries"
            );
        }
        self.ack(ids)
    }

    fn claim_due(&self) -> bool {
        self.last_claim.is_none_or(|at| at.elapsed() >= self.claim_idle)
    }

    /// Move entries idle for `claim_idle` on any member to this one.
    /// Returns how many were claimed.
    fn claim_orphans(&mut self) -> Result<usize, BrokerError> {
        let mut cursor = "0-0".to_string();
        let mut claimed = 0;
        for _ in 0..MAX_CLAIM_ROUNDS {
            let mut cmd = redis::cmd("XAUTOCLAIM");
            cmd.arg(&self.stream_key)
                .arg(self.group.as_str())
                .arg(&self.member)
                .arg(self.claim_idle.as_millis() as u64)
                .arg(&cursor)
                .arg("COUNT")
                .arg(CLAIM_BATCH);
            let reply: redis::Value = cmd
                .query(self.conn()?)
                .map_err(|e| BrokerError::Command(format!("XAUTOCLAIM failed: {e}")))?;

            let Some((next, batch)) = parse_claim_reply(&self.topic, reply) else {
                break;
            };
            self.drop_unreadable(&batch.unreadable)?;
            claimed += batch.messages.len();
            if next == "0-0" {
                break;
            }
            cursor = next;
        }
        Ok(claimed)
    }

    fn maybe_auto_commit(&mut self, force: bool) -> Result<(), BrokerError> {
        let Some(interval) = self.auto_commit else {
            return Ok(());
        };
        if force || self.last_auto_commit.elapsed() >= interval {
            let ids = std::mem::take(&mut self.delivered);
            self.ack(&ids)?;
            self.last_auto_commit = Instant::now();
        }
        Ok(())
    }
}

impl BrokerConsumer for RedisStreamsConsumer {
    fn poll(&mut self, max_messages: usize, timeout: Duration) -> Result<Vec<Message>, BrokerError> {
        self.maybe_auto_commit(false)?;

        if self.claim_due() {
            self.last_claim = Some(Instant::now());
            match self.claim_orphans() {
                Ok(0) => {}
                Ok(claimed) => {
                    info!(
                        stream_key = %self.stream_key,
                        member = %self.member,
                        claimed,
                        "claimed entries abandoned by other members"
                    );
                    self.pending_cursor = Some("0".to_string());
                }
                // Servers before 6.2 lack XAUTOCLAIM; keep consuming.
                Err(e) => warn!(stream_key = %self.stream_key, error = %e, "claiming idle entries failed"),
            }
        }

        // Re-read this member's own unacknowledged entries before new ones.
        let messages = match self.pending_cursor.clone() {
            Some(cursor) => {
                let pending = self.read(&cursor, max_messages, None)?;
                self.pending_cursor = pending.last_id;
                if self.pending_cursor.is_none() {
                    self.read(">", max_messages, Some(timeout))?.messages
                } else {
                    debug!(
                        stream_key = %self.stream_key,
                        member = %self.member,
                        count = pending.messages.len(),
                        "redelivering pending entries"
                    );
                    pending.messages
                }
            }
            None => self.read(">", max_messages, Some(timeout))?.messages,
        };

        if self.auto_commit.is_some() {
            self.delivered.extend(messages.iter().map(|m| m.id.clone()));
        }
        Ok(messages)
    }

    fn commit(&mut self, positions: &[MessagePosition]) -> Result<(), BrokerError> {
        let ids: Vec<String> = positions.iter().map(|p| p.id.clone()).collect();
        self.ack(&ids)
    }

    fn close(&mut self) {
        if let Err(e) = self.maybe_auto_commit(true) {
            warn!(stream_key = %self.stream_key, error = %e, "final auto-commit failed");
        }
        self.conn = None;
    }
}

/// Monotonic offset from a stream entry id (`<ms>-<seq>`).
fn stream_offset(id: &str) -> u64 {
    let (ms, seq) = split_id(id);
    (ms << 16) | seq.min(0xFFFF)
}

fn split_id(id: &str) -> (u64, u64) {
    let mut parts = id.splitn(2, '-');
    let ms = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    let seq = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    (ms, seq)
}

/// Entries decoded from one reply.
#[derive(Debug, Default)]
struct EntryBatch {
    messages: Vec<Message>,
    /// Ids of entries that could not be decoded.
    unreadable: Vec<String>,
    /// Id of the last entry in the reply, readable or not.
    last_id: Option<String>,
}

/// Parse an `XREADGROUP` reply: `[[stream, [[id, [field, value, …]], …]]]` or nil.
fn parse_read_reply(topic: &str, reply: redis::Value) -> EntryBatch {
    let mut batch = EntryBatch::default();
    let redis::Value::Bulk(streams) = reply else {
        return batch;
    };

    for stream in streams {
        let redis::Value::Bulk(mut parts) = stream else {
            continue;
        };
        if parts.len() < 2 {
            continue;
        }
        if let redis::Value::Bulk(entries) = parts.swap_remove(1) {
            parse_entries(topic, entries, &mut batch);
        }
    }
    batch
}

/// Parse an `XAUTOCLAIM` reply: `[next-cursor, [entries…], (deleted ids)]`.
fn parse_claim_reply(topic: &str, reply: redis::Value) -> Option<(String, EntryBatch)> {
    let redis::Value::Bulk(mut parts) = reply else {
        return None;
    };
    if parts.len() < 2 {
        return None;
    }
    let entries = parts.swap_remove(1);
    let next = entry_id(&parts[0])?;

    let mut batch = EntryBatch::default();
    if let redis::Value::Bulk(entries) = entries {
        parse_entries(topic, entries, &mut batch);
    }
    Some((next, batch))
}

fn parse_entries(topic: &str, entries: Vec<redis::Value>, batch: &mut EntryBatch) {
    for entry in entries {
        match parse_entry(topic, entry) {
            Ok(message) => {
                batch.last_id = Some(message.id.clone());
                batch.messages.push(message);
            }
            Err(Some(id)) => {
                batch.last_id = Some(id.clone());
                batch.unreadable.push(id);
            }
            Err(None) => warn!(topic, "skipping stream entry without an id"),
        }
    }
}

fn entry_id(value: &redis::Value) -> Option<String> {
    match value {
        redis::Value::Data(data) => Some(String::from_utf8_lossy(data).into_owned()),
        redis::Value::Status(s) => Some(s.clone()),
        _ => None,
    }
}

/// Decode one `[id, [field, value, …]]` entry. On failure returns the entry id
/// when it is known.
fn parse_entry(topic: &str, entry: redis::Value) -> Result<Message, Option<String>> {
    let redis::Value::Bulk(mut parts) = entry else {
        return Err(None);
    };
    if parts.len() < 2 {
        return Err(parts.first().and_then(entry_id));
    }
    let fields = parts.swap_remove(1);
    let Some(id) = entry_id(&parts[0]) else {
        return Err(None);
    };

    // Entries deleted from the stream but still pending come back with nil fields.
    let redis::Value::Bulk(fields) = fields else {
        return Err(Some(id));
    };
    if fields.len() % 2 != 0 {
        return Err(Some(id));
    }

    let mut key = String::new();
    let mut payload = Vec::new();
    let mut headers = Headers::new();
    for pair in fields.chunks(2) {
        let [redis::Value::Data(name), redis::Value::Data(value)] = pair else {
            continue;
        };
        let name = String::from_utf8_lossy(name);
        if name == FIELD_KEY {
            key = String::from_utf8_lossy(value).into_owned();
        } else if name == FIELD_PAYLOAD {
            payload = value.clone();
        } else if let Some(header) = name.strip_prefix(HEADER_PREFIX) {
            headers.insert(header.to_string(), String::from_utf8_lossy(value).into_owned());
        }
    }

    let (ms, _) = split_id(&id);
    let timestamp = i64::try_from(ms)
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .unwrap_or_else(Utc::now);

    Ok(Message {
        topic: topic.to_string(),
        partition: 0,
        offset: stream_offset(&id),
        id,
        key,
        headers,
        payload,
        timestamp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(s: &str) -> redis::Value {
        redis::Value::Data(s.as_bytes().to_vec())
    }

    #[test]
    fn offsets_follow_entry_id_order() {
        assert!(stream_offset("1700000000000-0") < stream_offset("1700000000000-1"));
        assert!(stream_offset("1700000000000-9") < stream_offset("1700000000001-0"));
    }

    #[test]
    fn parses_read_reply_with_headers() {
        let reply = redis::Value::Bulk(vec![redis::Value::Bulk(vec![
            data("eventbus:orders"),
            redis::Value::Bulk(vec![redis::Value::Bulk(vec![
                data("1700000000000-3"),
                redis::Value::Bulk(vec![
                    data("key"),
                    data("orders"),
                    data("payload"),
                    data("{}"),
                    data("h:event-type"),
                    data("order.created"),
                ]),
            ])]),
        ])]);

        let batch = parse_read_reply("orders", reply);
        assert!(batch.unreadable.is_empty());
        assert_eq!(batch.last_id.as_deref(), Some("1700000000000-3"));
        let messages = batch.messages;
        assert_eq!(messages.len(), 1);
        let m = &messages[0];
        assert_eq!(m.id, "1700000000000-3");
        assert_eq!(m.key, "orders");
        assert_eq!(m.payload, b"{}".to_vec());
        assert_eq!(m.headers.get("event-type").map(String::as_str), Some("order.created"));
        assert_eq!(m.timestamp.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn nil_reply_yields_nothing() {
        let batch = parse_read_reply("orders", redis::Value::Nil);
        assert!(batch.messages.is_empty());
        assert!(batch.unreadable.is_empty());
        assert_eq!(batch.last_id, None);
    }

    #[test]
    fn deleted_and_malformed_entries_are_reported_for_ack() {
        let reply = redis::Value::Bulk(vec![redis::Value::Bulk(vec![
            data("eventbus:orders"),
            redis::Value::Bulk(vec![
                redis::Value::Bulk(vec![data("1700000000000-0"), redis::Value::Nil]),
                redis::Value::Bulk(vec![
                    data("1700000000000-1"),
                    redis::Value::Bulk(vec![data("payload")]),
                ]),
                redis::Value::Bulk(vec![
                    data("1700000000000-2"),
                    redis::Value::Bulk(vec![data("payload"), data("ok")]),
                ]),
            ]),
        ])]);

        let batch = parse_read_reply("orders", reply);
        assert_eq!(batch.unreadable, vec!["1700000000000-0", "1700000000000-1"]);
        assert_eq!(batch.messages.len(), 1);
        assert_eq!(batch.last_id.as_deref(), Some("1700000000000-2"));
    }

    #[test]
    fn parses_autoclaim_reply() {
        let reply = redis::Value::Bulk(vec![
            data("1700000000005-0"),
            redis::Value::Bulk(vec![
                redis::Value::Bulk(vec![
                    data("1700000000001-0"),
                    redis::Value::Bulk(vec![data("key"), data("orders"), data("payload"), data("a")]),
                ]),
                redis::Value::Bulk(vec![data("1700000000002-0"), redis::Value::Nil]),
            ]),
            redis::Value::Bulk(vec![]),
        ]);

        let (next, batch) = parse_claim_reply("orders", reply).unwrap();
        assert_eq!(next, "1700000000005-0");
        assert_eq!(batch.messages.len(), 1);
        assert_eq!(batch.messages[0].payload, b"a".to_vec());
        assert_eq!(batch.unreadable, vec!["1700000000002-0"]);

        let done = redis::Value::Bulk(vec![data("0-0"), redis::Value::Bulk(vec![])]);
        let (next, batch) = parse_claim_reply("orders", done).unwrap();
        assert_eq!(next, "0-0");
        assert!(batch.messages.is_empty());
        assert!(parse_claim_reply("orders", redis::Value::Nil).is_none());
    }
}
