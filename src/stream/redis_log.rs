//! Redis Streams transport for the durable log.
//!
//! Key layout:
//!
//! - `{stream}`: the append-only stream of work items
//! - `{stream}:dead_letter`: entries that exhausted their delivery budget
//!
//! Each consumer gets its own connection for blocking `XREADGROUP` calls,
//! opened on its first read. A worker parked in `BLOCK` therefore never
//! stalls acks, claims or the reads of other workers in the same process.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamClaimReply, StreamId, StreamPendingCountReply, StreamPendingReply, StreamReadReply,
};
use redis::{RedisError, Value};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::StreamError;
use crate::scheduler::WorkItem;

use super::{
    dead_letter_key, DurableLog, EntryId, PendingEntryInfo, PendingSummary, StreamEntry,
};

/// Connection settings for [`RedisStreamLog`].
#[derive(Debug, Clone)]
pub struct RedisStreamConfig {
    /// Redis connection URL (e.g., "redis://localhost:6379").
    pub url: String,
    /// Key of the work stream.
    pub stream: String,
}

impl RedisStreamConfig {
    pub fn new(url: impl Into<String>, stream: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            stream: stream.into(),
        }
    }
}

/// Durable log backed by a Redis stream.
pub struct RedisStreamLog {
    /// Connection for non-blocking commands (handles reconnection automatically).
    redis: ConnectionManager,
    client: redis::Client,
    /// Per-consumer connections reserved for `XREADGROUP ... BLOCK`.
    readers: Mutex<HashMap<String, ConnectionManager>>,
    stream: String,
    dead_letter_stream: String,
}

impl RedisStreamLog {
    /// Connects to Redis and opens the command connection.
    ///
    /// # Errors
    ///
    /// Returns `StreamError::Unavailable` if Redis cannot be reached.
    pub async fn connect(config: &RedisStreamConfig) -> Result<Self, StreamError> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| StreamError::Unavailable(e.to_string()))?;

        let redis = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| StreamError::Unavailable(e.to_string()))?;

        Ok(Self {
            redis,
            client,
            readers: Mutex::new(HashMap::new()),
            dead_letter_stream: dead_letter_key(&config.stream),
            stream: config.stream.clone(),
        })
    }

    /// Key of the paired dead-letter stream.
    pub fn dead_letter_stream(&self) -> &str {
        &self.dead_letter_stream
    }

    /// The blocking connection of `consumer`, opened on first use.
    async fn reader(&self, consumer: &str) -> Result<ConnectionManager, StreamError> {
        let mut readers = self.readers.lock().await;
        if let Some(conn) = readers.get(consumer) {
            return Ok(conn.clone());
        }

        let conn = ConnectionManager::new(self.client.clone())
            .await
            .map_err(|e| StreamError::Unavailable(e.to_string()))?;
        debug!(stream = %self.stream, consumer, "Opened blocking read connection");
        readers.insert(consumer.to_string(), conn.clone());
        Ok(conn)
    }

    fn group_error(&self, group: &str, err: RedisError) -> StreamError {
        if err.code() == Some("NOGROUP") {
            StreamError::NoGroup {
                stream: self.stream.clone(),
                group: group.to_string(),
            }
        } else {
            err.into()
        }
    }

    fn xadd(&self, key: &str, item: &WorkItem) -> redis::Cmd {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(key).arg("*");
        for (field, value) in item.to_fields() {
            cmd.arg(field).arg(value);
        }
        cmd
    }

    /// Field values are decoded leniently: one entry with unexpected bytes
    /// must not fail the whole reply, it just becomes malformed downstream.
    fn decode_entry(
        raw: StreamId,
        owner: &str,
        delivery_count: u64,
    ) -> Result<StreamEntry, StreamError> {
        let id: EntryId = raw.id.parse()?;
        let fields = raw
            .map
            .into_iter()
            .filter_map(|(key, value)| field_value(&value).map(|value| (key, value)))
            .collect();
        Ok(StreamEntry {
            id,
            fields,
            delivery_count,
            owner: owner.to_string(),
            last_delivery: Utc::now(),
        })
    }
}

/// String form of a stream field value. Invalid UTF-8 is replaced rather
/// than rejected; values with no scalar form are dropped.
fn field_value(value: &Value) -> Option<String> {
    match value {
        Value::Data(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        Value::Status(text) => Some(text.clone()),
        Value::Int(n) => Some(n.to_string()),
        Value::Okay => Some("OK".to_string()),
        Value::Nil | Value::Bulk(_) => None,
    }
}

/// Formats a range bound, using the open-ended markers at the extremes.
fn range_bound(id: EntryId) -> String {
    if id == EntryId::MIN {
        "-".to_string()
    } else if id == EntryId::MAX {
        "+".to_string()
    } else {
        id.to_string()
    }
}

#[async_trait]
impl DurableLog for RedisStreamLog {
    fn stream(&self) -> &str {
        &self.stream
    }

    async fn ensure_group(&self, group: &str) -> Result<bool, StreamError> {
        let mut conn = self.redis.clone();

        // Start at "0" so entries appended before the group existed are delivered.
        let created: Result<(), RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match created {
            Ok(()) => Ok(true),
            Err(e) if e.code() == Some("BUSYGROUP") => {
                debug!(stream = %self.stream, group, "Consumer group already exists");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn append(&self, item: &WorkItem) -> Result<EntryId, StreamError> {
        let mut conn = self.redis.clone();
        let id: String = self.xadd(&self.stream, item).query_async(&mut conn).await?;
        id.parse()
    }

    async fn append_bulk(&self, items: &[WorkItem]) -> Result<Vec<EntryId>, StreamError> {
        if items.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.redis.clone();

        let mut pipe = redis::pipe();
        for item in items {
            pipe.add_command(self.xadd(&self.stream, item));
        }
        let ids: Vec<String> = pipe.query_async(&mut conn).await?;

        ids.iter().map(|id| id.parse()).collect()
    }

    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        max_count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StreamError> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(max_count.max(1));
        // BLOCK 0 would wait forever; omit it for a non-blocking read.
        if !block.is_zero() {
            cmd.arg("BLOCK").arg(block.as_millis().max(1) as u64);
        }
        cmd.arg("STREAMS").arg(&self.stream).arg(">");

        // A consumer reads sequentially, so its connection never carries two
        // blocking reads at once.
        let mut conn = self.reader(consumer).await?;
        let reply: Option<StreamReadReply> = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| self.group_error(group, e))?;

        let Some(reply) = reply else {
            return Ok(Vec::new());
        };

        let mut entries = Vec::new();
        for key in reply.keys {
            for raw in key.ids {
                entries.push(Self::decode_entry(raw, consumer, 1)?);
            }
        }
        Ok(entries)
    }

    async fn pending_summary(&self, group: &str) -> Result<PendingSummary, StreamError> {
        let mut conn = self.redis.clone();
        let reply: StreamPendingReply = redis::cmd("XPENDING")
            .arg(&self.stream)
            .arg(group)
            .query_async(&mut conn)
            .await
            .map_err(|e| self.group_error(group, e))?;

        Ok(PendingSummary {
            count: reply.count() as u64,
        })
    }

    async fn pending_detail(
        &self,
        group: &str,
        start: EntryId,
        end: EntryId,
        max_count: usize,
    ) -> Result<Vec<PendingEntryInfo>, StreamError> {
        if start > end || max_count == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.redis.clone();
        let reply: StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(&self.stream)
            .arg(group)
            .arg(range_bound(start))
            .arg(range_bound(end))
            .arg(max_count)
            .query_async(&mut conn)
            .await
            .map_err(|e| self.group_error(group, e))?;

        reply
            .ids
            .into_iter()
            .map(|p| {
                Ok(PendingEntryInfo {
                    id: p.id.parse()?,
                    owner: p.consumer,
                    delivery_count: p.times_delivered as u64,
                    idle: Duration::from_millis(p.last_delivered_ms as u64),
                })
            })
            .collect()
    }

    async fn claim(
        &self,
        group: &str,
        new_owner: &str,
        min_idle: Duration,
        ids: &[EntryId],
    ) -> Result<Vec<StreamEntry>, StreamError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.redis.clone();
        let mut cmd = redis::cmd("XCLAIM");
        cmd.arg(&self.stream)
            .arg(group)
            .arg(new_owner)
            .arg(min_idle.as_millis() as u64);
        for id in ids {
            cmd.arg(id.to_string());
        }

        let reply: StreamClaimReply = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| self.group_error(group, e))?;

        if reply.ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut claimed = Vec::with_capacity(reply.ids.len());
        for raw in reply.ids {
            claimed.push(Self::decode_entry(raw, new_owner, 0)?);
        }

        // XCLAIM does not report delivery counts; read them back per entry.
        for entry in &mut claimed {
            let detail = self.pending_detail(group, entry.id, entry.id, 1).await?;
            entry.delivery_count = detail.first().map(|p| p.delivery_count).unwrap_or(1);
        }

        Ok(claimed)
    }

    async fn ack(&self, group: &str, id: EntryId) -> Result<bool, StreamError> {
        let mut conn = self.redis.clone();
        let acked: usize = redis::cmd("XACK")
            .arg(&self.stream)
            .arg(group)
            .arg(id.to_string())
            .query_async(&mut conn)
            .await
            .map_err(|e| self.group_error(group, e))?;
        Ok(acked > 0)
    }

    async fn dead_letter(
        &self,
        group: &str,
        entry: &StreamEntry,
        reason: &str,
    ) -> Result<EntryId, StreamError> {
        let mut conn = self.redis.clone();

        let mut add = redis::cmd("XADD");
        add.arg(&self.dead_letter_stream).arg("*");
        for (field, value) in &entry.fields {
            add.arg(field).arg(value);
        }
        add.arg("entry_id")
            .arg(entry.id.to_string())
            .arg("reason")
            .arg(reason)
            .arg("deliveries")
            .arg(entry.delivery_count);

        let mut ack = redis::cmd("XACK");
        ack.arg(&self.stream).arg(group).arg(entry.id.to_string());

        let mut pipe = redis::pipe();
        pipe.atomic().add_command(add).add_command(ack);
        let (dead_id, _acked): (String, usize) = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| self.group_error(group, e))?;

        dead_id.parse()
    }

    async fn stream_len(&self) -> Result<u64, StreamError> {
        let mut conn = self.redis.clone();
        let len: u64 = redis::cmd("XLEN")
            .arg(&self.stream)
            .query_async(&mut conn)
            .await?;
        Ok(len)
    }

    async fn dead_letter_len(&self) -> Result<u64, StreamError> {
        let mut conn = self.redis.clone();
        let len: u64 = redis::cmd("XLEN")
            .arg(&self.dead_letter_stream)
            .query_async(&mut conn)
            .await?;
        Ok(len)
    }
}
