//! Durable, ordered, append-only log with consumer-group delivery.
//!
//! Two implementations share one contract:
//!
//! - **RedisStreamLog**: Redis Streams (`XADD`, `XREADGROUP`, `XPENDING`,
//!   `XCLAIM`, `XACK`) for production deployments
//! - **MemoryLog**: an in-process log with the same group semantics, driven
//!   by an injectable clock
//!
//! # Entry lifecycle
//!
//! ```text
//!   append ──► unseen ──read_group──► pending ──ack──► acknowledged
//!                                      │  ▲
//!                                      └──┘ claim (idle >= min_idle)
//! ```
//!
//! An entry is pending from its first delivery until it is acknowledged.
//! Every delivery or claim resets its idle time and bumps its delivery
//! count. Acknowledgement is idempotent.

mod memory;
mod redis_log;

pub use self::memory::MemoryLog;
pub use self::redis_log::{RedisStreamConfig, RedisStreamLog};

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::StreamError;
use crate::scheduler::WorkItem;

/// Returns the key of the dead-letter stream paired with `stream`.
pub fn dead_letter_key(stream: &str) -> String {
    format!("{}:dead_letter", stream)
}

/// Ordered entry identifier in `<millis>-<seq>` form.
///
/// Strictly increasing within a log and the sole ordering key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EntryId {
    pub millis: u64,
    pub seq: u64,
}

impl EntryId {
    /// Lowest possible identifier (`-` in range queries).
    pub const MIN: EntryId = EntryId { millis: 0, seq: 0 };
    /// Highest possible identifier (`+` in range queries).
    pub const MAX: EntryId = EntryId {
        millis: u64::MAX,
        seq: u64::MAX,
    };

    pub const fn new(millis: u64, seq: u64) -> Self {
        Self { millis, seq }
    }

    /// The identifier that follows `self` when appending at `now_millis`.
    pub fn next_after(self, now_millis: u64) -> Self {
        if now_millis > self.millis {
            Self::new(now_millis, 0)
        } else {
            Self::new(self.millis, self.seq + 1)
        }
    }

    /// The smallest identifier greater than `self`, saturating at `MAX`.
    pub fn successor(self) -> Self {
        match self.seq.checked_add(1) {
            Some(seq) => Self::new(self.millis, seq),
            None => match self.millis.checked_add(1) {
                Some(millis) => Self::new(millis, 0),
                None => Self::MAX,
            },
        }
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

impl FromStr for EntryId {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || StreamError::InvalidEntryId(s.to_string());
        let (millis, seq) = match s.split_once('-') {
            Some((millis, seq)) => (millis, seq),
            None => (s, "0"),
        };
        let millis = millis.parse::<u64>().map_err(|_| invalid())?;
        let seq = seq.parse::<u64>().map_err(|_| invalid())?;
        Ok(Self::new(millis, seq))
    }
}

impl Serialize for EntryId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EntryId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// One delivered entry together with its delivery bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    pub id: EntryId,
    /// Raw field mapping as stored in the log.
    pub fields: HashMap<String, String>,
    /// Number of times the entry has been delivered, including this one.
    pub delivery_count: u64,
    /// Consumer that currently owns the entry.
    pub owner: String,
    /// When the entry was last delivered or claimed.
    pub last_delivery: DateTime<Utc>,
}

impl StreamEntry {
    /// Decodes the work item carried by this entry.
    pub fn work_item(&self) -> Result<WorkItem, String> {
        WorkItem::from_fields(&self.fields)
    }
}

/// Aggregate view of a group's pending set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingSummary {
    pub count: u64,
}

/// Per-entry view of a group's pending set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntryInfo {
    pub id: EntryId,
    pub owner: String,
    pub delivery_count: u64,
    /// Time since the entry was last delivered or claimed.
    pub idle: Duration,
}

/// Contract shared by every log transport.
///
/// All mutations of a group's pending set (`read_group`, `claim`, `ack`,
/// `dead_letter`) are atomic per entry, so two consumers never both
/// believe they own the same entry.
#[async_trait]
pub trait DurableLog: Send + Sync {
    /// Key of the stream this log appends to.
    fn stream(&self) -> &str;

    /// Creates the consumer group if missing. Returns `true` if it was
    /// created by this call.
    async fn ensure_group(&self, group: &str) -> Result<bool, StreamError>;

    async fn append(&self, item: &WorkItem) -> Result<EntryId, StreamError>;

    /// Appends all items as one batched operation, preserving order.
    async fn append_bulk(&self, items: &[WorkItem]) -> Result<Vec<EntryId>, StreamError>;

    /// Delivers up to `max_count` entries never delivered to `group`.
    ///
    /// Blocks up to `block` when nothing is available and then returns an
    /// empty batch. A zero `block` never waits.
    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        max_count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StreamError>;

    async fn pending_summary(&self, group: &str) -> Result<PendingSummary, StreamError>;

    /// Lists pending entries with ids in `start..=end`, lowest first.
    async fn pending_detail(
        &self,
        group: &str,
        start: EntryId,
        end: EntryId,
        max_count: usize,
    ) -> Result<Vec<PendingEntryInfo>, StreamError>;

    /// Transfers ownership of each listed entry to `new_owner` if and only
    /// if it has been idle for at least `min_idle`. Entries that were
    /// claimed by someone else inside that window, or that are no longer
    /// pending, are silently left out of the result.
    async fn claim(
        &self,
        group: &str,
        new_owner: &str,
        min_idle: Duration,
        ids: &[EntryId],
    ) -> Result<Vec<StreamEntry>, StreamError>;

    /// Removes the entry from the pending set. Returns `false` when it was
    /// not pending (already acknowledged or unknown).
    async fn ack(&self, group: &str, id: EntryId) -> Result<bool, StreamError>;

    /// Copies the entry to the dead-letter stream and acknowledges it, as
    /// one atomic step.
    async fn dead_letter(
        &self,
        group: &str,
        entry: &StreamEntry,
        reason: &str,
    ) -> Result<EntryId, StreamError>;

    /// Number of entries in the stream, acknowledged ones included.
    async fn stream_len(&self) -> Result<u64, StreamError>;

    /// Number of entries in the dead-letter stream.
    async fn dead_letter_len(&self) -> Result<u64, StreamError>;
}
