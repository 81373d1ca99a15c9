//! Shared fakes for the integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use uptime_stream::clock::ManualClock;
use uptime_stream::error::{SinkError, SourceError, StreamError};
use uptime_stream::probe::{Probe, ProbeOutcome};
use uptime_stream::scheduler::{
    BatchProcessor, CheckResult, Location, Reclaimer, ReclaimerConfig, Worker, WorkerConfig,
    WorkItem,
};
use uptime_stream::storage::{ResultSink, WorkSource};
use uptime_stream::stream::{
    DurableLog, EntryId, MemoryLog, PendingEntryInfo, PendingSummary, StreamEntry,
};

pub const STREAM: &str = "BetterUptime:Websites";
pub const GROUP: &str = "india";

/// Reports `Down` for the configured URLs and `Up` for everything else.
#[derive(Default)]
pub struct ScriptedProbe {
    down: HashSet<String>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedProbe {
    pub fn down_for(urls: &[&str]) -> Self {
        Self {
            down: urls.iter().map(|u| u.to_string()).collect(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Probe for ScriptedProbe {
    async fn probe(&self, url: &str) -> ProbeOutcome {
        self.calls.lock().unwrap().push(url.to_string());
        if self.down.contains(url) {
            ProbeOutcome::down(3)
        } else {
            ProbeOutcome::up(3)
        }
    }
}

/// Keeps every persisted result; can be switched to reject writes.
#[derive(Default)]
pub struct RecordingSink {
    results: Mutex<Vec<CheckResult>>,
    failing: AtomicBool,
    writes: AtomicUsize,
}

impl RecordingSink {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn results(&self) -> Vec<CheckResult> {
        self.results.lock().unwrap().clone()
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResultSink for RecordingSink {
    async fn bulk_insert_results(&self, results: &[CheckResult]) -> Result<(), SinkError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(SinkError::Rejected {
                count: results.len(),
                reason: "database offline".to_string(),
            });
        }
        self.results.lock().unwrap().extend_from_slice(results);
        Ok(())
    }
}

/// Returns the same listing on every pass.
pub struct StaticSource(pub Vec<WorkItem>);

#[async_trait]
impl WorkSource for StaticSource {
    async fn list_pending_work_items(&self) -> Result<Vec<WorkItem>, SourceError> {
        Ok(self.0.clone())
    }
}

/// Takes `delay` to produce each listing.
pub struct SlowSource {
    pub items: Vec<WorkItem>,
    pub delay: Duration,
}

#[async_trait]
impl WorkSource for SlowSource {
    async fn list_pending_work_items(&self) -> Result<Vec<WorkItem>, SourceError> {
        tokio::time::sleep(self.delay).await;
        Ok(self.items.clone())
    }
}

/// Holds every listing until `release` is called.
pub struct GatedSource {
    items: Vec<WorkItem>,
    gate: Notify,
}

impl GatedSource {
    pub fn new(items: Vec<WorkItem>) -> Self {
        Self {
            items,
            gate: Notify::new(),
        }
    }

    pub fn release(&self) {
        self.gate.notify_one();
    }
}

#[async_trait]
impl WorkSource for GatedSource {
    async fn list_pending_work_items(&self) -> Result<Vec<WorkItem>, SourceError> {
        self.gate.notified().await;
        Ok(self.items.clone())
    }
}

/// Wraps a memory log, counting bulk appends and injecting failures: the
/// first few bulk appends, reads and pending summaries fail as if the
/// transport dropped, and claims touching a poisoned id fail after the
/// inner claim went through, as a reply that cannot be decoded would.
pub struct FaultyLog {
    inner: MemoryLog,
    bulk_calls: AtomicUsize,
    append_failures: AtomicUsize,
    read_failures: AtomicUsize,
    pending_failures: AtomicUsize,
    poisoned: Mutex<HashSet<EntryId>>,
}

fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn connection_reset() -> StreamError {
    StreamError::Unavailable("connection reset".to_string())
}

impl FaultyLog {
    pub fn new() -> Self {
        Self::wrap(MemoryLog::new(STREAM))
    }

    pub fn with_clock(clock: Arc<ManualClock>) -> Self {
        Self::wrap(MemoryLog::with_clock(STREAM, clock))
    }

    fn wrap(inner: MemoryLog) -> Self {
        Self {
            inner,
            bulk_calls: AtomicUsize::new(0),
            append_failures: AtomicUsize::new(0),
            read_failures: AtomicUsize::new(0),
            pending_failures: AtomicUsize::new(0),
            poisoned: Mutex::new(HashSet::new()),
        }
    }

    pub fn fail_appends(self, count: usize) -> Self {
        self.append_failures.store(count, Ordering::SeqCst);
        self
    }

    pub fn fail_reads(self, count: usize) -> Self {
        self.read_failures.store(count, Ordering::SeqCst);
        self
    }

    pub fn fail_pending_summaries(self, count: usize) -> Self {
        self.pending_failures.store(count, Ordering::SeqCst);
        self
    }

    pub fn poison(&self, id: EntryId) {
        self.poisoned.lock().unwrap().insert(id);
    }

    pub fn bulk_calls(&self) -> usize {
        self.bulk_calls.load(Ordering::SeqCst)
    }

    pub fn reads_left_to_fail(&self) -> usize {
        self.read_failures.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &MemoryLog {
        &self.inner
    }
}

#[async_trait]
impl DurableLog for FaultyLog {
    fn stream(&self) -> &str {
        self.inner.stream()
    }

    async fn ensure_group(&self, group: &str) -> Result<bool, StreamError> {
        self.inner.ensure_group(group).await
    }

    async fn append(&self, item: &WorkItem) -> Result<EntryId, StreamError> {
        self.inner.append(item).await
    }

    async fn append_bulk(&self, items: &[WorkItem]) -> Result<Vec<EntryId>, StreamError> {
        self.bulk_calls.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.append_failures) {
            return Err(connection_reset());
        }
        self.inner.append_bulk(items).await
    }

    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        max_count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StreamError> {
        if take_failure(&self.read_failures) {
            return Err(connection_reset());
        }
        self.inner.read_group(group, consumer, max_count, block).await
    }

    async fn pending_summary(&self, group: &str) -> Result<PendingSummary, StreamError> {
        if take_failure(&self.pending_failures) {
            return Err(connection_reset());
        }
        self.inner.pending_summary(group).await
    }

    async fn pending_detail(
        &self,
        group: &str,
        start: EntryId,
        end: EntryId,
        max_count: usize,
    ) -> Result<Vec<PendingEntryInfo>, StreamError> {
        self.inner.pending_detail(group, start, end, max_count).await
    }

    async fn claim(
        &self,
        group: &str,
        new_owner: &str,
        min_idle: Duration,
        ids: &[EntryId],
    ) -> Result<Vec<StreamEntry>, StreamError> {
        let claimed = self.inner.claim(group, new_owner, min_idle, ids).await?;
        let poisoned = self.poisoned.lock().unwrap();
        if claimed.iter().any(|entry| poisoned.contains(&entry.id)) {
            return Err(StreamError::Command("Invalid UTF-8".to_string()));
        }
        Ok(claimed)
    }

    async fn ack(&self, group: &str, id: EntryId) -> Result<bool, StreamError> {
        self.inner.ack(group, id).await
    }

    async fn dead_letter(
        &self,
        group: &str,
        entry: &StreamEntry,
        reason: &str,
    ) -> Result<EntryId, StreamError> {
        self.inner.dead_letter(group, entry, reason).await
    }

    async fn stream_len(&self) -> Result<u64, StreamError> {
        self.inner.stream_len().await
    }

    async fn dead_letter_len(&self) -> Result<u64, StreamError> {
        self.inner.dead_letter_len().await
    }
}

pub fn items(count: usize) -> Vec<WorkItem> {
    (1..=count)
        .map(|i| WorkItem::new(format!("m{}", i), format!("https://site{}.test", i)))
        .collect()
}

/// A memory log on a manual clock wired to a probe and sink.
pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub log: Arc<MemoryLog>,
    pub probe: Arc<ScriptedProbe>,
    pub sink: Arc<RecordingSink>,
    pub processor: Arc<BatchProcessor>,
}

impl Harness {
    pub async fn new(down: &[&str]) -> Self {
        let clock = Arc::new(ManualClock::new());
        let log = Arc::new(MemoryLog::with_clock(STREAM, clock.clone()));
        log.ensure_group(GROUP).await.unwrap();

        let probe = Arc::new(ScriptedProbe::down_for(down));
        let sink = Arc::new(RecordingSink::default());
        let processor = Arc::new(
            BatchProcessor::new(
                log.clone(),
                probe.clone(),
                sink.clone(),
                GROUP,
                Location::India,
            )
            .with_clock(clock.clone()),
        );

        Self {
            clock,
            log,
            probe,
            sink,
            processor,
        }
    }

    pub async fn append(&self, items: &[WorkItem]) -> Vec<EntryId> {
        self.log.append_bulk(items).await.unwrap()
    }

    pub fn worker(&self, consumer: &str) -> Worker {
        Worker::new(
            Arc::clone(&self.processor),
            WorkerConfig::new(consumer).with_block_timeout(Duration::ZERO),
        )
    }

    pub fn reclaimer(&self, config: ReclaimerConfig) -> Reclaimer {
        Reclaimer::new(Arc::clone(&self.processor), config)
    }

    pub async fn pending(&self) -> Vec<PendingEntryInfo> {
        self.log
            .pending_detail(GROUP, EntryId::MIN, EntryId::MAX, 100)
            .await
            .unwrap()
    }
}
