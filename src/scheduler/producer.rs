//! Producer: discover work items and append them to the stream.
//!
//! A pass lists every pending work item from the source, drops repeats of
//! the same monitor within that listing, and appends the rest in
//! fixed-size chunks. A failed chunk is retried once and then skipped;
//! later chunks still run.
//!
//! Passes never overlap. A pass requested while another is in flight
//! returns [`ProduceOutcome::Skipped`] immediately.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::SourceError;
use crate::metrics::MetricsCollector;
use crate::storage::WorkSource;
use crate::stream::DurableLog;

use super::stats::SharedPoolStats;
use super::work::WorkItem;

/// Default number of items per bulk append.
pub const DEFAULT_CHUNK_SIZE: usize = 500;

/// Default time between passes.
pub const DEFAULT_PRODUCE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct ProducerConfig {
    pub chunk_size: usize,
    pub interval: Duration,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            interval: DEFAULT_PRODUCE_INTERVAL,
        }
    }
}

impl ProducerConfig {
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

/// Counts from one completed pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProduceReport {
    /// Items returned by the work source.
    pub discovered: usize,
    /// Items left after dropping repeated monitor ids.
    pub unique: usize,
    /// Entries appended to the stream.
    pub appended: usize,
    /// Chunks that failed twice and were skipped.
    pub failed_chunks: usize,
    /// Items in the skipped chunks.
    pub failed_items: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProduceOutcome {
    /// A previous pass was still running.
    Skipped,
    Completed(ProduceReport),
}

/// Releases the in-flight flag when the pass ends, including on panic or
/// cancellation.
struct PassGuard<'a> {
    running: &'a AtomicBool,
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

pub struct Producer {
    log: Arc<dyn DurableLog>,
    source: Arc<dyn WorkSource>,
    config: ProducerConfig,
    running: AtomicBool,
    metrics: MetricsCollector,
    stats: Arc<SharedPoolStats>,
}

impl Producer {
    pub fn new(
        log: Arc<dyn DurableLog>,
        source: Arc<dyn WorkSource>,
        config: ProducerConfig,
    ) -> Self {
        Self {
            log,
            source,
            config,
            running: AtomicBool::new(false),
            metrics: MetricsCollector::new(),
            stats: Arc::new(SharedPoolStats::new()),
        }
    }

    pub fn with_stats(mut self, stats: Arc<SharedPoolStats>) -> Self {
        self.stats = stats;
        self
    }

    /// Whether a pass is currently in flight.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn try_begin(&self) -> Option<PassGuard<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| PassGuard {
                running: &self.running,
            })
    }

    /// Runs one discovery and append pass.
    ///
    /// # Errors
    ///
    /// Returns the source error if work items could not be listed. Append
    /// failures are reported in the [`ProduceReport`] instead.
    pub async fn produce_once(&self) -> Result<ProduceOutcome, SourceError> {
        let Some(_guard) = self.try_begin() else {
            debug!("Producer pass already in flight, skipping");
            self.metrics.record_producer_skipped();
            self.stats.record_producer_skipped();
            return Ok(ProduceOutcome::Skipped);
        };

        let started = Instant::now();
        let discovered = self.source.list_pending_work_items().await?;
        let discovered_count = discovered.len();
        let items = dedup_by_monitor(discovered);

        let mut report = ProduceReport {
            discovered: discovered_count,
            unique: items.len(),
            ..Default::default()
        };

        for (index, chunk) in items.chunks(self.config.chunk_size.max(1)).enumerate() {
            match self.append_chunk(index, chunk).await {
                Some(appended) => report.appended += appended,
                None => {
                    report.failed_chunks += 1;
                    report.failed_items += chunk.len();
                }
            }
        }

        self.metrics.record_appended(report.appended);
        self.metrics.record_append_failure(report.failed_items);
        self.stats.record_producer_pass(report.appended);

        info!(
            stream = %self.log.stream(),
            discovered = report.discovered,
            appended = report.appended,
            failed_chunks = report.failed_chunks,
            duration_ms = started.elapsed().as_millis() as u64,
            "Producer pass finished"
        );

        Ok(ProduceOutcome::Completed(report))
    }

    /// Appends one chunk, retrying it once. Returns the number appended, or
    /// `None` when both attempts failed.
    async fn append_chunk(&self, index: usize, chunk: &[WorkItem]) -> Option<usize> {
        match self.log.append_bulk(chunk).await {
            Ok(ids) => return Some(ids.len()),
            Err(e) => {
                warn!(chunk = index, size = chunk.len(), error = %e, "Chunk append failed, retrying once");
            }
        }

        match self.log.append_bulk(chunk).await {
            Ok(ids) => Some(ids.len()),
            Err(e) => {
                error!(chunk = index, size = chunk.len(), error = %e, "Chunk append failed again, skipping");
                None
            }
        }
    }

    /// Eager first pass, then one pass per interval until shutdown.
    ///
    /// Each pass runs as its own task, so a pass that outlasts the interval
    /// makes the next tick report `Skipped` rather than delaying the timer.
    /// Returns only after every spawned pass has finished.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!(
            stream = %self.log.stream(),
            interval_ms = self.config.interval.as_millis() as u64,
            "Producer started"
        );
        self.stats.increment_active();
        self.metrics.worker_started();

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // Every spawned pass, including ones that only report `Skipped`.
        let mut passes: Vec<JoinHandle<()>> = Vec::new();

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {}
            }

            passes.retain(|pass| !pass.is_finished());

            let producer = Arc::clone(&self);
            passes.push(tokio::spawn(async move {
                if let Err(e) = producer.produce_once().await {
                    error!(error = %e, "Producer failed to list work items");
                }
            }));
        }

        for pass in passes {
            if let Err(e) = pass.await {
                error!(error = %e, "Producer pass panicked during shutdown");
            }
        }

        self.metrics.worker_stopped();
        self.stats.decrement_active();
        info!("Producer stopped");
    }
}

/// Keeps the first occurrence of each monitor id, preserving order.
fn dedup_by_monitor(items: Vec<WorkItem>) -> Vec<WorkItem> {
    let mut seen = HashSet::with_capacity(items.len());
    items
        .into_iter()
        .filter(|item| seen.insert(item.monitor_id.clone()))
        .collect()
}
