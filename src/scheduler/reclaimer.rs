//! Reclaim loop: take over entries stuck with an unresponsive consumer.
//!
//! Each tick:
//! 1. Skip when the group's pending set is empty.
//! 2. Scan pending entries, lowest id first, collecting those idle beyond
//!    the stuck threshold (at most `page_size` per tick).
//! 3. Claim them under the reclaimer identity with `min_idle` equal to the
//!    threshold, so an entry taken by a concurrent reclaimer is skipped.
//! 4. Dead-letter claimed entries that exhausted their delivery budget and
//!    reprocess the rest through the shared batch pipeline.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::StreamError;
use crate::metrics::{CheckSource, MetricsCollector};
use crate::stream::{EntryId, PendingEntryInfo, StreamEntry};

use super::backoff::Backoff;
use super::processor::{BatchProcessor, BatchReport};
use super::{shutdown_requested, sleep_or_shutdown};

/// Default identity used for claimed entries.
pub const DEFAULT_RECLAIMER_NAME: &str = "pel-reclaimer";

/// Default idle time after which an entry counts as stuck.
pub const DEFAULT_STUCK_THRESHOLD: Duration = Duration::from_secs(30);

/// Default time between ticks.
pub const DEFAULT_RECLAIM_INTERVAL: Duration = Duration::from_secs(10);

/// Default number of stuck entries handled per tick.
pub const DEFAULT_PAGE_SIZE: usize = 10;

/// Default delivery budget before an entry is dead-lettered.
pub const DEFAULT_MAX_DELIVERIES: u64 = 5;

const DEAD_LETTER_REASON: &str = "max deliveries exceeded";
const DEAD_LETTER_LABEL: &str = "max_deliveries";

#[derive(Debug, Clone)]
pub struct ReclaimerConfig {
    /// Consumer identity claimed entries are assigned to.
    pub identity: String,
    pub interval: Duration,
    pub stuck_threshold: Duration,
    pub page_size: usize,
    /// Deliveries after which a stuck entry is dead-lettered instead of
    /// rerun. Zero disables dead-lettering.
    pub max_deliveries: u64,
}

impl Default for ReclaimerConfig {
    fn default() -> Self {
        Self {
            identity: DEFAULT_RECLAIMER_NAME.to_string(),
            interval: DEFAULT_RECLAIM_INTERVAL,
            stuck_threshold: DEFAULT_STUCK_THRESHOLD,
            page_size: DEFAULT_PAGE_SIZE,
            max_deliveries: DEFAULT_MAX_DELIVERIES,
        }
    }
}

impl ReclaimerConfig {
    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = identity.into();
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_stuck_threshold(mut self, threshold: Duration) -> Self {
        self.stuck_threshold = threshold;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_max_deliveries(mut self, max_deliveries: u64) -> Self {
        self.max_deliveries = max_deliveries;
        self
    }

    fn exhausted(&self, info: &PendingEntryInfo) -> bool {
        self.max_deliveries > 0 && info.delivery_count >= self.max_deliveries
    }
}

/// Outcome of one reclaimer tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    /// Pending-set size at the start of the tick.
    pub pending: u64,
    /// Pending entries past the stuck threshold.
    pub stuck: usize,
    /// Entries this reclaimer actually claimed.
    pub claimed: usize,
    /// Stuck entries whose claim returned an error. They stay pending.
    pub claim_failures: usize,
    /// Entries moved to the dead-letter stream after exhausting retries.
    pub dead_lettered: usize,
    /// Result of reprocessing the claimed entries.
    pub batch: BatchReport,
}

pub struct Reclaimer {
    processor: Arc<BatchProcessor>,
    config: ReclaimerConfig,
    metrics: MetricsCollector,
}

impl Reclaimer {
    pub fn new(processor: Arc<BatchProcessor>, config: ReclaimerConfig) -> Self {
        Self {
            processor,
            config,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn identity(&self) -> &str {
        &self.config.identity
    }

    /// Pending entries past the stuck threshold, bounded by `page_size`.
    async fn scan_stuck(&self) -> Result<Vec<PendingEntryInfo>, StreamError> {
        let log = self.processor.log();
        let group = self.processor.group();
        let page_size = self.config.page_size.max(1);

        let mut stuck = Vec::new();
        let mut start = EntryId::MIN;

        loop {
            let page = log
                .pending_detail(group, start, EntryId::MAX, page_size)
                .await?;
            let Some(last) = page.last().map(|p| p.id) else {
                break;
            };
            let exhausted_page = page.len() < page_size;

            stuck.extend(
                page.into_iter()
                    .filter(|p| p.idle > self.config.stuck_threshold),
            );

            if stuck.len() >= page_size || exhausted_page || last == EntryId::MAX {
                break;
            }
            start = last.successor();
        }

        stuck.truncate(page_size);
        Ok(stuck)
    }

    /// Claims each entry on its own, so one entry the log cannot hand over
    /// does not hold back the rest of the page.
    async fn claim_each(
        &self,
        stuck: &[&PendingEntryInfo],
        report: &mut ReclaimReport,
        first_error: &mut Option<StreamError>,
    ) -> Vec<StreamEntry> {
        let log = self.processor.log();
        let group = self.processor.group();

        let mut claimed = Vec::with_capacity(stuck.len());
        for info in stuck {
            match log
                .claim(
                    group,
                    &self.config.identity,
                    self.config.stuck_threshold,
                    &[info.id],
                )
                .await
            {
                Ok(entries) => claimed.extend(entries),
                Err(e) => {
                    warn!(
                        reclaimer = %self.config.identity,
                        group,
                        entry_id = %info.id,
                        deliveries = info.delivery_count,
                        error = %e,
                        "Failed to claim stuck entry"
                    );
                    report.claim_failures += 1;
                    first_error.get_or_insert(e);
                }
            }
        }
        claimed
    }

    /// Runs a single reclaim tick.
    pub async fn run_once(&self) -> Result<ReclaimReport, StreamError> {
        let log = self.processor.log();
        let group = self.processor.group();

        let summary = log.pending_summary(group).await?;
        self.metrics.set_pending(group, summary.count);

        let mut report = ReclaimReport {
            pending: summary.count,
            ..Default::default()
        };
        if summary.count == 0 {
            return Ok(report);
        }

        let stuck = self.scan_stuck().await?;
        report.stuck = stuck.len();
        if stuck.is_empty() {
            debug!(group, pending = summary.count, "No stuck entries");
            return Ok(report);
        }

        let (exhausted, retry): (Vec<_>, Vec<_>) =
            stuck.iter().partition(|p| self.config.exhausted(p));

        // Claim before dead-lettering so two reclaimers never move the same entry.
        let mut first_error = None;
        let claimed = self.claim_each(&retry, &mut report, &mut first_error).await;
        let doomed = self.claim_each(&exhausted, &mut report, &mut first_error).await;

        // Nothing got through: surface the failure so the loop backs off.
        if report.claim_failures == report.stuck {
            if let Some(e) = first_error {
                return Err(e);
            }
        }

        report.claimed = claimed.len() + doomed.len();
        self.processor.stats().record_reclaimed(report.claimed);
        self.metrics.record_reclaimed(report.claimed);

        for entry in &doomed {
            if self
                .processor
                .dead_letter(entry, DEAD_LETTER_REASON, DEAD_LETTER_LABEL)
                .await
            {
                report.dead_lettered += 1;
            }
        }

        if !claimed.is_empty() {
            info!(
                reclaimer = %self.config.identity,
                group,
                claimed = claimed.len(),
                "Reprocessing stuck entries"
            );
            report.batch = self
                .processor
                .process(claimed, CheckSource::Reclaimer)
                .await;
        }

        Ok(report)
    }

    /// Main reclaim loop, one tick per interval until shutdown.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            reclaimer = %self.config.identity,
            group = %self.processor.group(),
            interval_ms = self.config.interval.as_millis() as u64,
            "Reclaimer started"
        );
        self.processor.stats().increment_active();
        self.metrics.worker_started();

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut backoff = Backoff::default();

        loop {
            if shutdown_requested(&mut shutdown) {
                break;
            }

            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {}
            }

            match self.run_once().await {
                Ok(report) => {
                    backoff.reset();
                    if report.claimed > 0 {
                        debug!(
                            reclaimer = %self.config.identity,
                            claimed = report.claimed,
                            acked = report.batch.acked,
                            dead_lettered = report.dead_lettered,
                            "Reclaim tick finished"
                        );
                    }
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    error!(
                        reclaimer = %self.config.identity,
                        error = %e,
                        retryable = e.is_retryable(),
                        delay_ms = delay.as_millis() as u64,
                        "Reclaim tick failed"
                    );
                    if sleep_or_shutdown(&mut shutdown, delay).await {
                        break;
                    }
                }
            }
        }

        self.metrics.worker_stopped();
        self.processor.stats().decrement_active();
        info!(reclaimer = %self.config.identity, "Reclaimer stopped");
    }
}
