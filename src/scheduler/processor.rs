//! Probe, persist and acknowledge one batch of delivered entries.
//!
//! Both the worker and the reclaimer funnel their entries through
//! [`BatchProcessor::process`]. Acknowledgement is gated on a successful
//! bulk persist: if the sink fails, every entry of the batch stays pending
//! and the reclaimer picks it up once it has been idle long enough.

use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::metrics::{AckOutcome, CheckSource, MetricsCollector};
use crate::probe::Probe;
use crate::storage::ResultSink;
use crate::stream::{DurableLog, StreamEntry};

use super::stats::SharedPoolStats;
use super::work::{CheckResult, Location};

/// Metrics label for entries without a usable work item.
pub const MALFORMED_REASON: &str = "malformed";

/// Outcome of processing one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Entries handed to the processor.
    pub received: usize,
    /// Entries moved to the dead-letter stream because their fields were
    /// unusable.
    pub malformed: usize,
    /// Results written to the sink.
    pub persisted: usize,
    /// Entries removed from the pending set by this batch.
    pub acked: usize,
    /// Whether the bulk write failed, leaving the batch pending.
    pub persist_failed: bool,
}

/// Shared probe -> persist -> ack pipeline.
pub struct BatchProcessor {
    log: Arc<dyn DurableLog>,
    probe: Arc<dyn Probe>,
    sink: Arc<dyn ResultSink>,
    group: String,
    location: Location,
    clock: Arc<dyn Clock>,
    metrics: MetricsCollector,
    stats: Arc<SharedPoolStats>,
}

impl BatchProcessor {
    pub fn new(
        log: Arc<dyn DurableLog>,
        probe: Arc<dyn Probe>,
        sink: Arc<dyn ResultSink>,
        group: impl Into<String>,
        location: Location,
    ) -> Self {
        Self {
            log,
            probe,
            sink,
            group: group.into(),
            location,
            clock: Arc::new(SystemClock),
            metrics: MetricsCollector::new(),
            stats: Arc::new(SharedPoolStats::new()),
        }
    }

    /// Uses `clock` for `checked_at` timestamps.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_stats(mut self, stats: Arc<SharedPoolStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn log(&self) -> &Arc<dyn DurableLog> {
        &self.log
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn location(&self) -> Location {
        self.location
    }

    pub fn stats(&self) -> &Arc<SharedPoolStats> {
        &self.stats
    }

    /// Runs the check for every entry, persists all results in one write,
    /// then acknowledges each persisted entry.
    ///
    /// Never fails: transport and sink errors are logged and leave the
    /// affected entries pending.
    pub async fn process(&self, entries: Vec<StreamEntry>, source: CheckSource) -> BatchReport {
        let mut report = BatchReport {
            received: entries.len(),
            ..Default::default()
        };

        let mut runnable = Vec::with_capacity(entries.len());
        for entry in entries {
            match entry.work_item() {
                Ok(item) => runnable.push((entry.id, item)),
                Err(reason) => {
                    if self.dead_letter(&entry, &reason, MALFORMED_REASON).await {
                        report.malformed += 1;
                    }
                }
            }
        }

        if runnable.is_empty() {
            return report;
        }

        let checks = runnable.iter().map(|(entry_id, item)| async move {
            let outcome = self.probe.probe(&item.url).await;
            CheckResult {
                monitor_id: item.monitor_id.clone(),
                entry_id: *entry_id,
                status: outcome.status,
                latency_ms: Some(outcome.latency_ms),
                checked_at: self.clock.now(),
                location: self.location,
            }
        });
        let results = join_all(checks).await;

        for result in &results {
            self.metrics
                .record_check(result.status, result.location, source, result.latency_ms);
        }

        if let Err(e) = self.sink.bulk_insert_results(&results).await {
            error!(
                group = %self.group,
                source = source.as_str(),
                count = results.len(),
                error = %e,
                "Failed to persist results, leaving batch pending"
            );
            self.metrics.record_persist_failure(source);
            self.stats.record_persist_failure();
            report.persist_failed = true;
            return report;
        }

        report.persisted = results.len();
        self.stats.record_persisted(results.len());

        for result in &results {
            match self.log.ack(&self.group, result.entry_id).await {
                Ok(true) => {
                    report.acked += 1;
                    self.stats.record_ack();
                    self.metrics.record_ack(AckOutcome::Acked);
                }
                Ok(false) => {
                    debug!(
                        group = %self.group,
                        entry_id = %result.entry_id,
                        "Entry was no longer pending"
                    );
                    self.metrics.record_ack(AckOutcome::NotPending);
                }
                Err(e) => {
                    warn!(
                        group = %self.group,
                        entry_id = %result.entry_id,
                        error = %e,
                        "Failed to acknowledge entry, it stays pending"
                    );
                    self.metrics.record_ack(AckOutcome::Failed);
                }
            }
        }

        info!(
            group = %self.group,
            source = source.as_str(),
            persisted = report.persisted,
            acked = report.acked,
            "Processed batch"
        );

        report
    }

    /// Moves an entry to the dead-letter stream, recording `reason` on the
    /// copy and `label` in metrics. Returns `false` when the move failed and
    /// the entry is still pending.
    pub async fn dead_letter(&self, entry: &StreamEntry, reason: &str, label: &str) -> bool {
        match self.log.dead_letter(&self.group, entry, reason).await {
            Ok(dead_id) => {
                warn!(
                    group = %self.group,
                    entry_id = %entry.id,
                    dead_letter_id = %dead_id,
                    deliveries = entry.delivery_count,
                    reason,
                    "Moved entry to dead-letter stream"
                );
                self.stats.record_dead_letter();
                self.metrics.record_dead_letter(label);
                true
            }
            Err(e) => {
                error!(
                    group = %self.group,
                    entry_id = %entry.id,
                    error = %e,
                    "Failed to dead-letter entry"
                );
                false
            }
        }
    }
}
