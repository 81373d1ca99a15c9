//! High-level recording interface over the raw Prometheus metrics.
//!
//! Every method is a no-op until `init_metrics()` has run, so library users
//! and tests never have to initialize metrics.

use crate::scheduler::{CheckStatus, Location};

use super::prometheus::{
    ACKS_TOTAL, ACTIVE_WORKERS, APPEND_FAILURES_TOTAL, CHECKS_TOTAL, CHECK_LATENCY,
    DEAD_LETTERED_TOTAL, ENTRIES_APPENDED_TOTAL, PENDING_ENTRIES, PERSIST_FAILURES_TOTAL,
    PRODUCER_SKIPPED_TOTAL, RECLAIMED_TOTAL,
};

/// Loop that executed a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckSource {
    Worker,
    Reclaimer,
}

impl CheckSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckSource::Worker => "worker",
            CheckSource::Reclaimer => "reclaimer",
        }
    }
}

/// Result of acknowledging one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Acked,
    /// Already acknowledged or claimed elsewhere.
    NotPending,
    Failed,
}

impl AckOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AckOutcome::Acked => "acked",
            AckOutcome::NotPending => "not_pending",
            AckOutcome::Failed => "failed",
        }
    }
}

/// Metrics collector for recording uptime-stream operational metrics.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    pub fn record_appended(&self, count: usize) {
        if let Some(counter) = ENTRIES_APPENDED_TOTAL.get() {
            counter.inc_by(count as f64);
        }
    }

    pub fn record_append_failure(&self, count: usize) {
        if let Some(counter) = APPEND_FAILURES_TOTAL.get() {
            counter.inc_by(count as f64);
        }
    }

    pub fn record_producer_skipped(&self) {
        if let Some(counter) = PRODUCER_SKIPPED_TOTAL.get() {
            counter.inc();
        }
    }

    /// Record one executed check.
    pub fn record_check(
        &self,
        status: CheckStatus,
        location: Location,
        source: CheckSource,
        latency_ms: Option<u64>,
    ) {
        if let Some(checks) = CHECKS_TOTAL.get() {
            checks
                .with_label_values(&[status.as_str(), location.as_str(), source.as_str()])
                .inc();
        }

        if let (Some(histogram), Some(ms)) = (CHECK_LATENCY.get(), latency_ms) {
            histogram
                .with_label_values(&[location.as_str()])
                .observe(ms as f64 / 1000.0);
        }

        tracing::trace!(
            status = %status,
            location = %location,
            source = source.as_str(),
            "Recorded check metric"
        );
    }

    pub fn record_ack(&self, outcome: AckOutcome) {
        if let Some(acks) = ACKS_TOTAL.get() {
            acks.with_label_values(&[outcome.as_str()]).inc();
        }
    }

    pub fn record_persist_failure(&self, source: CheckSource) {
        if let Some(failures) = PERSIST_FAILURES_TOTAL.get() {
            failures.with_label_values(&[source.as_str()]).inc();
        }
    }

    pub fn record_reclaimed(&self, count: usize) {
        if let Some(counter) = RECLAIMED_TOTAL.get() {
            counter.inc_by(count as f64);
        }
    }

    /// Record a dead-lettered entry. `reason` should be a short label such
    /// as "max_deliveries" or "malformed".
    pub fn record_dead_letter(&self, reason: &str) {
        if let Some(counter) = DEAD_LETTERED_TOTAL.get() {
            counter.with_label_values(&[reason]).inc();
        }
    }

    pub fn set_pending(&self, group: &str, count: u64) {
        if let Some(gauge) = PENDING_ENTRIES.get() {
            gauge.with_label_values(&[group]).set(count as f64);
        }
    }

    pub fn worker_started(&self) {
        if let Some(gauge) = ACTIVE_WORKERS.get() {
            gauge.inc();
        }
    }

    pub fn worker_stopped(&self) {
        if let Some(gauge) = ACTIVE_WORKERS.get() {
            gauge.dec();
        }
    }
}
