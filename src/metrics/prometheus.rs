//! Prometheus metrics registration and export.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all uptime-stream metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Entries appended to the stream by the producer.
pub static ENTRIES_APPENDED_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Work items whose chunk failed to append after its retry.
pub static APPEND_FAILURES_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Executed checks, labeled by status, location and source loop.
pub static CHECKS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Probe latency in seconds, labeled by location.
pub static CHECK_LATENCY: OnceLock<HistogramVec> = OnceLock::new();

/// Acknowledgements, labeled by outcome.
pub static ACKS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Failed bulk persists, labeled by source loop.
pub static PERSIST_FAILURES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Entries claimed by the reclaimer.
pub static RECLAIMED_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Entries moved to the dead-letter stream, labeled by reason.
pub static DEAD_LETTERED_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Size of a group's pending set at the last reclaimer tick.
pub static PENDING_ENTRIES: OnceLock<GaugeVec> = OnceLock::new();

/// Producer passes skipped because one was already running.
pub static PRODUCER_SKIPPED_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Number of running producer, worker and reclaimer loops.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Calling it again after a successful call is a no-op.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    // Producer metrics
    let entries_appended = Counter::new(
        "uptime_entries_appended_total",
        "Entries appended to the work stream",
    )?;
    let append_failures = Counter::new(
        "uptime_append_failures_total",
        "Work items dropped after a failed chunk append and its retry",
    )?;
    let producer_skipped = Counter::new(
        "uptime_producer_skipped_total",
        "Producer passes skipped while a previous pass was running",
    )?;

    // Check metrics
    let checks_total = CounterVec::new(
        Opts::new("uptime_checks_total", "Checks executed"),
        &["status", "location", "source"],
    )?;
    let check_latency = HistogramVec::new(
        HistogramOpts::new("uptime_check_latency_seconds", "Probe latency in seconds")
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        &["location"],
    )?;

    // Group bookkeeping
    let acks_total = CounterVec::new(
        Opts::new("uptime_acks_total", "Acknowledgements by outcome"),
        &["outcome"],
    )?;
    let persist_failures = CounterVec::new(
        Opts::new(
            "uptime_persist_failures_total",
            "Bulk result writes that failed, blocking acknowledgement",
        ),
        &["source"],
    )?;
    let reclaimed = Counter::new("uptime_reclaimed_total", "Entries claimed by the reclaimer")?;
    let dead_lettered = CounterVec::new(
        Opts::new(
            "uptime_dead_lettered_total",
            "Entries moved to the dead-letter stream",
        ),
        &["reason"],
    )?;
    let pending_entries = GaugeVec::new(
        Opts::new("uptime_pending_entries", "Pending entries per consumer group"),
        &["group"],
    )?;

    let active_workers = Gauge::new("uptime_active_workers", "Number of running loops")?;

    registry.register(Box::new(entries_appended.clone()))?;
    registry.register(Box::new(append_failures.clone()))?;
    registry.register(Box::new(producer_skipped.clone()))?;
    registry.register(Box::new(checks_total.clone()))?;
    registry.register(Box::new(check_latency.clone()))?;
    registry.register(Box::new(acks_total.clone()))?;
    registry.register(Box::new(persist_failures.clone()))?;
    registry.register(Box::new(reclaimed.clone()))?;
    registry.register(Box::new(dead_lettered.clone()))?;
    registry.register(Box::new(pending_entries.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;

    // A concurrent initializer may win the race; its metrics stay in place.
    let _ = REGISTRY.set(registry);
    let _ = ENTRIES_APPENDED_TOTAL.set(entries_appended);
    let _ = APPEND_FAILURES_TOTAL.set(append_failures);
    let _ = PRODUCER_SKIPPED_TOTAL.set(producer_skipped);
    let _ = CHECKS_TOTAL.set(checks_total);
    let _ = CHECK_LATENCY.set(check_latency);
    let _ = ACKS_TOTAL.set(acks_total);
    let _ = PERSIST_FAILURES_TOTAL.set(persist_failures);
    let _ = RECLAIMED_TOTAL.set(reclaimed);
    let _ = DEAD_LETTERED_TOTAL.set(dead_lettered);
    let _ = PENDING_ENTRIES.set(pending_entries);
    let _ = ACTIVE_WORKERS.set(active_workers);

    tracing::debug!("Prometheus metrics initialized");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns a comment line instead when the registry is not initialized or
/// encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
