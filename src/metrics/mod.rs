//! Prometheus metrics for the producer, worker and reclaimer loops.
//!
//! # Example
//!
//! ```ignore
//! use uptime_stream::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics()?;
//!
//! let collector = MetricsCollector::new();
//! collector.record_appended(500);
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use self::collectors::{AckOutcome, CheckSource, MetricsCollector};
pub use self::prometheus::{export_metrics, init_metrics};

pub use self::prometheus::{
    ACKS_TOTAL, ACTIVE_WORKERS, APPEND_FAILURES_TOTAL, CHECKS_TOTAL, CHECK_LATENCY,
    DEAD_LETTERED_TOTAL, ENTRIES_APPENDED_TOTAL, PENDING_ENTRIES, PERSIST_FAILURES_TOTAL,
    PRODUCER_SKIPPED_TOTAL, RECLAIMED_TOTAL, REGISTRY,
};
