//! Work distribution over a durable log with consumer groups.
//!
//! This module provides the three loops that move checks through the log:
//!
//! - **Producer**: discovers monitors and appends them to the stream in chunks
//! - **Worker**: reads unseen entries, checks them, persists, then acks
//! - **Reclaimer**: claims entries stuck with an unresponsive consumer
//! - **WorkerPool**: runs the enabled loops as tasks with a shared shutdown
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │   Producer   │
//!                      │  (monitors)  │
//!                      └──────┬───────┘
//!                             │ XADD
//!                      ┌──────▼───────┐
//!                      │    Redis     │
//!                      │    Stream    │
//!                      └──────┬───────┘
//!                             │ consumer group
//!         ┌───────────────────┼───────────────────┐
//!         │ XREADGROUP >      │                   │ XPENDING / XCLAIM
//!         ▼                   ▼                   ▼
//!    ┌─────────┐         ┌─────────┐       ┌───────────┐
//!    │ Worker 1│         │ Worker N│       │ Reclaimer │
//!    └─────────┘         └─────────┘       └───────────┘
//! ```
//!
//! # Reliability
//!
//! - **Ack after persist**: an entry is acknowledged only once its result is written
//! - **Crash recovery**: entries idle past the stuck threshold are claimed and rerun
//! - **Dead letter stream**: entries that exhaust their delivery budget are moved aside
//! - **Graceful shutdown**: loops stop at their next iteration boundary

pub mod backoff;
pub mod pool;
pub mod processor;
pub mod producer;
pub mod reclaimer;
pub mod stats;
pub mod work;
pub mod worker;

pub use backoff::Backoff;
pub use pool::{PoolError, WorkerPool, WorkerPoolConfig};
pub use processor::{BatchProcessor, BatchReport};
pub use producer::{ProduceOutcome, ProduceReport, Producer, ProducerConfig};
pub use reclaimer::{ReclaimReport, Reclaimer, ReclaimerConfig};
pub use stats::{PoolStats, SharedPoolStats};
pub use work::{CheckResult, CheckStatus, Location, WorkItem};
pub use worker::{Worker, WorkerConfig};

use std::time::Duration;

use tokio::sync::broadcast;

/// Non-blocking check of the shutdown channel.
///
/// A closed channel counts as a shutdown request.
pub(crate) fn shutdown_requested(shutdown: &mut broadcast::Receiver<()>) -> bool {
    match shutdown.try_recv() {
        Ok(()) => true,
        Err(broadcast::error::TryRecvError::Closed) => true,
        Err(broadcast::error::TryRecvError::Lagged(_)) => true,
        Err(broadcast::error::TryRecvError::Empty) => false,
    }
}

/// Sleeps for `delay` unless shutdown is signalled first. Returns `true`
/// when the sleep was cut short by shutdown.
pub(crate) async fn sleep_or_shutdown(
    shutdown: &mut broadcast::Receiver<()>,
    delay: Duration,
) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = shutdown.recv() => true,
    }
}
