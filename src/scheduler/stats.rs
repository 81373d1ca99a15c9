//! Counters shared by every loop in a pool.

use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of [`SharedPoolStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Loops currently running.
    pub active_workers: u64,
    pub checks_persisted: u64,
    /// Bulk writes that succeeded.
    pub persisted_batches: u64,
    /// Bulk writes that failed and left their batch unacknowledged.
    pub persist_failures: u64,
    pub acks: u64,
    pub reclaimed: u64,
    pub dead_lettered: u64,
    pub entries_appended: u64,
    pub producer_passes: u64,
    pub producer_skipped: u64,
}

impl PoolStats {
    /// Share of persist attempts that succeeded, as a percentage.
    pub fn persist_success_rate(&self) -> f64 {
        let total = self.persisted_batches + self.persist_failures;
        if total == 0 {
            return 0.0;
        }
        (self.persisted_batches as f64 / total as f64) * 100.0
    }
}

/// Atomic counters updated by the producer, workers and reclaimer.
#[derive(Debug, Default)]
pub struct SharedPoolStats {
    active_workers: AtomicU64,
    checks_persisted: AtomicU64,
    persisted_batches: AtomicU64,
    persist_failures: AtomicU64,
    acks: AtomicU64,
    reclaimed: AtomicU64,
    dead_lettered: AtomicU64,
    entries_appended: AtomicU64,
    producer_passes: AtomicU64,
    producer_skipped: AtomicU64,
}

impl SharedPoolStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_active(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    pub fn decrement_active(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn record_persisted(&self, count: usize) {
        self.checks_persisted
            .fetch_add(count as u64, Ordering::SeqCst);
        self.persisted_batches.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_persist_failure(&self) {
        self.persist_failures.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_ack(&self) {
        self.acks.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_reclaimed(&self, count: usize) {
        self.reclaimed.fetch_add(count as u64, Ordering::SeqCst);
    }

    pub fn record_dead_letter(&self) {
        self.dead_lettered.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_producer_pass(&self, appended: usize) {
        self.producer_passes.fetch_add(1, Ordering::SeqCst);
        self.entries_appended
            .fetch_add(appended as u64, Ordering::SeqCst);
    }

    pub fn record_producer_skipped(&self) {
        self.producer_skipped.fetch_add(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> PoolStats {
        PoolStats {
            active_workers: self.active_workers.load(Ordering::SeqCst),
            checks_persisted: self.checks_persisted.load(Ordering::SeqCst),
            persisted_batches: self.persisted_batches.load(Ordering::SeqCst),
            persist_failures: self.persist_failures.load(Ordering::SeqCst),
            acks: self.acks.load(Ordering::SeqCst),
            reclaimed: self.reclaimed.load(Ordering::SeqCst),
            dead_lettered: self.dead_lettered.load(Ordering::SeqCst),
            entries_appended: self.entries_appended.load(Ordering::SeqCst),
            producer_passes: self.producer_passes.load(Ordering::SeqCst),
            producer_skipped: self.producer_skipped.load(Ordering::SeqCst),
        }
    }
}
