//! Runs the producer, workers and reclaimer as independent tasks.
//!
//! # Features
//!
//! - Any combination of roles, including several workers per process
//! - Graceful shutdown with broadcast channel
//! - Pool statistics shared by every loop

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

use super::producer::Producer;
use super::reclaimer::Reclaimer;
use super::stats::{PoolStats, SharedPoolStats};
use super::worker::Worker;

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// No producer, worker or reclaimer was added.
    #[error("No roles configured for the pool")]
    NoRoles,

    #[error("Pool is already running")]
    AlreadyRunning,

    #[error("Pool is not running")]
    NotRunning,

    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Owns the loop tasks and their shutdown channel.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    producer: Option<Arc<Producer>>,
    workers: Vec<Arc<Worker>>,
    reclaimer: Option<Arc<Reclaimer>>,
    shutdown_tx: broadcast::Sender<()>,
    handles: Vec<JoinHandle<()>>,
    stats: Arc<SharedPoolStats>,
    is_running: AtomicBool,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig) -> Self {
        // Buffer size of 1 is sufficient since we only send once
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            producer: None,
            workers: Vec::new(),
            reclaimer: None,
            shutdown_tx,
            handles: Vec::new(),
            stats: Arc::new(SharedPoolStats::new()),
            is_running: AtomicBool::new(false),
        }
    }

    /// Counters to hand to the producer and batch processors so the pool
    /// can report on them.
    pub fn shared_stats(&self) -> Arc<SharedPoolStats> {
        Arc::clone(&self.stats)
    }

    pub fn with_producer(mut self, producer: Arc<Producer>) -> Self {
        self.producer = Some(producer);
        self
    }

    pub fn with_worker(mut self, worker: Arc<Worker>) -> Self {
        self.workers.push(worker);
        self
    }

    pub fn with_reclaimer(mut self, reclaimer: Arc<Reclaimer>) -> Self {
        self.reclaimer = Some(reclaimer);
        self
    }

    /// A receiver that fires when [`shutdown`](Self::shutdown) is called.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Spawns one task per configured role.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool is already running,
    /// or `PoolError::NoRoles` if nothing was configured.
    pub fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }
        if self.producer.is_none() && self.workers.is_empty() && self.reclaimer.is_none() {
            return Err(PoolError::NoRoles);
        }

        if let Some(producer) = &self.producer {
            let producer = Arc::clone(producer);
            let shutdown = self.shutdown_tx.subscribe();
            self.handles
                .push(tokio::spawn(async move { producer.run(shutdown).await }));
        }

        for worker in &self.workers {
            let worker = Arc::clone(worker);
            let shutdown = self.shutdown_tx.subscribe();
            self.handles
                .push(tokio::spawn(async move { worker.run(shutdown).await }));
        }

        if let Some(reclaimer) = &self.reclaimer {
            let reclaimer = Arc::clone(reclaimer);
            let shutdown = self.shutdown_tx.subscribe();
            self.handles
                .push(tokio::spawn(async move { reclaimer.run(shutdown).await }));
        }

        self.is_running.store(true, Ordering::SeqCst);
        info!(
            producer = self.producer.is_some(),
            workers = self.workers.len(),
            reclaimer = self.reclaimer.is_some(),
            "Worker pool started"
        );

        Ok(())
    }

    /// Signals every loop to stop and waits for them to finish.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ShutdownTimeout` if the loops don't stop within
    /// the configured timeout. Tasks still running at that point are aborted.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!("Initiating worker pool shutdown");

        // Ignore send error - loops may have already stopped
        let _ = self.shutdown_tx.send(());

        let mut handles: Vec<JoinHandle<()>> = self.handles.drain(..).collect();
        let abort_handles: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();

        let shutdown_future = async {
            for handle in handles.iter_mut() {
                if let Err(e) = handle.await {
                    error!(error = %e, "Loop task panicked during shutdown");
                }
            }
        };

        let result = tokio::time::timeout(self.config.shutdown_timeout, shutdown_future).await;
        self.is_running.store(false, Ordering::SeqCst);

        match result {
            Ok(()) => {
                info!("Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => {
                for handle in abort_handles {
                    handle.abort();
                }
                Err(PoolError::ShutdownTimeout(self.config.shutdown_timeout))
            }
        }
    }

    /// Waits until every loop exits on its own (after an external shutdown
    /// or a panic).
    pub async fn join(&mut self) {
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                error!(error = %e, "Loop task panicked");
            }
        }
        self.is_running.store(false, Ordering::SeqCst);
    }

    pub fn stats(&self) -> PoolStats {
        self.stats.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }
}
