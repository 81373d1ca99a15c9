//! Consumer loop: read unseen entries, check, persist, ack.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::error::StreamError;
use crate::metrics::{CheckSource, MetricsCollector};

use super::backoff::Backoff;
use super::processor::{BatchProcessor, BatchReport};
use super::{shutdown_requested, sleep_or_shutdown};

/// Default number of entries per read.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Default long-poll timeout for a read.
pub const DEFAULT_BLOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for one consumer identity.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Consumer name within the group. Must be unique per process.
    pub consumer: String,
    /// Maximum entries per read.
    pub batch_size: usize,
    /// How long a read waits for new entries before returning empty.
    pub block_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            consumer: "worker-1".to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            block_timeout: DEFAULT_BLOCK_TIMEOUT,
        }
    }
}

impl WorkerConfig {
    pub fn new(consumer: impl Into<String>) -> Self {
        Self {
            consumer: consumer.into(),
            ..Default::default()
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_block_timeout(mut self, timeout: Duration) -> Self {
        self.block_timeout = timeout;
        self
    }
}

/// A single consumer in the group.
pub struct Worker {
    processor: Arc<BatchProcessor>,
    config: WorkerConfig,
    metrics: MetricsCollector,
}

impl Worker {
    pub fn new(processor: Arc<BatchProcessor>, config: WorkerConfig) -> Self {
        Self {
            processor,
            config,
            metrics: MetricsCollector::new(),
        }
    }

    /// Returns the worker's consumer name.
    pub fn id(&self) -> &str {
        &self.config.consumer
    }

    /// One iteration: a blocking read followed by processing of whatever
    /// was delivered.
    pub async fn run_once(&self) -> Result<BatchReport, StreamError> {
        let entries = self
            .processor
            .log()
            .read_group(
                self.processor.group(),
                &self.config.consumer,
                self.config.batch_size,
                self.config.block_timeout,
            )
            .await?;

        if entries.is_empty() {
            return Ok(BatchReport::default());
        }

        debug!(
            worker_id = %self.config.consumer,
            count = entries.len(),
            "Received entries"
        );

        Ok(self.processor.process(entries, CheckSource::Worker).await)
    }

    /// Main worker loop.
    ///
    /// Runs until a shutdown signal is received. Shutdown is checked before
    /// every read; a read in progress is allowed to finish, so shutdown
    /// latency is bounded by the block timeout.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            worker_id = %self.config.consumer,
            group = %self.processor.group(),
            "Worker started"
        );
        self.processor.stats().increment_active();
        self.metrics.worker_started();

        let mut backoff = Backoff::default();

        loop {
            if shutdown_requested(&mut shutdown) {
                info!(worker_id = %self.config.consumer, "Worker received shutdown signal");
                break;
            }

            match self.run_once().await {
                Ok(report) => {
                    backoff.reset();
                    if report.received == 0 {
                        debug!(worker_id = %self.config.consumer, "No new entries");
                    }
                }
                Err(StreamError::NoGroup { stream, group }) => {
                    warn!(
                        worker_id = %self.config.consumer,
                        stream = %stream,
                        group = %group,
                        "Consumer group missing, recreating"
                    );
                    if let Err(e) = self.processor.log().ensure_group(&group).await {
                        error!(worker_id = %self.config.consumer, error = %e, "Failed to recreate group");
                        if sleep_or_shutdown(&mut shutdown, backoff.next_delay()).await {
                            break;
                        }
                    }
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    error!(
                        worker_id = %self.config.consumer,
                        error = %e,
                        retryable = e.is_retryable(),
                        delay_ms = delay.as_millis() as u64,
                        "Failed to read from stream"
                    );
                    if sleep_or_shutdown(&mut shutdown, delay).await {
                        break;
                    }
                }
            }
        }

        self.metrics.worker_stopped();
        self.processor.stats().decrement_active();
        info!(worker_id = %self.config.consumer, "Worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_config_default() {
        let config = WorkerConfig::default();
        assert_eq!(config.consumer, "worker-1");
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.block_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_worker_config_builder() {
        let config = WorkerConfig::new("worker-7")
            .with_batch_size(50)
            .with_block_timeout(Duration::from_millis(250));
        assert_eq!(config.consumer, "worker-7");
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.block_timeout, Duration::from_millis(250));
    }
}
