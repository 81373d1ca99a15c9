//! Service configuration shared by every command.

use std::time::Duration;

use crate::error::ConfigError;
use crate::probe::DEFAULT_PROBE_TIMEOUT;
use crate::scheduler::pool::WorkerPoolConfig;
use crate::scheduler::producer::{DEFAULT_CHUNK_SIZE, DEFAULT_PRODUCE_INTERVAL};
use crate::scheduler::reclaimer::{
    DEFAULT_MAX_DELIVERIES, DEFAULT_PAGE_SIZE, DEFAULT_RECLAIMER_NAME, DEFAULT_RECLAIM_INTERVAL,
    DEFAULT_STUCK_THRESHOLD,
};
use crate::scheduler::worker::{DEFAULT_BATCH_SIZE, DEFAULT_BLOCK_TIMEOUT};
use crate::scheduler::{Location, ProducerConfig, ReclaimerConfig, WorkerConfig};
use crate::stream::RedisStreamConfig;

/// Default stream key.
pub const DEFAULT_STREAM_KEY: &str = "BetterUptime:Websites";

/// Default consumer group.
pub const DEFAULT_GROUP: &str = "india";

/// Default consumer name.
pub const DEFAULT_CONSUMER: &str = "worker-1";

/// Everything the loops need to run.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub redis_url: Option<String>,
    pub database_url: Option<String>,
    pub stream_key: String,
    pub group: String,
    pub consumer: String,
    pub reclaimer_name: String,
    pub location: Location,
    pub batch_size: usize,
    pub block_timeout: Duration,
    pub reclaim_interval: Duration,
    pub stuck_threshold: Duration,
    pub page_size: usize,
    pub max_deliveries: u64,
    pub chunk_size: usize,
    pub produce_interval: Duration,
    pub probe_timeout: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            database_url: None,
            stream_key: DEFAULT_STREAM_KEY.to_string(),
            group: DEFAULT_GROUP.to_string(),
            consumer: DEFAULT_CONSUMER.to_string(),
            reclaimer_name: DEFAULT_RECLAIMER_NAME.to_string(),
            location: Location::India,
            batch_size: DEFAULT_BATCH_SIZE,
            block_timeout: DEFAULT_BLOCK_TIMEOUT,
            reclaim_interval: DEFAULT_RECLAIM_INTERVAL,
            stuck_threshold: DEFAULT_STUCK_THRESHOLD,
            page_size: DEFAULT_PAGE_SIZE,
            max_deliveries: DEFAULT_MAX_DELIVERIES,
            chunk_size: DEFAULT_CHUNK_SIZE,
            produce_interval: DEFAULT_PRODUCE_INTERVAL,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

fn non_empty(name: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::Invalid {
            name,
            reason: "must not be empty".to_string(),
        });
    }
    Ok(())
}

fn positive(name: &'static str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            name,
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(())
}

fn non_zero(name: &'static str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::Invalid {
            name,
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(())
}

impl ServiceConfig {
    /// Checks everything except the database endpoint, which only some
    /// commands need (see [`require_database_url`](Self::require_database_url)).
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.require_redis_url()?;
        non_empty("STREAM_KEY", &self.stream_key)?;
        non_empty("CONSUMER_GROUP", &self.group)?;
        non_empty("CONSUMER_NAME", &self.consumer)?;
        non_empty("RECLAIMER_NAME", &self.reclaimer_name)?;

        if self.consumer == self.reclaimer_name {
            return Err(ConfigError::Invalid {
                name: "CONSUMER_NAME",
                reason: format!(
                    "'{}' is reserved for the reclaimer identity",
                    self.reclaimer_name
                ),
            });
        }

        positive("BATCH_SIZE", self.batch_size)?;
        positive("PENDING_PAGE_SIZE", self.page_size)?;
        positive("PRODUCER_CHUNK_SIZE", self.chunk_size)?;
        non_zero("BLOCK_TIMEOUT_MS", self.block_timeout)?;
        non_zero("RECLAIM_INTERVAL_MS", self.reclaim_interval)?;
        non_zero("PRODUCE_INTERVAL_MS", self.produce_interval)?;
        non_zero("PROBE_TIMEOUT_MS", self.probe_timeout)?;

        Ok(())
    }

    pub fn require_redis_url(&self) -> Result<&str, ConfigError> {
        self.redis_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .ok_or(ConfigError::Missing("REDIS_URL"))
    }

    pub fn require_database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .ok_or(ConfigError::Missing("DATABASE_URL"))
    }

    pub fn stream_config(&self) -> Result<RedisStreamConfig, ConfigError> {
        Ok(RedisStreamConfig::new(
            self.require_redis_url()?,
            &self.stream_key,
        ))
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig::new(&self.consumer)
            .with_batch_size(self.batch_size)
            .with_block_timeout(self.block_timeout)
    }

    pub fn reclaimer_config(&self) -> ReclaimerConfig {
        ReclaimerConfig::default()
            .with_identity(&self.reclaimer_name)
            .with_interval(self.reclaim_interval)
            .with_stuck_threshold(self.stuck_threshold)
            .with_page_size(self.page_size)
            .with_max_deliveries(self.max_deliveries)
    }

    pub fn producer_config(&self) -> ProducerConfig {
        ProducerConfig::default()
            .with_chunk_size(self.chunk_size)
            .with_interval(self.produce_interval)
    }

    pub fn pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig::default().with_shutdown_timeout(self.shutdown_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> ServiceConfig {
        ServiceConfig {
            redis_url: Some("redis://localhost:6379".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults_follow_deployment() {
        let config = ServiceConfig::default();
        assert_eq!(config.stream_key, "BetterUptime:Websites");
        assert_eq!(config.group, "india");
        assert_eq!(config.consumer, "worker-1");
        assert_eq!(config.reclaimer_name, "pel-reclaimer");
        assert_eq!(config.location, Location::India);
        assert_eq!(config.chunk_size, 500);
    }

    #[test]
    fn test_missing_redis_url_is_fatal() {
        let err = ServiceConfig::default().validate().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("REDIS_URL")));

        let blank = ServiceConfig {
            redis_url: Some("  ".to_string()),
            ..Default::default()
        };
        assert!(blank.validate().is_err());
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(valid().validate().is_ok());
        assert!(valid().require_database_url().is_err());
    }

    #[test]
    fn test_consumer_must_differ_from_reclaimer() {
        let config = ServiceConfig {
            consumer: "pel-reclaimer".to_string(),
            ..valid()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("CONSUMER_NAME"));
    }

    #[test]
    fn test_zero_sizes_rejected() {
        let config = ServiceConfig {
            batch_size: 0,
            ..valid()
        };
        assert!(config.validate().is_err());

        let config = ServiceConfig {
            block_timeout: Duration::ZERO,
            ..valid()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_derived_configs() {
        let config = ServiceConfig {
            consumer: "worker-9".to_string(),
            max_deliveries: 0,
            ..valid()
        };
        assert_eq!(config.worker_config().consumer, "worker-9");
        assert_eq!(config.reclaimer_config().max_deliveries, 0);
        assert_eq!(config.producer_config().chunk_size, 500);
        assert_eq!(config.stream_config().unwrap().stream, "BetterUptime:Websites");
    }
}
