//! Error types for uptime-stream operations.
//!
//! Defines error types for each subsystem:
//! - Durable log transport and group bookkeeping
//! - Result persistence
//! - Work discovery
//! - Startup configuration
//!
//! Probe failures are deliberately absent: an unreachable target is a
//! `Down` result, not an error.

use thiserror::Error;

/// Errors that can occur while talking to the durable log.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The log transport could not be reached. Callers may retry.
    #[error("Log unavailable: {0}")]
    Unavailable(String),

    /// The consumer group does not exist on the stream.
    #[error("Consumer group '{group}' does not exist on stream '{stream}'")]
    NoGroup { stream: String, group: String },

    /// The log rejected a command.
    #[error("Log command failed: {0}")]
    Command(String),

    /// An entry identifier could not be parsed.
    #[error("Invalid entry id '{0}'")]
    InvalidEntryId(String),
}

impl StreamError {
    /// Whether the failure is transient and the operation may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StreamError::Unavailable(_))
    }
}

impl From<redis::RedisError> for StreamError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error()
            || err.is_connection_dropped()
            || err.is_connection_refusal()
            || err.is_timeout()
        {
            StreamError::Unavailable(err.to_string())
        } else {
            StreamError::Command(err.to_string())
        }
    }
}

/// Errors raised by the result sink. Any of these blocks acknowledgement.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Result sink rejected {count} results: {reason}")]
    Rejected { count: usize, reason: String },
}

/// Errors raised while discovering work items.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Work source unavailable: {0}")]
    Unavailable(String),
}

/// Errors detected while validating startup configuration.
///
/// These are the only fatal errors: the process aborts before any loop
/// is started.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_unavailable_is_retryable() {
        assert!(StreamError::Unavailable("refused".to_string()).is_retryable());
        assert!(!StreamError::Command("WRONGTYPE".to_string()).is_retryable());
        assert!(!StreamError::InvalidEntryId("abc".to_string()).is_retryable());
        assert!(!StreamError::NoGroup {
            stream: "s".to_string(),
            group: "g".to_string(),
        }
        .is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = ConfigError::Missing("REDIS_URL");
        assert!(err.to_string().contains("REDIS_URL"));

        let err = SinkError::Rejected {
            count: 3,
            reason: "constraint".to_string(),
        };
        assert!(err.to_string().contains('3'));
        assert!(err.to_string().contains("constraint"));

        let err = StreamError::NoGroup {
            stream: "uptime".to_string(),
            group: "india".to_string(),
        };
        assert!(err.to_string().contains("india"));
    }

    #[test]
    fn test_redis_io_error_maps_to_unavailable() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err: StreamError = redis::RedisError::from(io).into();
        assert!(err.is_retryable());
    }
}
