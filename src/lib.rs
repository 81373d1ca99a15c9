//! uptime-stream: distributed uptime checks over a durable stream.
//!
//! A producer appends one work item per monitor to a stream, workers in a
//! consumer group probe the URLs and persist results, and a reclaimer
//! takes over entries left pending by consumers that stopped responding.
//! An entry is acknowledged only after its result is stored.

pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod metrics;
pub mod probe;
pub mod scheduler;
pub mod storage;
pub mod stream;

pub use error::{ConfigError, SinkError, SourceError, StreamError};
