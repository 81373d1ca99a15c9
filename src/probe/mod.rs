//! Check function: probe a URL and classify it as Up or Down.
//!
//! A probe never fails. Unreachable hosts, timeouts and non-success
//! statuses are all reported as `CheckStatus::Down`, with the elapsed
//! wall-clock time of the attempt as latency.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use crate::scheduler::CheckStatus;

/// Default per-request timeout for [`HttpProbe`].
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Result of probing one URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub status: CheckStatus,
    pub latency_ms: u64,
}

impl ProbeOutcome {
    pub fn up(latency_ms: u64) -> Self {
        Self {
            status: CheckStatus::Up,
            latency_ms,
        }
    }

    pub fn down(latency_ms: u64) -> Self {
        Self {
            status: CheckStatus::Down,
            latency_ms,
        }
    }
}

#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self, url: &str) -> ProbeOutcome;
}

/// HTTP GET probe. Any 2xx response is `Up`.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: Client,
}

impl HttpProbe {
    /// Builds a probe whose requests give up after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn probe(&self, url: &str) -> ProbeOutcome {
        let started = Instant::now();
        let response = self.client.get(url).send().await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match response {
            Ok(resp) if resp.status().is_success() => ProbeOutcome::up(latency_ms),
            Ok(resp) => {
                debug!(url, status = resp.status().as_u16(), "Probe got non-success status");
                ProbeOutcome::down(latency_ms)
            }
            Err(e) => {
                debug!(url, error = %e, "Probe request failed");
                ProbeOutcome::down(latency_ms)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unparseable_url_is_down() {
        let probe = HttpProbe::new(Duration::from_secs(1)).unwrap();
        let outcome = probe.probe("not a url").await;
        assert_eq!(outcome.status, CheckStatus::Down);
    }

    #[tokio::test]
    async fn test_refused_connection_is_down() {
        let probe = HttpProbe::new(Duration::from_secs(2)).unwrap();
        let outcome = probe.probe("http://127.0.0.1:1/").await;
        assert_eq!(outcome.status, CheckStatus::Down);
    }

    #[test]
    fn test_outcome_constructors() {
        assert_eq!(ProbeOutcome::up(12).status, CheckStatus::Up);
        assert_eq!(ProbeOutcome::down(3).latency_ms, 3);
    }
}
