//! Retry policies for network-adjacent operations.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::OtaError;

/// A bounded retry schedule with a fixed backoff between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay inserted between attempts.
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Builds a policy from attempt count and backoff.
    pub const fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    /// Schedule for querying the release host: 3 attempts, 3s apart.
    pub const fn provider_query() -> Self {
        Self::new(3, Duration::from_secs(3))
    }

    /// Schedule for fetching a published checksum: 3 attempts, 2s apart.
    pub const fn checksum_download() -> Self {
        Self::new(3, Duration::from_secs(2))
    }

    /// Schedule for waiting out a busy media loader: 6 probes, 5s apart.
    pub const fn loader_deferral() -> Self {
        Self::new(6, Duration::from_secs(5))
    }

    /// Runs `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// Only errors where [`OtaError::is_transient`] holds are retried. The
    /// closure receives the 1-based attempt number for logging.
    ///
    /// # Errors
    ///
    /// Returns the last error once retries are exhausted, or the first
    /// non-transient error as soon as it occurs.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, OtaError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, OtaError>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_transient() => return Err(err),
                Err(err) if attempt >= attempts => {
                    warn!(what, attempt, error = %err, "giving up after final attempt");
                    return Err(err);
                }
                Err(err) => {
                    warn!(what, attempt, error = %err, "attempt failed, retrying");
                    tokio::time::sleep(self.backoff).await;
                    attempt += 1;
                }
            }
        }
    }
}
