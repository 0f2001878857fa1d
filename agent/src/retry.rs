//! Fixed-delay retries for endpoints known to fail transiently.

use converge_engine::ApiError;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Statuses the assignment endpoint returns under contention.
pub const RETRIABLE_STATUS_CODES: &[u16] = &[
    409, // Conflict
    429, // Too Many Requests
    503, // Service Unavailable
];

/// Retry policy with a constant delay between attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedBackoff {
    /// Total attempts, the first one included
    pub attempts: u32,
    pub delay: Duration,
    pub retry_on: Vec<u16>,
}

impl Default for FixedBackoff {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(1))
    }
}

impl FixedBackoff {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
            retry_on: RETRIABLE_STATUS_CODES.to_vec(),
        }
    }

    pub fn should_retry(&self, err: &ApiError) -> bool {
        err.status.is_some_and(|s| self.retry_on.contains(&s))
    }

    /// Run `op` until it succeeds, fails with a non-retriable error, or the
    /// attempts run out. The last error is returned.
    pub async fn run<F, Fut, T>(&self, mut op: F) -> Result<T, ApiError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.attempts && self.should_retry(&err) => {
                    tracing::warn!(
                        attempt,
                        attempts = self.attempts,
                        error = %err,
                        "Retrying request"
                    );
                    sleep(self.delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
