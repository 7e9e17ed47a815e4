//! Bounded retry for storage-boundary failures.

use crate::config::SecureStoreConfig;
use crate::error::SecureStoreResult;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Re-runs an operation after retryable failures, with a fixed delay.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryExecutor {
    max_retries: u32,
    retry_delay: Duration,
}

impl RetryExecutor {
    pub fn new(max_retries: u32, retry_delay: Duration) -> Self {
        Self {
            max_retries,
            retry_delay,
        }
    }

    pub fn from_config(config: &SecureStoreConfig) -> Self {
        Self::new(config.max_retries, config.retry_delay())
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Runs `operation` up to `max_retries + 1` times.
    ///
    /// Only errors for which [`is_retryable`](crate::SecureStoreError::is_retryable)
    /// holds are retried. Anything else, and the last error once retries run
    /// out, is returned unchanged.
    pub async fn execute<T, F, Fut>(&self, mut operation: F) -> SecureStoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SecureStoreResult<T>>,
    {
        let mut retries_remaining = self.max_retries;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && retries_remaining > 0 => {
                    retries_remaining -= 1;
                    warn!(
                        retries_remaining,
                        "retryable failure, retrying in {:?}: {e}", self.retry_delay
                    );
                    if !self.retry_delay.is_zero() {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::from_config(&SecureStoreConfig::default())
    }
}
