//! Exponential-backoff retry for robot operations.
//!
//! Only transient transport failures are retried; domain failures and
//! non-transient transport errors return immediately. The combinator is a
//! plain future, so caller-side cancellation is observed at the next await
//! point rather than swallowed.

use std::future::Future;
use std::time::Duration;

use super::rpc::TransportError;

/// Retry schedule: up to `max_retries` re-attempts with delays of
/// `min(base_delay * 2^n, max_delay)` between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries (single attempt).
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Backoff delay before re-attempt number `attempt` (0-based).
    #[must_use]
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Runs `op` under this policy. Performs at most `max_retries + 1`
    /// underlying calls.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, TransportError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.max_retries => {
                    let delay = self.backoff_delay(attempt);
                    tracing::warn!(
                        error = %err,
                        attempt = attempt + 1,
                        total = self.max_retries + 1,
                        delay_ms = delay.as_millis() as u64,
                        "transient rpc failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
