use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use super::TransientError;

/// Bounded retry with exponential backoff.
///
/// Only transient errors are retried. Anything else, including an open
/// circuit breaker, is returned on the spot.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total tries, including the first.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub multiplier: f64,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Sleep before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = self.multiplier.powi(retry.saturating_sub(1) as i32);
        let millis = self.initial_backoff.as_millis() as f64 * factor;
        Duration::from_millis(millis as u64).min(self.max_backoff)
    }

    pub async fn run<F, Fut, T, E>(&self, operation: &'static str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: TransientError + Display,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = self.backoff(attempt);
                    tracing::warn!(operation, attempt, ?delay, error = %e, "transient failure, retrying");
                    metrics::counter!("retry_attempts", "operation" => operation).increment(1);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
