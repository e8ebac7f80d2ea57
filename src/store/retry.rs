//! Retry helper for transient store failures.
//!
//! Busy/locked databases are retried with exponential backoff plus jitter.
//! Anything [`DatabaseError::is_transient`] rejects is returned immediately.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::config::QueueConfig;
use crate::error::DatabaseError;

/// Backoff parameters for [`with_retry`].
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            attempts: config.store_retry_attempts.max(1),
            base: config.store_retry_base,
            max: config.store_retry_max,
        }
    }

    /// A policy that tries exactly once.
    pub fn none() -> Self {
        Self {
            attempts: 1,
            base: Duration::ZERO,
            max: Duration::ZERO,
        }
    }

    /// Delay before retry number `retry` (0-based), without jitter.
    fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        self.base.saturating_mul(factor).min(self.max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&QueueConfig::default())
    }
}

/// Run `op` until it succeeds, fails permanently, or attempts run out.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut op: F,
) -> Result<T, DatabaseError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DatabaseError>>,
{
    let mut retry = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && retry + 1 < policy.attempts => {
                let delay = policy.backoff(retry);
                let jitter_ms = delay.as_millis() as u64 / 2;
                let jitter = if jitter_ms > 0 {
                    Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
                } else {
                    Duration::ZERO
                };
                tracing::warn!(
                    op = label,
                    attempt = retry + 1,
                    delay_ms = (delay + jitter).as_millis() as u64,
                    error = %e,
                    "Transient store error, retrying"
                );
                tokio::time::sleep(delay + jitter).await;
                retry += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
