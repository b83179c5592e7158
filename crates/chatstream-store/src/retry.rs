//! Retry with exponential backoff and jitter for transient store failures.
//!
//! Writes and reads against the message table retry a bounded number of
//! times on transient errors (busy/locked database, cancelled blocking
//! task).  Non-transient errors return immediately.  Jitter spreads
//! concurrent retries so workers do not stampede the store in lockstep.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::error::{StoreError, StoreResult};

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Multiplier applied to the delay after each retry.
    pub backoff_factor: f64,
    /// Fraction of the delay randomized in `[-jitter, +jitter]`.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            backoff_factor: 2.0,
            jitter: 0.1,
        }
    }
}

impl RetryConfig {
    fn delay_for(&self, retry: u32) -> Duration {
        let base = self.base_delay.as_secs_f64() * self.backoff_factor.powi(retry as i32 - 1);
        let jitter = base * self.jitter * rand::rng().random_range(-1.0..1.0);
        Duration::from_secs_f64((base + jitter).max(0.01))
    }
}

/// Run `op` up to `config.max_attempts` times, backing off between attempts.
///
/// Only errors for which [`StoreError::is_transient`] holds are retried.
/// When every attempt fails transiently the error is wrapped in
/// [`StoreError::RetriesExhausted`] so callers can distinguish "the store is
/// down" from a plain operation failure.
pub async fn with_retry<T, F, Fut>(
    config: &RetryConfig,
    operation: &'static str,
    mut op: F,
) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < config.max_attempts => {
                let delay = config.delay_for(attempt);
                warn!(
                    operation,
                    attempt,
                    max_attempts = config.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient store error, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) if err.is_transient() => {
                return Err(StoreError::RetriesExhausted {
                    operation,
                    attempts: attempt,
                    last_error: err.to_string(),
                });
            }
            Err(err) => return Err(err),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn transient_error() -> StoreError {
        StoreError::TaskJoin("simulated".into())
    }

    #[tokio::test]
    async fn succeeds_first_try() {
        let config = RetryConfig::default();
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = Arc::clone(&calls);

        let result: StoreResult<u32> = with_retry(&config, "op", move || {
            let calls = Arc::clone(&calls2);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(7)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let config = RetryConfig {
            base_delay: Duration::from_millis(1),
            ..Default::default()
        };
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = Arc::clone(&calls);

        let result: StoreResult<&str> = with_retry(&config, "op", move || {
            let calls = Arc::clone(&calls2);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(transient_error())
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhaustion_is_reported() {
        let config = RetryConfig {
            base_delay: Duration::from_millis(1),
            ..Default::default()
        };

        let result: StoreResult<()> =
            with_retry(&config, "doomed_op", || async { Err(transient_error()) }).await;

        match result.unwrap_err() {
            StoreError::RetriesExhausted {
                operation,
                attempts,
                ..
            } => {
                assert_eq!(operation, "doomed_op");
                assert_eq!(attempts, 3);
            }
            other => panic!("expected RetriesExhausted, got {other}"),
        }
    }

    #[tokio::test]
    async fn non_transient_fails_immediately() {
        let config = RetryConfig::default();
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = Arc::clone(&calls);

        let result: StoreResult<()> = with_retry(&config, "op", move || {
            let calls = Arc::clone(&calls2);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::NotFound {
                    entity: "message",
                    id: "m1".into(),
                })
            }
        })
        .await;

        assert!(matches!(
            result.unwrap_err(),
            StoreError::NotFound { .. }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
