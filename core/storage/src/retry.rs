//! Bounded retries with doubling backoff for transient backend errors.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use scanvault_common::{Error, Result};

/// How often and how patiently a backend call is retried.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first call.
    pub max_retries: u32,
    /// Backoff before the first retry; doubled for each one after.
    pub initial_delay: Duration,
    /// Cap on a single backoff.
    pub max_delay: Duration,
}

impl RetryConfig {
    pub fn new(max_retries: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
            max_delay,
        }
    }

    /// Backoff before retry number `retry` (zero-based).
    ///
    /// The doubled, capped delay is randomized into its upper half so
    /// clients failing together do not retry in lockstep.
    pub fn backoff(&self, retry: u32) -> Duration {
        let doubled = self
            .initial_delay
            .checked_mul(1u32 << retry.min(16))
            .unwrap_or(self.max_delay);
        let ceiling = doubled.min(self.max_delay);
        ceiling.mul_f64(rand::thread_rng().gen_range(0.5..=1.0))
    }
}

/// Runs backend operations, retrying transient failures.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Run `operation` until it succeeds, fails permanently, or runs out of
    /// retries.
    ///
    /// Errors for which `Error::is_transient` is false are returned at once.
    /// A transient error that survives every retry becomes
    /// `BackendUnavailable`, so a write is never dropped silently.
    pub async fn execute<F, Fut, T>(&self, operation_name: &str, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retries = 0;
        loop {
            let err = match operation().await {
                Ok(result) => {
                    if retries > 0 {
                        debug!(operation = operation_name, retries, "Operation succeeded after retry");
                    }
                    return Ok(result);
                }
                Err(err) if !err.is_transient() => return Err(err),
                Err(err) => err,
            };

            if retries == self.config.max_retries {
                warn!(
                    operation = operation_name,
                    attempts = retries + 1,
                    error = %err,
                    "Giving up on transient failure"
                );
                return Err(Error::BackendUnavailable(format!(
                    "{} failed after {} attempts: {}",
                    operation_name,
                    retries + 1,
                    err
                )));
            }

            let delay = self.config.backoff(retries);
            retries += 1;
            warn!(
                operation = operation_name,
                retry = retries,
                error = %err,
                delay_ms = delay.as_millis() as u64,
                "Transient failure, retrying"
            );
            sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(max_retries: u32) -> RetryExecutor {
        RetryExecutor::new(RetryConfig::new(
            max_retries,
            Duration::from_millis(1),
            Duration::from_millis(4),
        ))
    }

    #[test]
    fn test_backoff_doubles_within_upper_half() {
        let config = RetryConfig::new(5, Duration::from_millis(100), Duration::from_secs(10));
        for (retry, ceiling) in [(0, 100), (1, 200), (2, 400)] {
            let delay = config.backoff(retry);
            assert!(delay >= Duration::from_millis(ceiling / 2), "{:?}", delay);
            assert!(delay <= Duration::from_millis(ceiling), "{:?}", delay);
        }
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = RetryConfig::new(50, Duration::from_secs(1), Duration::from_secs(10));
        assert!(config.backoff(6) <= Duration::from_secs(10));
        assert!(config.backoff(40) <= Duration::from_secs(10));
        assert!(config.backoff(40) >= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_retry_on_transient_error() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result: Result<i32> = fast(3)
            .execute("put", move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(Error::RateLimited("429".to_string()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result: Result<i32> = fast(3)
            .execute("get", move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(Error::NotFound("missing".to_string()))
                }
            })
            .await;

        assert!(matches!(result, Err(Error::NotFound(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_backend_unavailable() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result: Result<i32> = fast(3)
            .execute("put", move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(Error::Network("connection reset".to_string()))
                }
            })
            .await;

        assert!(matches!(result, Err(Error::BackendUnavailable(_))));
        // Initial + 3 retries
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }
}
