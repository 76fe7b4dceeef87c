//! Retry with exponential backoff and deadline wrapping for sync tasks.
//!
//! Synchronizers never retry or time out on their own; callers layer these
//! utilities around them.

use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use skysync_common::{Error, Result};

/// Exponential backoff parameters.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts made after the first failure.
    pub max_retries: u32,
    pub initial_delay: Duration,
    /// Cap on the exponential growth.
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl RetryConfig {
    /// Backoff starting at one second, doubling up to a minute, with jitter.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retry number `attempt` (zero-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let millis = (self.initial_delay.as_millis() as f64
            * self.backoff_multiplier.powi(exponent))
        .min(self.max_delay.as_millis() as f64);

        let millis = if self.jitter {
            // +/- 25%
            millis * (0.75 + rand::random::<f64>() * 0.5)
        } else {
            millis
        };
        Duration::from_millis(millis as u64)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Re-runs a fallible async operation with backoff between attempts.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Retry only errors that [`Error::is_transient`] classifies as retryable.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_with_condition(operation, Error::is_transient)
            .await
    }

    /// Retry whenever `should_retry` accepts the error, up to `max_retries`
    /// additional attempts. The most recent error is returned once attempts
    /// run out.
    pub async fn execute_with_condition<F, Fut, T, C>(
        &self,
        operation: F,
        should_retry: C,
    ) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
        C: Fn(&Error) -> bool,
    {
        let mut retries = 0;
        loop {
            let err = match operation().await {
                Ok(value) => {
                    if retries > 0 {
                        debug!(retries, "operation recovered after retrying");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !should_retry(&err) {
                return Err(err);
            }
            if retries >= self.config.max_retries {
                warn!(attempts = retries + 1, error = %err, "giving up after retries");
                return Err(err);
            }

            let delay = self.config.delay_for_attempt(retries);
            retries += 1;
            warn!(attempt = retries, error = %err, ?delay, "attempt failed, backing off");
            sleep(delay).await;
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}

/// Run `operation`, failing with [`Error::Timeout`] if it exceeds `limit`.
///
/// With no limit the operation runs to completion.
pub async fn with_timeout<Fut, T>(limit: Option<Duration>, operation: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match limit {
        Some(limit) => timeout(limit, operation)
            .await
            .map_err(|_| Error::Timeout(format!("no result within {:?}", limit)))?,
        None => operation.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn quick(max_retries: u32) -> RetryExecutor {
        RetryExecutor::new(
            RetryConfig::new(max_retries)
                .with_initial_delay(Duration::from_millis(1))
                .with_jitter(false),
        )
    }

    /// Fail with `make()` on the first attempt, then succeed.
    async fn attempts_until_success(
        executor: &RetryExecutor,
        make: fn() -> Error,
    ) -> (Result<u8>, u32) {
        let attempts = Arc::new(AtomicU32::new(0));
        let result = executor
            .execute(|| {
                let attempts = attempts.clone();
                async move {
                    if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(make())
                    } else {
                        Ok(1)
                    }
                }
            })
            .await;
        (result, attempts.load(Ordering::SeqCst))
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let transient: [fn() -> Error; 4] = [
            || Error::Remote("503".to_string()),
            || Error::Timeout("slow".to_string()),
            || Error::Offline,
            || Error::Io(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
        ];
        for make in transient {
            let (result, attempts) = attempts_until_success(&quick(1), make).await;
            assert_eq!(result.unwrap(), 1, "{}", make());
            assert_eq!(attempts, 2, "{}", make());
        }
    }

    #[tokio::test]
    async fn test_permanent_errors_fail_fast() {
        let permanent: [fn() -> Error; 6] = [
            || Error::Storage("disk full".to_string()),
            || Error::Serialization("bad json".to_string()),
            || Error::InvalidInput("empty key".to_string()),
            || Error::NotFound("prefs".to_string()),
            || Error::SyncInProgress,
            || Error::SchedulerStopped,
        ];
        for make in permanent {
            let (result, attempts) = attempts_until_success(&quick(3), make).await;
            assert_eq!(result.unwrap_err().to_string(), make().to_string());
            assert_eq!(attempts, 1, "{}", make());
        }
    }

    #[test]
    fn test_jitter_stays_within_a_quarter() {
        let config = RetryConfig::new(1).with_initial_delay(Duration::from_millis(400));
        for _ in 0..200 {
            let delay = config.delay_for_attempt(1);
            assert!(delay >= Duration::from_millis(600), "{:?}", delay);
            assert!(delay <= Duration::from_millis(1000), "{:?}", delay);
        }
    }

    #[test]
    fn test_huge_attempt_number_hits_cap() {
        let config = RetryConfig::new(1)
            .with_max_delay(Duration::from_secs(5))
            .with_jitter(false);
        assert_eq!(config.delay_for_attempt(u32::MAX), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_grows_between_attempts() {
        let started = Arc::new(std::sync::Mutex::new(Vec::new()));
        let executor = RetryExecutor::new(
            RetryConfig::new(2)
                .with_initial_delay(Duration::from_millis(100))
                .with_backoff_multiplier(3.0)
                .with_jitter(false),
        );

        let result: Result<()> = executor
            .execute(|| {
                let started = started.clone();
                async move {
                    started.lock().unwrap().push(tokio::time::Instant::now());
                    Err(Error::Offline)
                }
            })
            .await;

        assert!(matches!(result, Err(Error::Offline)));
        let started = started.lock().unwrap();
        assert_eq!(started.len(), 3);
        assert_eq!(started[1] - started[0], Duration::from_millis(100));
        assert_eq!(started[2] - started[1], Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_attempt_is_retried() {
        let attempts = Arc::new(AtomicU32::new(0));

        let result = quick(2)
            .execute(|| {
                let attempts = attempts.clone();
                with_timeout(Some(Duration::from_millis(50)), async move {
                    if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                        sleep(Duration::from_secs(10)).await;
                    }
                    Ok("done")
                })
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_attempt_timing_out_reports_timeout() {
        let attempts = Arc::new(AtomicU32::new(0));

        let result: Result<()> = quick(2)
            .execute(|| {
                let attempts = attempts.clone();
                with_timeout(Some(Duration::from_millis(50)), async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    sleep(Duration::from_secs(10)).await;
                    Ok(())
                })
            })
            .await;

        assert!(matches!(result, Err(Error::Timeout(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_zero_retries_runs_once() {
        let attempt_count = Arc::new(AtomicU32::new(0));
        let count_clone = attempt_count.clone();
        let executor = RetryExecutor::new(RetryConfig::new(0));

        let result: Result<i32> = executor
            .execute(move || {
                let count = count_clone.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Err(Error::Offline)
                }
            })
            .await;

        assert!(matches!(result, Err(Error::Offline)));
        assert_eq!(attempt_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_custom_retry_condition() {
        let attempt_count = Arc::new(AtomicU32::new(0));
        let count_clone = attempt_count.clone();

        let executor = RetryExecutor::new(
            RetryConfig::new(2).with_initial_delay(Duration::from_millis(1)),
        );

        let result: Result<i32> = executor
            .execute_with_condition(
                move || {
                    let count = count_clone.clone();
                    async move {
                        count.fetch_add(1, Ordering::SeqCst);
                        Err(Error::Storage("disk busy".to_string()))
                    }
                },
                |err| matches!(err, Error::Storage(_)),
            )
            .await;

        assert!(result.is_err());
        assert_eq!(attempt_count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_expires() {
        let result: Result<()> = with_timeout(Some(Duration::from_millis(50)), async {
            sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(Error::Timeout(_))));
        assert!(result.unwrap_err().is_transient());
    }

    #[tokio::test]
    async fn test_with_timeout_passes_through() {
        let value = with_timeout(Some(Duration::from_secs(1)), async { Ok(7) }).await;
        assert_eq!(value.unwrap(), 7);

        let value = with_timeout(None, async { Ok("unbounded") }).await;
        assert_eq!(value.unwrap(), "unbounded");
    }
}
