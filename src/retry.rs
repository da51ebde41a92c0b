//! # Retry Policy
//!
//! Bounded exponential backoff around a fallible async operation.
//!
//! After a failed attempt the policy sleeps `min(delay, max_delay)`, multiplies the delay
//! by the backoff factor, and tries again. Once the final attempt fails it returns a
//! [`RetryError`] carrying the attempt count and the last underlying cause.
//!
//! Used around image pulls, container starts and health polling. Commands are never
//! retried: they run exactly once.

use crate::config::RetrySettings;
use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Always at least 1.
    pub attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
        }
    }
}

/// Attempts were exhausted. `source` is the failure of the last attempt.
#[derive(Debug, thiserror::Error)]
#[error("{operation} failed after {attempts} attempts: {source}")]
pub struct RetryError<E: std::error::Error + 'static> {
    pub operation: String,
    pub attempts: u32,
    #[source]
    pub source: E,
}

impl<E: std::error::Error + 'static> RetryError<E> {
    pub fn into_cause(self) -> E {
        self.source
    }
}

impl<E> From<RetryError<E>> for EngineError
where
    E: std::error::Error + Into<EngineError> + 'static,
{
    fn from(err: RetryError<E>) -> Self {
        EngineError::Retry {
            operation: err.operation,
            attempts: err.attempts,
            cause: Box::new(err.source.into()),
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, initial_delay: Duration, max_delay: Duration, backoff_factor: f64) -> Self {
        Self {
            attempts: attempts.max(1),
            initial_delay,
            max_delay,
            backoff_factor,
        }
    }

    /// Fixed interval between attempts, used for health polling
    pub fn constant(attempts: u32, interval: Duration) -> Self {
        Self::new(attempts, interval, interval, 1.0)
    }

    /// Single attempt, no waiting
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO, 1.0)
    }

    /// The sleep preceding each retry, in order
    pub fn delays(&self) -> Vec<Duration> {
        let mut delays = Vec::with_capacity(self.attempts.saturating_sub(1) as usize);
        let mut delay = self.initial_delay;
        for _ in 1..self.attempts.max(1) {
            delays.push(delay.min(self.max_delay));
            delay = delay.mul_f64(self.backoff_factor.max(1.0)).min(self.max_delay);
        }
        delays
    }

    /// Run `operation` until it succeeds or attempts are exhausted
    pub async fn run<T, E, F, Fut>(&self, operation: &str, op: F) -> Result<T, RetryError<E>>
    where
        E: std::error::Error + 'static,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run_if(operation, |_| true, op).await
    }

    /// Like [`RetryPolicy::run`], but stops early when `should_retry` rejects an error.
    /// The early failure is still reported as a `RetryError` with the attempts made so far.
    pub async fn run_if<T, E, F, Fut, P>(
        &self,
        operation: &str,
        should_retry: P,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        E: std::error::Error + 'static,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        let attempts = self.attempts.max(1);
        let mut delays = self.delays().into_iter();
        let mut attempt = 1;

        loop {
            match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation, attempt, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if attempt < attempts && should_retry(&err) => {
                    let delay = delays.next().unwrap_or(self.max_delay);
                    warn!(
                        operation,
                        attempt,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Attempt failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    return Err(RetryError {
                        operation: operation.to_string(),
                        attempts: attempt,
                        source: err,
                    });
                }
            }
        }
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self::new(
            settings.attempts,
            Duration::from_millis(settings.initial_delay_ms),
            Duration::from_millis(settings.max_delay_ms),
            settings.backoff_factor,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Debug, thiserror::Error)]
    #[error("boom #{0}")]
    struct Boom(u32);

    #[test]
    fn test_delay_schedule_is_capped() {
        let policy = RetryPolicy::new(
            5,
            Duration::from_millis(100),
            Duration::from_millis(300),
            2.0,
        );
        assert_eq!(
            policy.delays(),
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(300),
                Duration::from_millis(300),
            ]
        );
        assert!(RetryPolicy::none().delays().is_empty());
    }

    #[test]
    fn test_zero_attempts_clamped_to_one() {
        let policy = RetryPolicy::new(0, Duration::ZERO, Duration::ZERO, 2.0);
        assert_eq!(policy.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_operation_runs_exactly_attempts_times() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(3, Duration::from_millis(10), Duration::from_secs(1), 2.0);

        let counter = calls.clone();
        let result: Result<(), _> = policy
            .run("pull image", move |_| {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                async move { Err(Boom(n)) }
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(err.attempts, 3);
        assert_eq!(err.source.0, 3);
        assert_eq!(err.operation, "pull image");
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let policy = RetryPolicy::new(4, Duration::from_millis(10), Duration::from_secs(1), 2.0);
        let start = tokio::time::Instant::now();

        let result = policy
            .run("start container", |attempt| async move {
                if attempt < 3 {
                    Err(Boom(attempt))
                } else {
                    Ok(attempt)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        // 10ms + 20ms of backoff on the paused clock
        assert_eq!(start.elapsed(), Duration::from_millis(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_stops_early() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(5, Duration::from_millis(10), Duration::from_secs(1), 2.0);

        let counter = calls.clone();
        let err = policy
            .run_if(
                "inspect",
                |e: &Boom| e.0 != 2,
                move |_| {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    async move { Err::<(), _>(Boom(n)) }
                },
            )
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(err.attempts, 2);
    }
}
