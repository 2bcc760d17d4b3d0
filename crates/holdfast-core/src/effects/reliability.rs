//! Reliability Effects
//!
//! Bounded retry with exponential backoff for remote store calls. Each
//! failure is classified as retryable or fatal; fatal errors surface at once,
//! retryable ones are retried until either the attempt limit or the elapsed
//! budget is reached. Exhaustion returns the last observed error tagged as
//! exhausted rather than inventing a new error.
//!
//! The policy does not make operations idempotent. Callers retrying writes
//! must pass an operation that is safe to run more than once.

use crate::config::duration_ms;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// How a failure should be treated by the retry loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Likely to succeed if tried again later
    Retryable,
    /// Will fail again; surface immediately
    Fatal,
}

/// Errors that know their own retry classification
pub trait RetryClassify {
    fn retry_class(&self) -> RetryClass;
}

/// Final failure of a retried operation
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RetryError<E> {
    /// The operation failed with a non-retryable error
    #[error("fatal: {0}")]
    Fatal(E),

    /// The attempt limit or elapsed budget ran out
    #[error("retries exhausted after {attempts} attempts in {elapsed:?}: {last}")]
    Exhausted {
        /// Attempts performed, including the first
        attempts: u32,
        /// Time spent across all attempts and delays
        elapsed: Duration,
        /// Last observed error
        last: E,
    },
}

impl<E> RetryError<E> {
    /// The underlying error regardless of how the loop ended
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Fatal(e) | RetryError::Exhausted { last: e, .. } => e,
        }
    }

    /// True when the budget ran out on retryable failures
    pub fn is_exhausted(&self) -> bool {
        matches!(self, RetryError::Exhausted { .. })
    }
}

/// Backoff strategy for retry delays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential increase: delay * 2^attempt
    Exponential,
    /// Exponential with up to 10% jitter to avoid synchronized retries
    ExponentialWithJitter,
}

impl BackoffStrategy {
    /// Calculate delay for a given retry number
    ///
    /// # Arguments
    /// - `retry`: Zero-based retry number (0 = first retry)
    /// - `initial_delay`: Base delay duration
    /// - `max_delay`: Maximum delay duration
    pub fn calculate_delay(
        &self,
        retry: u32,
        initial_delay: Duration,
        max_delay: Duration,
    ) -> Duration {
        use rand::Rng;

        let delay = match self {
            BackoffStrategy::Fixed => initial_delay,
            BackoffStrategy::Exponential => {
                initial_delay.saturating_mul(2u32.saturating_pow(retry))
            }
            BackoffStrategy::ExponentialWithJitter => {
                let base_delay = initial_delay.saturating_mul(2u32.saturating_pow(retry));
                let jitter =
                    (base_delay.as_millis() as f64 * 0.1 * rand::thread_rng().gen::<f64>()) as u64;
                base_delay.saturating_add(Duration::from_millis(jitter))
            }
        };

        delay.min(max_delay)
    }
}

/// Retry policy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first (minimum 1)
    pub max_attempts: u32,
    /// Delay before the first retry
    #[serde(with = "duration_ms", rename = "initial_delay_ms")]
    pub initial_delay: Duration,
    /// Upper bound on any single delay
    #[serde(with = "duration_ms", rename = "max_delay_ms")]
    pub max_delay: Duration,
    /// Elapsed-time budget; no retry starts that would end past it
    #[serde(with = "duration_ms", rename = "max_elapsed_ms")]
    pub max_elapsed: Duration,
    /// Backoff strategy to use
    pub strategy: BackoffStrategy,
}

impl RetryPolicy {
    /// Exponential backoff with jitter over a thirty second budget
    pub fn exponential() -> Self {
        Self {
            max_attempts: 6,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            max_elapsed: Duration::from_secs(30),
            strategy: BackoffStrategy::ExponentialWithJitter,
        }
    }

    /// Retry policy with a fixed delay
    pub fn fixed(delay: Duration) -> Self {
        Self {
            max_attempts: 3,
            initial_delay: delay,
            max_delay: delay,
            max_elapsed: Duration::from_secs(30),
            strategy: BackoffStrategy::Fixed,
        }
    }

    /// Single attempt, no retries
    pub fn none() -> Self {
        Self::fixed(Duration::ZERO).with_max_attempts(1)
    }

    /// Set maximum attempts
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set initial delay
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the elapsed-time budget
    pub fn with_max_elapsed(mut self, budget: Duration) -> Self {
        self.max_elapsed = budget;
        self
    }

    /// Enable or disable jitter
    pub fn with_jitter(mut self, enable: bool) -> Self {
        self.strategy = match (enable, self.strategy) {
            (true, BackoffStrategy::Exponential) => BackoffStrategy::ExponentialWithJitter,
            (false, BackoffStrategy::ExponentialWithJitter) => BackoffStrategy::Exponential,
            (_, strategy) => strategy,
        };
        self
    }

    /// Calculate delay for a specific retry
    pub fn calculate_delay(&self, retry: u32) -> Duration {
        self.strategy
            .calculate_delay(retry, self.initial_delay, self.max_delay)
    }

    /// Execute an operation, classifying failures through the error type
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: RetryClassify + std::fmt::Display,
    {
        self.execute_classified(operation, E::retry_class).await
    }

    /// Execute an operation with an explicit failure classifier
    pub async fn execute_classified<F, Fut, T, E, C>(
        &self,
        mut operation: F,
        classify: C,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> RetryClass,
        E: std::fmt::Display,
    {
        let start = tokio::time::Instant::now();
        let max_attempts = self.max_attempts.max(1);
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let err = match operation().await {
                Ok(result) => return Ok(result),
                Err(err) => err,
            };

            if classify(&err) == RetryClass::Fatal {
                return Err(RetryError::Fatal(err));
            }

            let elapsed = start.elapsed();
            let delay = self.calculate_delay(attempts - 1);
            if attempts >= max_attempts || elapsed.saturating_add(delay) > self.max_elapsed {
                tracing::warn!(
                    attempts,
                    elapsed_ms = elapsed.as_millis() as u64,
                    error = %err,
                    "Retry budget exhausted"
                );
                return Err(RetryError::Exhausted {
                    attempts,
                    elapsed,
                    last: err,
                });
            }

            tracing::debug!(
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Retrying after transient failure"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effects::StoreError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(attempts: u32) -> RetryPolicy {
        RetryPolicy::fixed(Duration::from_millis(10)).with_max_attempts(attempts)
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_below_limit_succeed() {
        let calls = AtomicU32::new(0);
        let result = fast_policy(5)
            .execute(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 3 {
                        Err(StoreError::throttled("k"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast_policy(5)
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(StoreError::backend("bad")) }
            })
            .await;

        assert_eq!(result, Err(RetryError::Fatal(StoreError::backend("bad"))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_limit_surfaces_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast_policy(3)
            .execute(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move { Err(StoreError::timeout(format!("k{n}"))) }
            })
            .await;

        match result {
            Err(RetryError::Exhausted { attempts, last, .. }) => {
                assert_eq!(attempts, 3);
                assert_eq!(last, StoreError::timeout("k2"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn elapsed_budget_stops_before_attempt_limit() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::fixed(Duration::from_secs(4))
            .with_max_attempts(100)
            .with_max_elapsed(Duration::from_secs(10));
        let result: Result<(), _> = policy
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(StoreError::unavailable("down")) }
            })
            .await;

        assert!(result.unwrap_err().is_exhausted());
        // Attempts at t=0, 4, 8; a retry at 12 would overrun the budget
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn exponential_delay_is_capped() {
        let policy = RetryPolicy::exponential().with_jitter(false);
        assert_eq!(policy.calculate_delay(0), Duration::from_millis(500));
        assert_eq!(policy.calculate_delay(2), Duration::from_secs(2));
        assert_eq!(policy.calculate_delay(10), Duration::from_secs(8));
    }
}
