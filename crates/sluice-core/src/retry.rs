//! Bounded retry with multiplicative backoff for upstream calls.
//!
//! [`RetryingUpstream`] is the single retry boundary of the engine: resources
//! and the deferred task engine never loop on failures themselves.

use std::future::Future;
use std::time::Duration;

use crate::error::AppError;
use crate::traits::Upstream;

/// Retry configuration.
///
/// Delay schedule: `initial_delay`, then multiplied by `backoff_factor`
/// after each failed attempt, capped at `max_delay`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    /// 10 attempts starting at 1s with a 1.1 factor.
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_secs(1),
            backoff_factor: 1.1,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration, backoff_factor: f64) -> Self {
        Self {
            max_attempts,
            initial_delay,
            backoff_factor,
            ..Self::default()
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Single attempt, no sleeping.
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO, 1.0)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.max_attempts == 0 {
            return Err(AppError::ConfigError(
                "retry max_attempts must be at least 1".into(),
            ));
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(AppError::ConfigError(format!(
                "retry backoff_factor must be a finite number >= 1.0, got {}",
                self.backoff_factor
            )));
        }
        Ok(())
    }

    /// Delay to sleep after the given failed attempt (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let seconds = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        let capped = seconds.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped > 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            Duration::ZERO
        }
    }

    /// Run `op` until it succeeds, fails permanently, or the attempt budget runs out.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, AppError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => {
                    if attempt >= max_attempts {
                        return Err(AppError::ExhaustedRetries {
                            attempts: attempt,
                            last: Box::new(e),
                        });
                    }
                    let delay = self.delay_for_attempt(attempt);
                    tracing::warn!(
                        attempt,
                        max_attempts,
                        delay_ms = %delay.as_millis(),
                        error = %e,
                        "Transient upstream failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// An [`Upstream`] wrapper that retries transient failures per [`RetryPolicy`].
#[derive(Clone)]
pub struct RetryingUpstream<U> {
    inner: U,
    policy: RetryPolicy,
}

impl<U: Upstream> RetryingUpstream<U> {
    pub fn new(inner: U, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

impl<U: Upstream> Upstream for RetryingUpstream<U> {
    async fn fetch(&self, url: &str) -> Result<serde_json::Value, AppError> {
        self.policy.run(|| self.inner.fetch(url)).await
    }
}
