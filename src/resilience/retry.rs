//! # Bounded Retry Policy
//!
//! Capped exponential backoff with a total-deadline ceiling. Only errors reporting
//! [`is_retryable`](crate::error::BatchError::is_retryable) are retried; data-integrity
//! and caller errors are returned on the first occurrence.

use std::future::Future;
use std::time::{Duration, Instant};
use tracing::warn;

use crate::config::BackoffConfig;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    max_attempts: u32,
    total_deadline: Duration,
    /// Upper bound of the random extra delay, as a fraction of the computed delay
    jitter: f64,
}

impl RetryPolicy {
    pub fn from_config(config: &BackoffConfig) -> Self {
        Self {
            initial_delay: config.initial_delay(),
            max_delay: config.max_delay(),
            multiplier: config.multiplier.max(1.0),
            max_attempts: config.max_attempts.max(1),
            total_deadline: config.total_deadline(),
            jitter: if config.jitter_enabled {
                config.jitter_max_percentage.clamp(0.0, 1.0)
            } else {
                0.0
            },
        }
    }

    /// Single attempt, no retry
    pub fn no_retry() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
            max_attempts: 1,
            total_deadline: Duration::ZERO,
            jitter: 0.0,
        }
    }

    /// Fixed small delays, for tests exercising the retry path
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            multiplier: 1.0,
            max_attempts: max_attempts.max(1),
            total_deadline: Duration::from_secs(5),
            jitter: 0.0,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay to wait after the given 1-based attempt failed
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let delay = self
            .initial_delay
            .mul_f64(self.multiplier.powi(exponent).min(f64::from(u32::MAX)));

        let jittered = if self.jitter > 0.0 {
            delay.mul_f64(1.0 + rand::random::<f64>() * self.jitter)
        } else {
            delay
        };

        jittered.min(self.max_delay)
    }

    /// Run `operation`, retrying retryable failures until attempts or deadline run out
    pub async fn run<T, F, Fut>(&self, operation: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let mut attempt = 1;

        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.delay_for_attempt(attempt);
                    if started.elapsed() + delay > self.total_deadline {
                        warn!(
                            operation,
                            attempt,
                            error = %err,
                            "Retry deadline exhausted"
                        );
                        return Err(err);
                    }
                    warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retrying transient failure"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    if err.is_retryable() {
                        warn!(operation, attempt, error = %err, "Retry attempts exhausted");
                    }
                    return Err(err);
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&BackoffConfig::default())
    }
}
