//! Bounded retry with exponential backoff and jitter
//!
//! Every provider call in the pipeline goes through a [`RetryExecutor`]. The
//! caller supplies the retryability predicate and decides what to do with the
//! error left over once attempts run out.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{error, warn};

use crate::error::{CategorizerError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first call, at least 1
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound on a single attempt
    pub attempt_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(10),
            attempt_timeout: Some(Duration::from_secs(30)),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Run `operation` with the default transient-error predicate
    pub async fn run<T, F, Fut>(&self, operation_name: &str, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute(operation_name, operation, CategorizerError::is_transient)
            .await
    }

    /// Run `operation` until it succeeds, fails with an error `is_retryable`
    /// rejects, or `max_attempts` calls have been made
    pub async fn execute<T, F, Fut, P>(
        &self,
        operation_name: &str,
        mut operation: F,
        is_retryable: P,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        P: Fn(&CategorizerError) -> bool,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let outcome = match self.policy.attempt_timeout {
                Some(limit) => match tokio::time::timeout(limit, operation()).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(CategorizerError::NetworkError(format!(
                        "{} timed out after {:?}",
                        operation_name, limit
                    ))),
                },
                None => operation().await,
            };

            let err = match outcome {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if !is_retryable(&err) {
                return Err(err);
            }
            if attempt >= max_attempts {
                error!(
                    "{} failed after {} attempts: {}",
                    operation_name, attempt, err
                );
                return Err(err);
            }

            let delay = self.delay_for(attempt, self.jitter(), err.retry_after());
            warn!(
                "{} failed (attempt {}/{}): {}. Retrying in {:?}...",
                operation_name, attempt, max_attempts, err, delay
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Delay before the retry that follows failed attempt `attempt` (1-based):
    /// `base * 2^(attempt-1) + jitter`, raised to `retry_after` when given,
    /// capped at `max_delay`
    pub fn delay_for(&self, attempt: u32, jitter: Duration, retry_after: Option<Duration>) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let backoff = self
            .policy
            .base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.policy.max_delay)
            .saturating_add(jitter);
        let wanted = match retry_after {
            Some(hint) => backoff.max(hint),
            None => backoff,
        };
        wanted.min(self.policy.max_delay)
    }

    /// Random jitter in `[0, base_delay)`
    fn jitter(&self) -> Duration {
        let base_ms = self.policy.base_delay.as_millis() as u64;
        if base_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..base_ms))
    }
}
