//! Retry with exponential backoff and jitter
//!
//! Each attempt races the operation against a per-attempt deadline. The
//! operation receives a [`CancellationToken`] that is cancelled when its
//! deadline passes or the caller gives up, so long-running work can stop
//! instead of running on unobserved.
//!
//! Only errors whose [`FailureKind`](crate::error::FailureKind) is transient
//! are retried. Delay before retry `n` (0-indexed) is
//! `min(base * 2^n, max) * (1 + U[0, jitter])`, capped again at `max`.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ExecutorError, OperationError};

/// Backoff policy
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Maximum fraction added on top of the exponential delay
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            jitter: 0.3,
        }
    }
}

impl RetryPolicy {
    /// Set the retry count
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set base and maximum delay
    pub fn with_delays(mut self, base: Duration, max: Duration) -> Self {
        self.base_delay = base;
        self.max_delay = max;
        self
    }

    /// Set the jitter fraction
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Exponential delay before retry `retry`, without jitter
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Delay before retry `retry` for a given jitter sample in `[0, 1]`
    pub fn delay_with_sample(&self, retry: u32, sample: f64) -> Duration {
        let jittered = self
            .backoff(retry)
            .mul_f64(1.0 + self.jitter * sample.clamp(0.0, 1.0));
        jittered.min(self.max_delay)
    }

    /// Delay before retry `retry` with random jitter
    pub fn delay_for(&self, retry: u32) -> Duration {
        let sample: f64 = rand::rng().random_range(0.0..=1.0);
        self.delay_with_sample(retry, sample)
    }
}

/// Runs an operation under a [`RetryPolicy`]
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    /// Create an executor for a policy
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// The policy in use
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `op` until it succeeds, fails permanently or retries run out.
    ///
    /// `observe` sees every failed attempt (0-indexed) before the retry
    /// decision is made.
    pub async fn run<T, F, Fut, O>(
        &self,
        mut op: F,
        timeout: Duration,
        cancel: &CancellationToken,
        mut observe: O,
    ) -> Result<T, ExecutorError>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, OperationError>>,
        O: FnMut(u32, &OperationError),
    {
        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(ExecutorError::Cancelled);
            }

            let attempt_token = cancel.child_token();
            let fut = op(attempt_token.clone());

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    attempt_token.cancel();
                    return Err(ExecutorError::Cancelled);
                }
                res = tokio::time::timeout(timeout, fut) => res,
            };

            let (err, deadline_hit) = match outcome {
                Ok(Ok(value)) => {
                    if attempt > 0 {
                        debug!(attempts = attempt + 1, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Ok(Err(err)) => (err, false),
                Err(_) => {
                    attempt_token.cancel();
                    (OperationError::timeout(timeout), true)
                }
            };

            observe(attempt, &err);

            if !err.is_retryable() {
                debug!(kind = %err.kind, error = %err.message, "Non-retryable failure");
                return Err(err.into());
            }

            if attempt >= self.policy.max_retries {
                warn!(
                    attempts = attempt + 1,
                    kind = %err.kind,
                    error = %err.message,
                    "Retries exhausted"
                );
                return Err(if deadline_hit {
                    ExecutorError::Timeout {
                        timeout,
                        attempts: attempt + 1,
                    }
                } else {
                    err.into()
                });
            }

            let delay = self.policy.delay_for(attempt);
            warn!(
                attempt = attempt + 1,
                max_retries = self.policy.max_retries,
                delay_ms = delay.as_millis() as u64,
                kind = %err.kind,
                error = %err.message,
                "Transient failure, retrying"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ExecutorError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}
