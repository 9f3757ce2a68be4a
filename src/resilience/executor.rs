//! Guarded execution: breaker, cache and retry composed behind one call
//!
//! ```text
//! execute_guarded
//!       │
//!       ▼
//! [breaker open?] ──yes──▶ CircuitOpen (trip counted, backend untouched)
//!       │ no (open + cool-down elapsed ⇒ half-open)
//!       ▼
//! [fresh cache entry?] ──yes──▶ value (cache hit, breaker success)
//!       │ no
//!       ▼
//! [retry executor, per-attempt timeout]
//!       │
//!   ok ─┴─ err
//!   │       └─▶ breaker failure, error propagated
//!   └─▶ cache store, breaker success, response time recorded
//! ```
//!
//! One executor is meant to be shared (behind an `Arc`) by every caller of a
//! backend in the process.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::cache::{CacheConfig, ResultCache};
use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStatus, CircuitState};
use super::metrics::{ExecutorMetrics, PerformanceMetrics};
use super::retry::{RetryExecutor, RetryPolicy};
use crate::error::{ExecutorError, FailureKind, OperationError};

type CachedValue = Arc<dyn Any + Send + Sync>;

/// Executor-wide settings
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Per-attempt timeout when a call does not specify one
    pub default_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
        }
    }
}

/// Per-call options
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Cache key; `Some` makes the call cacheable
    pub cache_key: Option<String>,
    /// Per-attempt timeout override
    pub timeout: Option<Duration>,
    /// Caller cancellation
    pub cancellation: Option<CancellationToken>,
}

impl ExecuteOptions {
    /// Uncached call with default timeout
    pub fn new() -> Self {
        Self::default()
    }

    /// Cacheable call under `key`
    pub fn cached(key: impl Into<String>) -> Self {
        Self {
            cache_key: Some(key.into()),
            ..Self::default()
        }
    }

    /// Override the per-attempt timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Attach a caller cancellation token
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

/// Breaker + cache + retry façade over a single logical backend.
#[derive(Debug)]
pub struct ResilientExecutor {
    breaker: CircuitBreaker,
    retry: RetryExecutor,
    cache: Mutex<ResultCache<CachedValue>>,
    metrics: ExecutorMetrics,
    config: ExecutorConfig,
}

impl Default for ResilientExecutor {
    fn default() -> Self {
        Self::new(
            CircuitBreakerConfig::default(),
            RetryPolicy::default(),
            CacheConfig::default(),
            ExecutorConfig::default(),
        )
    }
}

impl ResilientExecutor {
    /// Build an executor with a process-local breaker
    pub fn new(
        breaker: CircuitBreakerConfig,
        retry: RetryPolicy,
        cache: CacheConfig,
        config: ExecutorConfig,
    ) -> Self {
        Self::with_breaker(CircuitBreaker::new(breaker), retry, cache, config)
    }

    /// Build an executor around an existing breaker (e.g. one with a shared state backend)
    pub fn with_breaker(
        breaker: CircuitBreaker,
        retry: RetryPolicy,
        cache: CacheConfig,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            breaker,
            retry: RetryExecutor::new(retry),
            cache: Mutex::new(ResultCache::new(cache)),
            metrics: ExecutorMetrics::new(),
            config,
        }
    }

    /// Build from the aggregated crate configuration
    pub fn from_config(config: &crate::config::ResilienceConfig) -> Self {
        Self::new(
            config.breaker.clone(),
            config.retry.clone(),
            config.cache.clone(),
            config.executor.clone(),
        )
    }

    /// Run `op` behind the breaker, the cache and the retry policy.
    ///
    /// `op` is invoked once per attempt with a token that is cancelled when
    /// the attempt times out or the caller cancels.
    pub async fn execute_guarded<T, F, Fut>(
        &self,
        op: F,
        options: ExecuteOptions,
    ) -> Result<T, ExecutorError>
    where
        T: Clone + Send + Sync + 'static,
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, OperationError>>,
    {
        self.metrics.record_request();

        if let Err(retry_in) = self.breaker.try_acquire() {
            self.metrics.record_trip();
            self.metrics.record_failure();
            debug!(
                retry_in_ms = retry_in.as_millis() as u64,
                "Rejected by open circuit breaker"
            );
            return Err(ExecutorError::CircuitOpen { retry_in });
        }

        if let Some(key) = options.cache_key.as_deref() {
            if let Some(value) = self.cached::<T>(key) {
                self.metrics.record_cache_hit();
                self.breaker.record_success();
                debug!(cache_key = key, "Cache hit");
                return Ok(value);
            }
        }

        let timeout = options.timeout.unwrap_or(self.config.default_timeout);
        let cancel = options.cancellation.unwrap_or_else(CancellationToken::new);
        let started = Instant::now();

        let result = self
            .retry
            .run(op, timeout, &cancel, |_, err| {
                if err.kind == FailureKind::RateLimited {
                    self.metrics.record_rate_limit();
                }
            })
            .await;

        match result {
            Ok(value) => {
                if let Some(key) = options.cache_key {
                    self.cache
                        .lock()
                        .insert(key, Arc::new(value.clone()) as CachedValue);
                }
                self.breaker.record_success();
                self.metrics.record_success(started.elapsed());
                Ok(value)
            }
            Err(ExecutorError::Cancelled) => {
                self.metrics.record_failure();
                Err(ExecutorError::Cancelled)
            }
            Err(err) => {
                self.breaker.record_failure();
                self.metrics.record_failure();
                Err(err)
            }
        }
    }

    fn cached<T: Clone + 'static>(&self, key: &str) -> Option<T> {
        let value = self.cache.lock().get(key)?;
        value.downcast_ref::<T>().cloned()
    }

    /// Metrics snapshot including breaker state
    pub fn metrics(&self) -> PerformanceMetrics {
        self.metrics.snapshot_with_state(self.breaker.state())
    }

    /// Prometheus text rendering of the metrics
    pub fn metrics_prometheus(&self) -> String {
        self.metrics.to_prometheus_format(self.breaker.state())
    }

    /// Breaker status for operators
    pub fn circuit_breaker_status(&self) -> CircuitBreakerStatus {
        self.breaker.status()
    }

    /// Current breaker state
    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    /// Force the breaker closed
    pub fn reset_circuit_breaker(&self) {
        self.breaker.reset();
    }

    /// Drop every cached result
    pub fn clear_cache(&self) {
        self.cache.lock().clear();
    }

    /// Drop cached results past their TTL
    pub fn purge_expired_cache(&self) -> usize {
        self.cache.lock().purge_expired()
    }

    /// Number of cached results
    pub fn cache_len(&self) -> usize {
        self.cache.lock().len()
    }

    /// Zero the performance counters
    pub fn reset_metrics(&self) {
        self.metrics.reset();
    }
}
