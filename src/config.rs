//! Configuration
//!
//! [`ResilienceConfig`] aggregates every tunable of the crate. Values come
//! from defaults, overridden by `BILLING_RESILIENCE_*` environment variables.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `BILLING_RESILIENCE_FAILURE_THRESHOLD` | 5 |
//! | `BILLING_RESILIENCE_SUCCESS_THRESHOLD` | 2 |
//! | `BILLING_RESILIENCE_OPEN_RETRY_DELAY_SECS` | 60 |
//! | `BILLING_RESILIENCE_MAX_RETRIES` | 3 |
//! | `BILLING_RESILIENCE_BASE_DELAY_MS` | 1000 |
//! | `BILLING_RESILIENCE_MAX_DELAY_MS` | 10000 |
//! | `BILLING_RESILIENCE_CACHE_TTL_SECS` | 300 |
//! | `BILLING_RESILIENCE_CACHE_MAX_ENTRIES` | 1000 |
//! | `BILLING_RESILIENCE_TIMEOUT_MS` | 30000 |
//! | `BILLING_RESILIENCE_DLQ_BATCH_SIZE` | 50 |
//! | `BILLING_RESILIENCE_DLQ_MAX_RETRIES` | 3 |
//! | `BILLING_RESILIENCE_DLQ_STALE_AFTER_HOURS` | 168 |
//! | `BILLING_RESILIENCE_DLQ_POLL_INTERVAL_SECS` | 30 |
//! | `BILLING_RESILIENCE_HEALTH_INTERVAL_SECS` | 60 |
//! | `BILLING_RESILIENCE_ERROR_RATE_THRESHOLD` | 0.10 |
//! | `BILLING_RESILIENCE_LOCK_TIMEOUT_MS` | 5000 |

use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::health::HealthConfig;
use crate::resilience::{CacheConfig, CircuitBreakerConfig, ExecutorConfig, RetryPolicy};
use crate::subscription::UpdaterConfig;
use crate::webhook::DlqConfig;

const PREFIX: &str = "BILLING_RESILIENCE_";

/// Every tunable of the crate
#[derive(Debug, Clone, Default)]
pub struct ResilienceConfig {
    /// Circuit breaker thresholds
    pub breaker: CircuitBreakerConfig,
    /// Retry backoff
    pub retry: RetryPolicy,
    /// Result cache sizing
    pub cache: CacheConfig,
    /// Executor defaults
    pub executor: ExecutorConfig,
    /// Dead-letter queue and retry processor
    pub dlq: DlqConfig,
    /// Health monitor thresholds
    pub health: HealthConfig,
    /// Subscription updater
    pub updater: UpdaterConfig,
}

impl ResilienceConfig {
    /// Defaults overridden by `BILLING_RESILIENCE_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable name
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars { lookup };
        let mut config = Self::default();

        if let Some(v) = vars.parse("FAILURE_THRESHOLD")? {
            config.breaker.failure_threshold = v;
        }
        if let Some(v) = vars.parse("SUCCESS_THRESHOLD")? {
            config.breaker.success_threshold = v;
        }
        if let Some(v) = vars.secs("OPEN_RETRY_DELAY_SECS")? {
            config.breaker.open_retry_delay = v;
        }
        if let Some(v) = vars.parse("MAX_RETRIES")? {
            config.retry.max_retries = v;
        }
        if let Some(v) = vars.millis("BASE_DELAY_MS")? {
            config.retry.base_delay = v;
        }
        if let Some(v) = vars.millis("MAX_DELAY_MS")? {
            config.retry.max_delay = v;
        }
        if let Some(v) = vars.secs("CACHE_TTL_SECS")? {
            config.cache.ttl = v;
        }
        if let Some(v) = vars.parse("CACHE_MAX_ENTRIES")? {
            config.cache.max_entries = v;
        }
        if let Some(v) = vars.millis("TIMEOUT_MS")? {
            config.executor.default_timeout = v;
        }
        if let Some(v) = vars.parse("DLQ_BATCH_SIZE")? {
            config.dlq.batch_size = v;
        }
        if let Some(v) = vars.parse("DLQ_MAX_RETRIES")? {
            config.dlq.max_retries = v;
        }
        if let Some(hours) = vars.parse::<u64>("DLQ_STALE_AFTER_HOURS")? {
            config.dlq.stale_after = Duration::from_secs(hours.saturating_mul(3600));
        }
        if let Some(v) = vars.secs("DLQ_POLL_INTERVAL_SECS")? {
            config.dlq.poll_interval = v;
        }
        if let Some(v) = vars.secs("HEALTH_INTERVAL_SECS")? {
            config.health.interval = v;
        }
        if let Some(v) = vars.parse("ERROR_RATE_THRESHOLD")? {
            config.health.error_rate_threshold = v;
        }
        if let Some(v) = vars.millis("LOCK_TIMEOUT_MS")? {
            config.updater.lock_timeout = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.breaker.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "failure threshold must be at least 1".to_string(),
            ));
        }
        if self.breaker.success_threshold == 0 {
            return Err(ConfigError::Invalid(
                "success threshold must be at least 1".to_string(),
            ));
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err(ConfigError::Invalid(format!(
                "base delay {:?} exceeds max delay {:?}",
                self.retry.base_delay, self.retry.max_delay
            )));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(ConfigError::Invalid("jitter must be within 0..=1".to_string()));
        }
        if self.cache.max_entries == 0 {
            return Err(ConfigError::Invalid(
                "cache must hold at least one entry".to_string(),
            ));
        }
        if self.executor.default_timeout.is_zero() {
            return Err(ConfigError::Invalid("timeout must be positive".to_string()));
        }
        if self.dlq.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "DLQ batch size must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.health.error_rate_threshold) {
            return Err(ConfigError::Invalid(
                "error rate threshold must be within 0..=1".to_string(),
            ));
        }
        Ok(())
    }

    /// Configuration with short timings for tests
    pub fn test_config() -> Self {
        Self {
            breaker: CircuitBreakerConfig::default().with_open_retry_delay(Duration::from_millis(100)),
            retry: RetryPolicy::default()
                .with_delays(Duration::from_millis(1), Duration::from_millis(10)),
            cache: CacheConfig::default().with_ttl(Duration::from_millis(500)),
            executor: ExecutorConfig {
                default_timeout: Duration::from_millis(200),
            },
            dlq: DlqConfig::default()
                .with_batch_size(10)
                .with_poll_interval(Duration::from_millis(50)),
            health: HealthConfig::default().with_interval(Duration::from_millis(50)),
            updater: UpdaterConfig {
                lock_timeout: Duration::from_millis(100),
                ..UpdaterConfig::default()
            },
        }
    }
}

struct Vars<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    fn parse<T>(&self, suffix: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        let name = format!("{}{}", PREFIX, suffix);
        let Some(raw) = (self.lookup)(&name) else {
            return Ok(None);
        };
        raw.trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                name,
                value: raw.clone(),
                reason: e.to_string(),
            })
    }

    fn millis(&self, suffix: &str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parse::<u64>(suffix)?.map(Duration::from_millis))
    }

    fn secs(&self, suffix: &str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parse::<u64>(suffix)?.map(Duration::from_secs))
    }
}
