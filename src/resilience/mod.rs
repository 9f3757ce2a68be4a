//! Guarded data access
//!
//! [`ResilientExecutor`] is the façade callers use. It composes a
//! [`CircuitBreaker`], a [`RetryExecutor`] and a [`ResultCache`], and collects
//! [`PerformanceMetrics`] along the way. Each component is usable on its own.

pub mod cache;
pub mod circuit_breaker;
pub mod executor;
pub mod metrics;
pub mod retry;

pub use cache::{CacheConfig, ResultCache};
pub use circuit_breaker::{
    BreakerState, BreakerStateBackend, CircuitBreaker, CircuitBreakerConfig,
    CircuitBreakerStatus, CircuitState, LocalBreakerState,
};
pub use executor::{ExecuteOptions, ExecutorConfig, ResilientExecutor};
pub use metrics::{ExecutorMetrics, PerformanceMetrics};
pub use retry::{RetryExecutor, RetryPolicy};
