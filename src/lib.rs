//! Billing Resilience - Fault Tolerance for Subscription Billing
//!
//! This crate wraps calls to billing backends in a circuit breaker, retries
//! with backoff, and caches results. It also recovers from failed provider
//! webhooks through a dead-letter queue.
//!
//! # Features
//!
//! - **Guarded Execution**: [`ResilientExecutor`] composes breaker, retry and cache
//! - **Webhook DLQ**: failed events are persisted and redriven with exponential backoff
//! - **Transactional Updates**: one writer per subscription, each event applied at most once
//! - **Health Monitoring**: periodic checks raise deduplicated operations alerts
//! - **Admin API**: Axum router for health, metrics and breaker/cache controls
//! - **PostgreSQL**: durable stores behind the `postgres` feature
//!
//! # Architecture
//!
//! ```text
//! Caller ──▶ ResilientExecutor ──▶ CircuitBreaker ──▶ ResultCache ──▶ RetryExecutor ──▶ backend
//!                  │
//!                  ▼
//!           PerformanceMetrics ◀── HealthMonitor ──▶ AlertStore
//!
//! Webhook ──✗──▶ DlqStore ◀── WebhookRetryProcessor ──▶ TransactionalSubscriptionUpdater
//!                                                            │
//!                                                            ▼
//!                                                  SubscriptionStore (+ audit rows)
//! ```
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use billing_resilience::{ExecuteOptions, OperationError, ResilientExecutor};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let executor = ResilientExecutor::default();
//!
//!     let plan: String = executor
//!         .execute_guarded(
//!             |_cancel| async { Ok::<_, OperationError>("price_pro".to_string()) },
//!             ExecuteOptions::cached("plan:user_1"),
//!         )
//!         .await?;
//!
//!     println!("Plan: {}", plan);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod admin;
pub mod alerts;
pub mod clock;
pub mod config;
pub mod error;
pub mod health;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod resilience;
pub mod subscription;
pub mod webhook;

// Re-exports for convenience
pub use admin::{admin_router, AdminState};
pub use alerts::{AlertSeverity, AlertStore, InMemoryAlertStore, OperationsAlert};
pub use config::ResilienceConfig;
pub use error::{Error, ExecutorError, FailureKind, OperationError, Result, StoreError};
pub use health::{HealthMonitor, HealthReport, HealthStatus};
pub use resilience::{
    CircuitBreaker, CircuitState, ExecuteOptions, PerformanceMetrics, ResilientExecutor,
    ResultCache, RetryExecutor,
};
pub use subscription::{
    InMemorySubscriptionStore, SubscriptionStore, TransactionalSubscriptionUpdater,
};
pub use webhook::{
    DlqStore, InMemoryDlqStore, SubscriptionRedeliverer, WebhookDlqRecord, WebhookRetryProcessor,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
