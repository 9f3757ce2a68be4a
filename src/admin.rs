//! Administrative HTTP surface
//!
//! Exposes health, metrics, breaker and DLQ controls for operators.
//!
//! # Routes
//!
//! | Method | Path | Action |
//! |--------|------|--------|
//! | GET  | `/health` | Health report; 503 when unhealthy |
//! | GET  | `/status` | Version, uptime, metrics and breaker status |
//! | GET  | `/metrics` | Prometheus text metrics |
//! | POST | `/admin/circuit-breaker/reset` | Force the breaker closed |
//! | POST | `/admin/cache/clear` | Drop every cached result |
//! | POST | `/admin/metrics/reset` | Zero the performance counters |
//! | GET  | `/dlq/stats` | DLQ statistics |
//! | GET  | `/alerts` | Unacknowledged alerts, most severe first |
//! | POST | `/alerts/:id/acknowledge` | Acknowledge an alert |
//!
//! ```text
//! HTTP Request ──> Axum Router ──> handler ──> AdminState
//!                                     │            │
//!                                     ▼            ▼
//!                               JSON Response  executor / DLQ / alerts
//! ```

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use crate::alerts::{AlertStore, OperationsAlert};
use crate::error::StoreError;
use crate::health::{HealthMonitor, HealthReport, HealthStatus};
use crate::resilience::{CircuitBreakerStatus, PerformanceMetrics, ResilientExecutor};
use crate::webhook::{DlqStats, DlqStore};
use crate::{NAME, VERSION};

/// Shared state behind the admin router
#[derive(Clone)]
pub struct AdminState {
    executor: Arc<ResilientExecutor>,
    health: Arc<HealthMonitor>,
    dlq: Arc<dyn DlqStore>,
    alerts: Arc<dyn AlertStore>,
    start_time: Instant,
}

impl AdminState {
    /// State over the running executor, monitor and stores
    pub fn new(
        executor: Arc<ResilientExecutor>,
        health: Arc<HealthMonitor>,
        dlq: Arc<dyn DlqStore>,
        alerts: Arc<dyn AlertStore>,
    ) -> Self {
        Self {
            executor,
            health,
            dlq,
            alerts,
            start_time: Instant::now(),
        }
    }

    /// Seconds since the state was created
    #[inline]
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

/// Detailed status response
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    /// Crate name
    pub name: String,
    /// Crate version
    pub version: String,
    /// Seconds since startup
    pub uptime_seconds: u64,
    /// Executor metrics
    pub metrics: PerformanceMetrics,
    /// Breaker status
    pub circuit_breaker: CircuitBreakerStatus,
    /// Cached results, including stale ones
    pub cache_entries: usize,
    /// RFC 3339 time of the response
    pub timestamp: String,
}

/// Store failures rendered as JSON errors
struct ApiError(StoreError);

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            StoreError::InvalidState(_) | StoreError::Duplicate(_) => StatusCode::CONFLICT,
            StoreError::LockTimeout { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => {
                error!(error = %self.0, "Admin request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

#[instrument(skip_all)]
async fn health_handler(State(state): State<AdminState>) -> Result<Response, ApiError> {
    debug!("Health check requested");
    let report: HealthReport = state.health.evaluate().await?;
    let status = match report.status {
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
    };
    Ok((status, Json(report)).into_response())
}

#[instrument(skip_all)]
async fn status_handler(State(state): State<AdminState>) -> impl IntoResponse {
    debug!("Status check requested");
    let response = StatusResponse {
        name: NAME.to_string(),
        version: VERSION.to_string(),
        uptime_seconds: state.uptime_seconds(),
        metrics: state.executor.metrics(),
        circuit_breaker: state.executor.circuit_breaker_status(),
        cache_entries: state.executor.cache_len(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    };
    (StatusCode::OK, Json(response))
}

#[instrument(skip_all)]
async fn metrics_handler(State(state): State<AdminState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.executor.metrics_prometheus(),
    )
}

#[instrument(skip_all)]
async fn reset_breaker_handler(State(state): State<AdminState>) -> impl IntoResponse {
    state.executor.reset_circuit_breaker();
    info!("Circuit breaker reset by operator");
    Json(state.executor.circuit_breaker_status())
}

#[instrument(skip_all)]
async fn clear_cache_handler(State(state): State<AdminState>) -> impl IntoResponse {
    let cleared = state.executor.cache_len();
    state.executor.clear_cache();
    info!(cleared, "Cache cleared by operator");
    Json(json!({ "cleared": cleared }))
}

#[instrument(skip_all)]
async fn reset_metrics_handler(State(state): State<AdminState>) -> impl IntoResponse {
    state.executor.reset_metrics();
    info!("Metrics reset by operator");
    Json(state.executor.metrics())
}

#[instrument(skip_all)]
async fn dlq_stats_handler(State(state): State<AdminState>) -> Result<Json<DlqStats>, ApiError> {
    Ok(Json(state.dlq.stats().await?))
}

#[instrument(skip_all)]
async fn alerts_handler(
    State(state): State<AdminState>,
) -> Result<Json<Vec<OperationsAlert>>, ApiError> {
    Ok(Json(state.alerts.unacknowledged().await?))
}

#[instrument(skip(state))]
async fn acknowledge_handler(
    State(state): State<AdminState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.alerts.acknowledge(id).await?;
    info!(alert_id = %id, "Alert acknowledged");
    Ok(StatusCode::NO_CONTENT)
}

/// Build the admin router
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use billing_resilience::admin::{admin_router, AdminState};
/// use billing_resilience::alerts::{AlertStore, InMemoryAlertStore};
/// use billing_resilience::health::{HealthConfig, HealthMonitor};
/// use billing_resilience::webhook::{DlqStore, InMemoryDlqStore};
/// use billing_resilience::ResilientExecutor;
///
/// let executor = Arc::new(ResilientExecutor::default());
/// let alerts: Arc<dyn AlertStore> = Arc::new(InMemoryAlertStore::new());
/// let dlq: Arc<dyn DlqStore> = Arc::new(InMemoryDlqStore::default());
/// let health = Arc::new(
///     HealthMonitor::new(executor.clone(), alerts.clone(), HealthConfig::default())
///         .with_dlq(dlq.clone()),
/// );
/// let app = admin_router(AdminState::new(executor, health, dlq, alerts));
/// ```
pub fn admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/metrics", get(metrics_handler))
        .route("/admin/circuit-breaker/reset", post(reset_breaker_handler))
        .route("/admin/cache/clear", post(clear_cache_handler))
        .route("/admin/metrics/reset", post(reset_metrics_handler))
        .route("/dlq/stats", get(dlq_stats_handler))
        .route("/alerts", get(alerts_handler))
        .route("/alerts/:id/acknowledge", post(acknowledge_handler))
        .with_state(state)
}
