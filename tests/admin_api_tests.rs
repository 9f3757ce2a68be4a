//! Integration tests for the admin router
//!
//! Requests go through the full Axum router via `tower::ServiceExt::oneshot`.
//!
//! # Running Tests
//!
//! ```bash
//! cargo test --test admin_api_tests
//! ```

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::Router;
use billing_resilience::alerts::{
    alert_types, AlertSeverity, AlertStore, InMemoryAlertStore, NewAlert,
};
use billing_resilience::health::{HealthConfig, HealthMonitor};
use billing_resilience::webhook::{DlqStore, InMemoryDlqStore, NewDlqRecord};
use billing_resilience::{
    admin_router, AdminState, ExecuteOptions, FailureKind, OperationError, ResilientExecutor,
};
use http::{Request, StatusCode};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tower::ServiceExt;

struct Fixture {
    app: Router,
    executor: Arc<ResilientExecutor>,
    dlq: Arc<InMemoryDlqStore>,
    alerts: Arc<InMemoryAlertStore>,
}

fn fixture() -> Fixture {
    let executor = Arc::new(ResilientExecutor::default());
    let alerts = Arc::new(InMemoryAlertStore::new());
    let dlq = Arc::new(InMemoryDlqStore::default());
    let health = Arc::new(
        HealthMonitor::new(executor.clone(), alerts.clone(), HealthConfig::default())
            .with_dlq(dlq.clone()),
    );
    let app = admin_router(AdminState::new(
        executor.clone(),
        health,
        dlq.clone(),
        alerts.clone(),
    ));
    Fixture {
        app,
        executor,
        dlq,
        alerts,
    }
}

async fn send(app: &Router, method: &str, uri: &str) -> (StatusCode, Vec<u8>) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, body.to_vec())
}

async fn send_json(app: &Router, method: &str, uri: &str) -> (StatusCode, Value) {
    let (status, body) = send(app, method, uri).await;
    (status, serde_json::from_slice(&body).unwrap())
}

async fn trip_breaker(executor: &ResilientExecutor) {
    for _ in 0..5 {
        let _: Result<(), _> = executor
            .execute_guarded(
                |_| async { Err(OperationError::new(FailureKind::Validation, "declined")) },
                ExecuteOptions::new(),
            )
            .await;
    }
}

#[tokio::test]
async fn test_health_is_ok_when_idle() {
    let f = fixture();
    let (status, body) = send_json(&f.app, "GET", "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], json!("healthy"));
    assert_eq!(body["issues"], json!([]));
}

#[tokio::test]
async fn test_health_is_unavailable_when_breaker_open() {
    let f = fixture();
    trip_breaker(&f.executor).await;

    let (status, body) = send_json(&f.app, "GET", "/health").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], json!("unhealthy"));

    // evaluating health never raises alerts
    assert!(f.alerts.unacknowledged().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_reset_breaker_endpoint() {
    let f = fixture();
    trip_breaker(&f.executor).await;

    let (status, body) = send_json(&f.app, "POST", "/admin/circuit-breaker/reset").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], json!("CLOSED"));
    assert_eq!(body["isHealthy"], json!(true));

    let (status, _) = send(&f.app, "GET", "/health").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_status_reports_metrics() {
    let f = fixture();
    let _: u32 = f
        .executor
        .execute_guarded(|_| async { Ok(1u32) }, ExecuteOptions::cached("k"))
        .await
        .unwrap();

    let (status, body) = send_json(&f.app, "GET", "/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], json!(billing_resilience::NAME));
    assert_eq!(body["version"], json!(billing_resilience::VERSION));
    assert_eq!(body["metrics"]["totalRequests"], json!(1));
    assert_eq!(body["cacheEntries"], json!(1));
}

#[tokio::test]
async fn test_clear_cache_and_reset_metrics() {
    let f = fixture();
    let _: u32 = f
        .executor
        .execute_guarded(|_| async { Ok(1u32) }, ExecuteOptions::cached("k"))
        .await
        .unwrap();

    let (status, body) = send_json(&f.app, "POST", "/admin/cache/clear").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cleared"], json!(1));
    assert_eq!(f.executor.cache_len(), 0);

    let (status, body) = send_json(&f.app, "POST", "/admin/metrics/reset").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["totalRequests"], json!(0));
}

#[tokio::test]
async fn test_metrics_endpoint_is_prometheus_text() {
    let f = fixture();
    let (status, body) = send(&f.app, "GET", "/metrics").await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("billing_resilience_requests_total 0"));
}

#[tokio::test]
async fn test_dlq_stats_endpoint() {
    let f = fixture();
    f.dlq
        .enqueue(NewDlqRecord::new("evt_1", "invoice.payment_failed", json!({})))
        .await
        .unwrap();

    let (status, body) = send_json(&f.app, "GET", "/dlq/stats").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["pendingCount"], json!(1));
    assert_eq!(body["abandonedCount"], json!(0));
}

#[tokio::test]
async fn test_alerts_listed_and_acknowledged() {
    let f = fixture();
    let alert = f
        .alerts
        .raise(NewAlert::new(
            alert_types::DLQ_ABANDONED,
            AlertSeverity::Critical,
            json!({ "eventId": "evt_1" }),
        ))
        .await
        .unwrap();

    let (status, body) = send_json(&f.app, "GET", "/alerts").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().map(Vec::len), Some(1));
    assert_eq!(body[0]["alertType"], json!(alert_types::DLQ_ABANDONED));
    assert_eq!(body[0]["severity"], json!("critical"));

    let uri = format!("/alerts/{}/acknowledge", alert.id);
    let (status, _) = send(&f.app, "POST", &uri).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, body) = send_json(&f.app, "GET", "/alerts").await;
    assert_eq!(body, json!([]));
}

#[tokio::test]
async fn test_acknowledge_unknown_alert_is_not_found() {
    let f = fixture();
    let uri = format!("/alerts/{}/acknowledge", uuid::Uuid::new_v4());
    let (status, body) = send_json(&f.app, "POST", &uri).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("not found"));
}
