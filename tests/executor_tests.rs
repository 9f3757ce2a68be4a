//! Integration tests for guarded execution
//!
//! Exercises [`ResilientExecutor`] end to end: breaker trips and recovery,
//! retry exhaustion, per-attempt deadlines and cache behaviour.
//!
//! All tests run on paused tokio time so backoff sleeps and cool-downs
//! complete instantly.
//!
//! # Running Tests
//!
//! ```bash
//! cargo test --test executor_tests
//! ```

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use billing_resilience::resilience::{
    CacheConfig, CircuitBreakerConfig, ExecutorConfig, RetryPolicy,
};
use billing_resilience::{
    CircuitState, ExecuteOptions, ExecutorError, FailureKind, OperationError, ResilienceConfig,
    ResilientExecutor,
};
use pretty_assertions::assert_eq;
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;

/// Operation that counts its invocations and always fails with `kind`
fn failing(
    calls: Arc<AtomicU32>,
    kind: FailureKind,
) -> impl FnMut(CancellationToken) -> std::future::Ready<Result<(), OperationError>> {
    move |_| {
        calls.fetch_add(1, Ordering::SeqCst);
        std::future::ready(Err(OperationError::new(kind, "ETIMEDOUT")))
    }
}

/// Operation that counts its invocations and succeeds
fn succeeding(
    calls: Arc<AtomicU32>,
) -> impl FnMut(CancellationToken) -> std::future::Ready<Result<u32, OperationError>> {
    move |_| {
        calls.fetch_add(1, Ordering::SeqCst);
        std::future::ready(Ok(7))
    }
}

// ============================================================================
// Circuit breaker
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_breaker_opens_after_five_failed_calls() {
    let executor = ResilientExecutor::default();
    let calls = Arc::new(AtomicU32::new(0));

    for _ in 0..5 {
        let err = executor
            .execute_guarded(failing(calls.clone(), FailureKind::Connection), ExecuteOptions::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), Some(FailureKind::Connection));
    }
    // one initial attempt plus three retries per call
    assert_eq!(calls.load(Ordering::SeqCst), 20);
    assert_eq!(executor.circuit_state(), CircuitState::Open);

    let before = calls.load(Ordering::SeqCst);
    let err = executor
        .execute_guarded(failing(calls.clone(), FailureKind::Connection), ExecuteOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutorError::CircuitOpen { .. }));
    assert_eq!(calls.load(Ordering::SeqCst), before, "open breaker must not invoke the op");

    let metrics = executor.metrics();
    assert_eq!(metrics.total_requests, 6);
    assert_eq!(metrics.failed_requests, 6);
    assert_eq!(metrics.circuit_breaker_trips, 1);
}

#[tokio::test(start_paused = true)]
async fn test_breaker_recovers_through_half_open() {
    let executor = ResilientExecutor::new(
        CircuitBreakerConfig::default(),
        RetryPolicy::default().with_max_retries(0),
        CacheConfig::default(),
        ExecutorConfig::default(),
    );
    let calls = Arc::new(AtomicU32::new(0));

    for _ in 0..5 {
        let _ = executor
            .execute_guarded(failing(calls.clone(), FailureKind::Unavailable), ExecuteOptions::new())
            .await;
    }
    assert_eq!(executor.circuit_state(), CircuitState::Open);

    // still cooling down
    tokio::time::advance(Duration::from_secs(30)).await;
    let err = executor
        .execute_guarded(succeeding(calls.clone()), ExecuteOptions::new())
        .await
        .unwrap_err();
    match err {
        ExecutorError::CircuitOpen { retry_in } => {
            assert!(retry_in <= Duration::from_secs(30));
            assert!(retry_in > Duration::ZERO);
        }
        other => panic!("expected CircuitOpen, got {other}"),
    }

    tokio::time::advance(Duration::from_secs(31)).await;
    let value = executor
        .execute_guarded(succeeding(calls.clone()), ExecuteOptions::new())
        .await
        .unwrap();
    assert_eq!(value, 7);
    assert_eq!(executor.circuit_state(), CircuitState::HalfOpen);

    executor
        .execute_guarded(succeeding(calls.clone()), ExecuteOptions::new())
        .await
        .unwrap();
    assert_eq!(executor.circuit_state(), CircuitState::Closed);
    assert_eq!(executor.circuit_breaker_status().failure_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_half_open_probe_failure_reopens() {
    let executor = ResilientExecutor::from_config(&ResilienceConfig::test_config());
    let calls = Arc::new(AtomicU32::new(0));

    for _ in 0..5 {
        let _ = executor
            .execute_guarded(failing(calls.clone(), FailureKind::Validation), ExecuteOptions::new())
            .await;
    }
    assert_eq!(executor.circuit_state(), CircuitState::Open);

    tokio::time::advance(Duration::from_millis(150)).await;
    let _ = executor
        .execute_guarded(failing(calls.clone(), FailureKind::Validation), ExecuteOptions::new())
        .await;
    assert_eq!(executor.circuit_state(), CircuitState::Open);
}

#[tokio::test(start_paused = true)]
async fn test_manual_reset_closes_breaker() {
    let executor = ResilientExecutor::default();
    let calls = Arc::new(AtomicU32::new(0));
    for _ in 0..5 {
        let _ = executor
            .execute_guarded(failing(calls.clone(), FailureKind::Permanent), ExecuteOptions::new())
            .await;
    }
    assert_eq!(executor.circuit_state(), CircuitState::Open);

    executor.reset_circuit_breaker();
    let value = assert_ok!(
        executor
            .execute_guarded(succeeding(calls.clone()), ExecuteOptions::new())
            .await
    );
    assert_eq!(value, 7);
    assert_eq!(executor.circuit_state(), CircuitState::Closed);
}

// ============================================================================
// Retry and deadlines
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_non_retryable_failure_runs_once() {
    let executor = ResilientExecutor::default();
    let calls = Arc::new(AtomicU32::new(0));

    let err = assert_err!(
        executor
            .execute_guarded(failing(calls.clone(), FailureKind::Validation), ExecuteOptions::new())
            .await
    );
    assert_eq!(err.kind(), Some(FailureKind::Validation));
    assert!(!err.is_retryable());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failure_then_success() {
    let executor = ResilientExecutor::default();
    let calls = Arc::new(AtomicU32::new(0));

    let c = calls.clone();
    let value: &str = executor
        .execute_guarded(
            move |_| {
                let attempt = c.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        Err(OperationError::new(FailureKind::Connection, "ECONNRESET"))
                    } else {
                        Ok("ok")
                    }
                }
            },
            ExecuteOptions::new(),
        )
        .await
        .unwrap();
    assert_eq!(value, "ok");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(executor.metrics().successful_requests, 1);
}

#[tokio::test(start_paused = true)]
async fn test_slow_attempts_time_out() {
    let executor = ResilientExecutor::default();
    let calls = Arc::new(AtomicU32::new(0));

    let c = calls.clone();
    let err = executor
        .execute_guarded(
            move |_| {
                c.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok::<_, OperationError>(())
                }
            },
            ExecuteOptions::new().with_timeout(Duration::from_millis(100)),
        )
        .await
        .unwrap_err();

    assert_eq!(
        err,
        ExecutorError::Timeout {
            timeout: Duration::from_millis(100),
            attempts: 4,
        }
    );
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[tokio::test(start_paused = true)]
async fn test_caller_cancellation_stops_retries() {
    let executor = ResilientExecutor::default();
    let token = CancellationToken::new();
    let calls = Arc::new(AtomicU32::new(0));

    let c = calls.clone();
    let canceller = token.clone();
    let err = executor
        .execute_guarded(
            move |_| {
                c.fetch_add(1, Ordering::SeqCst);
                canceller.cancel();
                std::future::ready(Err::<(), _>(OperationError::new(
                    FailureKind::Connection,
                    "ECONNREFUSED",
                )))
            },
            ExecuteOptions::new().with_cancellation(token),
        )
        .await
        .unwrap_err();

    assert_eq!(err, ExecutorError::Cancelled);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(executor.circuit_breaker_status().failure_count, 0);
}

// ============================================================================
// Cache
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_cache_hit_skips_backend_and_counts_as_success() {
    let executor = ResilientExecutor::default();
    let calls = Arc::new(AtomicU32::new(0));

    for _ in 0..2 {
        let value = executor
            .execute_guarded(succeeding(calls.clone()), ExecuteOptions::cached("usage:sub_A"))
            .await
            .unwrap();
        assert_eq!(value, 7);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let metrics = executor.metrics();
    assert_eq!(metrics.cache_hits, 1);
    assert_eq!(metrics.successful_requests, 2);
    assert_eq!(metrics.error_rate(), 0.0);
}

#[tokio::test(start_paused = true)]
async fn test_open_breaker_rejects_before_cache_lookup() {
    let executor = ResilientExecutor::default();
    let calls = Arc::new(AtomicU32::new(0));
    executor
        .execute_guarded(succeeding(calls.clone()), ExecuteOptions::cached("plan:user_1"))
        .await
        .unwrap();
    assert_eq!(executor.cache_len(), 1);

    for _ in 0..5 {
        let _ = executor
            .execute_guarded(failing(calls.clone(), FailureKind::Validation), ExecuteOptions::new())
            .await;
    }
    assert_eq!(executor.circuit_state(), CircuitState::Open);

    let err = executor
        .execute_guarded(succeeding(calls.clone()), ExecuteOptions::cached("plan:user_1"))
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutorError::CircuitOpen { .. }));
    assert_eq!(executor.metrics().cache_hits, 0);
}

#[tokio::test(start_paused = true)]
async fn test_failures_are_not_cached() {
    let executor = ResilientExecutor::default();
    let calls = Arc::new(AtomicU32::new(0));

    let _ = executor
        .execute_guarded(failing(calls.clone(), FailureKind::Validation), ExecuteOptions::cached("k"))
        .await;
    assert_eq!(executor.cache_len(), 0);

    let value = executor
        .execute_guarded(succeeding(calls.clone()), ExecuteOptions::cached("k"))
        .await
        .unwrap();
    assert_eq!(value, 7);
    assert_eq!(executor.cache_len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_prometheus_export_reflects_counters() {
    let executor = ResilientExecutor::default();
    let calls = Arc::new(AtomicU32::new(0));
    executor
        .execute_guarded(succeeding(calls.clone()), ExecuteOptions::new())
        .await
        .unwrap();

    let text = executor.metrics_prometheus();
    assert!(text.contains("billing_resilience_requests_total 1"));
    assert!(text.contains("billing_resilience_requests_succeeded_total 1"));
    assert!(text.contains("billing_resilience_circuit_breaker_open 0"));
}
