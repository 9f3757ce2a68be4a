//! Periodic health evaluation
//!
//! The [`HealthMonitor`] reads executor metrics and DLQ statistics, turns
//! threshold breaches into [`HealthIssue`]s and raises an alert for each one
//! that does not already have an open alert of the same type.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::alerts::{alert_types, AlertSeverity, AlertStore, NewAlert};
use crate::clock::{system_clock, SharedClock};
use crate::error::StoreError;
use crate::resilience::{CircuitState, PerformanceMetrics, ResilientExecutor};
use crate::webhook::{DlqStats, DlqStore};

/// Health check thresholds
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Interval between checks
    pub interval: Duration,
    /// Error rate above which the executor is reported unhealthy
    pub error_rate_threshold: f64,
    /// Requests needed before the error rate is judged
    pub min_requests: u64,
    /// Average response time above which responses are reported slow
    pub slow_response_ms: f64,
    /// Pending DLQ records above which a backlog is reported
    pub dlq_backlog_threshold: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            error_rate_threshold: 0.10,
            min_requests: 20,
            slow_response_ms: 5000.0,
            dlq_backlog_threshold: 100,
        }
    }
}

impl HealthConfig {
    /// Set the check interval
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the error rate threshold and its minimum sample
    pub fn with_error_rate(mut self, threshold: f64, min_requests: u64) -> Self {
        self.error_rate_threshold = threshold;
        self.min_requests = min_requests;
        self
    }
}

/// Overall health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// No issues
    Healthy,
    /// Only non-critical issues
    Degraded,
    /// At least one critical issue
    Unhealthy,
}

/// One threshold breach
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthIssue {
    /// Alert type raised for this issue
    pub alert_type: &'static str,
    /// Severity of the raised alert
    pub severity: AlertSeverity,
    /// Human readable summary
    pub message: String,
    /// Alert details
    pub details: serde_json::Value,
}

/// Result of one check
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    /// Overall status
    pub status: HealthStatus,
    /// Threshold breaches found
    pub issues: Vec<HealthIssue>,
    /// Executor metrics the check read
    pub metrics: PerformanceMetrics,
    /// DLQ statistics when a DLQ is watched
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dlq: Option<DlqStats>,
    /// When the check ran
    pub checked_at: DateTime<Utc>,
}

/// Evaluates executor and DLQ health and raises alerts
pub struct HealthMonitor {
    executor: Arc<ResilientExecutor>,
    dlq: Option<Arc<dyn DlqStore>>,
    alerts: Arc<dyn AlertStore>,
    config: HealthConfig,
    clock: SharedClock,
    last_rate_limit_hits: AtomicU64,
}

impl HealthMonitor {
    /// Monitor over an executor, raising alerts into `alerts`
    pub fn new(
        executor: Arc<ResilientExecutor>,
        alerts: Arc<dyn AlertStore>,
        config: HealthConfig,
    ) -> Self {
        Self {
            executor,
            dlq: None,
            alerts,
            config,
            clock: system_clock(),
            last_rate_limit_hits: AtomicU64::new(0),
        }
    }

    /// Also watch a DLQ backlog
    pub fn with_dlq(mut self, dlq: Arc<dyn DlqStore>) -> Self {
        self.dlq = Some(dlq);
        self
    }

    /// Use an explicit clock for report timestamps
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Evaluate the thresholds without raising alerts
    pub async fn evaluate(&self) -> Result<HealthReport, StoreError> {
        let metrics = self.executor.metrics();
        let dlq = match &self.dlq {
            Some(store) => Some(store.stats().await?),
            None => None,
        };

        let mut issues = Vec::new();

        if metrics.circuit_breaker_state == CircuitState::Open {
            let status = self.executor.circuit_breaker_status();
            issues.push(HealthIssue {
                alert_type: alert_types::CIRCUIT_OPEN,
                severity: AlertSeverity::Critical,
                message: "Circuit breaker is open".to_string(),
                details: json!({
                    "failureCount": status.failure_count,
                    "timeInStateMs": status.time_in_state_ms,
                }),
            });
        }

        let error_rate = metrics.error_rate();
        if metrics.total_requests >= self.config.min_requests
            && error_rate > self.config.error_rate_threshold
        {
            issues.push(HealthIssue {
                alert_type: alert_types::HIGH_ERROR_RATE,
                severity: AlertSeverity::High,
                message: format!("Error rate {:.1}% above threshold", error_rate * 100.0),
                details: json!({
                    "errorRate": error_rate,
                    "threshold": self.config.error_rate_threshold,
                    "totalRequests": metrics.total_requests,
                }),
            });
        }

        if metrics.average_response_time_ms > self.config.slow_response_ms {
            issues.push(HealthIssue {
                alert_type: alert_types::SLOW_RESPONSES,
                severity: AlertSeverity::Medium,
                message: format!(
                    "Average response time {:.0}ms above {:.0}ms",
                    metrics.average_response_time_ms, self.config.slow_response_ms
                ),
                details: json!({
                    "averageResponseTimeMs": metrics.average_response_time_ms,
                    "p95ResponseTimeMs": metrics.p95_response_time_ms,
                }),
            });
        }

        let previous_hits = self.last_rate_limit_hits.load(Ordering::Relaxed);
        // a total below the last one means the metrics were reset in between
        let new_hits = if metrics.rate_limit_hits < previous_hits {
            metrics.rate_limit_hits
        } else {
            metrics.rate_limit_hits - previous_hits
        };
        if new_hits > 0 {
            issues.push(HealthIssue {
                alert_type: alert_types::RATE_LIMITED,
                severity: AlertSeverity::Medium,
                message: format!("{} rate limit hits since last check", new_hits),
                details: json!({
                    "newHits": new_hits,
                    "totalHits": metrics.rate_limit_hits,
                }),
            });
        }

        if let Some(stats) = &dlq {
            if stats.pending_count > self.config.dlq_backlog_threshold {
                issues.push(HealthIssue {
                    alert_type: alert_types::DLQ_BACKLOG,
                    severity: AlertSeverity::High,
                    message: format!("{} webhook events pending redelivery", stats.pending_count),
                    details: json!({
                        "pendingCount": stats.pending_count,
                        "oldestPending": stats.oldest_pending,
                    }),
                });
            }
        }

        let status = if issues.iter().any(|i| i.severity == AlertSeverity::Critical) {
            HealthStatus::Unhealthy
        } else if issues.is_empty() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };

        Ok(HealthReport {
            status,
            issues,
            metrics,
            dlq,
            checked_at: self.clock.now(),
        })
    }

    /// Evaluate and raise an alert for every issue without an open alert of its type
    pub async fn check(&self) -> Result<HealthReport, StoreError> {
        let report = self.evaluate().await?;
        self.last_rate_limit_hits
            .store(report.metrics.rate_limit_hits, Ordering::Relaxed);

        for issue in &report.issues {
            if self.alerts.has_open(issue.alert_type).await? {
                debug!(alert_type = issue.alert_type, "Alert already open");
                continue;
            }
            warn!(
                alert_type = issue.alert_type,
                severity = issue.severity.as_str(),
                "{}",
                issue.message
            );
            self.alerts
                .raise(NewAlert::new(
                    issue.alert_type,
                    issue.severity,
                    issue.details.clone(),
                ))
                .await?;
        }
        Ok(report)
    }

    /// Purge expired cached results and check every `interval` until
    /// `shutdown` is cancelled
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            "Starting health monitor"
        );
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let purged = self.executor.purge_expired_cache();
                    if purged > 0 {
                        debug!(purged, "Purged expired cache entries");
                    }
                    match self.check().await {
                        Ok(report) => debug!(status = ?report.status, issues = report.issues.len(), "Health check finished"),
                        Err(e) => error!(error = %e, "Health check failed"),
                    }
                }
            }
        }
        info!("Health monitor shutting down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::InMemoryAlertStore;
    use crate::error::{FailureKind, OperationError};
    use crate::resilience::{
        CacheConfig, CircuitBreakerConfig, ExecuteOptions, ExecutorConfig, RetryPolicy,
    };
    use crate::webhook::{InMemoryDlqStore, NewDlqRecord};

    async fn fail(executor: &ResilientExecutor) {
        let _: Result<(), _> = executor
            .execute_guarded(
                |_| async { Err(OperationError::new(FailureKind::Validation, "bad")) },
                ExecuteOptions::new(),
            )
            .await;
    }

    async fn succeed(executor: &ResilientExecutor) {
        let _: Result<u8, _> = executor
            .execute_guarded(|_| async { Ok(1u8) }, ExecuteOptions::new())
            .await;
    }

    #[tokio::test]
    async fn test_healthy_when_idle() {
        let monitor = HealthMonitor::new(
            Arc::new(ResilientExecutor::default()),
            Arc::new(InMemoryAlertStore::new()),
            HealthConfig::default(),
        );
        let report = monitor.check().await.unwrap();
        assert_eq!(report.status, HealthStatus::Healthy);
        assert!(report.issues.is_empty());
    }

    #[tokio::test]
    async fn test_open_breaker_is_unhealthy_and_alerts_once() {
        let executor = Arc::new(ResilientExecutor::default());
        let alerts = Arc::new(InMemoryAlertStore::new());
        let monitor = HealthMonitor::new(executor.clone(), alerts.clone(), HealthConfig::default());

        for _ in 0..5 {
            fail(&executor).await;
        }
        assert_eq!(executor.circuit_state(), CircuitState::Open);

        let report = monitor.check().await.unwrap();
        assert_eq!(report.status, HealthStatus::Unhealthy);
        monitor.check().await.unwrap();

        let open: Vec<_> = alerts
            .all()
            .into_iter()
            .filter(|a| a.alert_type == alert_types::CIRCUIT_OPEN)
            .collect();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].severity, AlertSeverity::Critical);
    }

    #[tokio::test]
    async fn test_error_rate_needs_minimum_sample() {
        let executor = Arc::new(ResilientExecutor::default());
        let monitor = HealthMonitor::new(
            executor.clone(),
            Arc::new(InMemoryAlertStore::new()),
            HealthConfig::default(),
        );

        // 3 of 10 failed: above 10% but below the sample size
        for i in 0..10 {
            if i % 4 == 0 {
                fail(&executor).await;
            } else {
                succeed(&executor).await;
            }
        }
        let report = monitor.evaluate().await.unwrap();
        assert!(report.issues.is_empty());

        for _ in 0..10 {
            succeed(&executor).await;
        }
        let report = monitor.evaluate().await.unwrap();
        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(report.issues[0].alert_type, alert_types::HIGH_ERROR_RATE);
    }

    #[tokio::test]
    async fn test_dlq_backlog() {
        let dlq = Arc::new(InMemoryDlqStore::default());
        for i in 0..3 {
            dlq.enqueue(NewDlqRecord::new(format!("evt_{}", i), "t", json!({})))
                .await
                .unwrap();
        }
        let monitor = HealthMonitor::new(
            Arc::new(ResilientExecutor::default()),
            Arc::new(InMemoryAlertStore::new()),
            HealthConfig {
                dlq_backlog_threshold: 2,
                ..HealthConfig::default()
            },
        )
        .with_dlq(dlq);

        let report = monitor.evaluate().await.unwrap();
        assert_eq!(report.dlq.unwrap().pending_count, 3);
        assert_eq!(report.issues.len(), 1);
        assert_eq!(report.issues[0].alert_type, alert_types::DLQ_BACKLOG);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_growth_reported_once_per_increase() {
        let executor = Arc::new(ResilientExecutor::default());
        let monitor = HealthMonitor::new(
            executor.clone(),
            Arc::new(InMemoryAlertStore::new()),
            HealthConfig::default(),
        );
        let _: Result<(), _> = executor
            .execute_guarded(
                |_| async { Err(OperationError::new(FailureKind::RateLimited, "429")) },
                ExecuteOptions::new(),
            )
            .await;

        let first = monitor.check().await.unwrap();
        assert!(first
            .issues
            .iter()
            .any(|i| i.alert_type == alert_types::RATE_LIMITED));
        let second = monitor.check().await.unwrap();
        assert!(second.issues.is_empty());
    }

    async fn rate_limited(executor: &ResilientExecutor) {
        let _: Result<(), _> = executor
            .execute_guarded(
                |_| async { Err(OperationError::new(FailureKind::RateLimited, "429")) },
                ExecuteOptions::new(),
            )
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_hits_after_metrics_reset() {
        let executor = Arc::new(ResilientExecutor::default());
        let monitor = HealthMonitor::new(
            executor.clone(),
            Arc::new(InMemoryAlertStore::new()),
            HealthConfig::default(),
        );
        rate_limited(&executor).await;
        rate_limited(&executor).await;
        monitor.check().await.unwrap();

        executor.reset_metrics();
        rate_limited(&executor).await;

        let report = monitor.check().await.unwrap();
        let issue = report
            .issues
            .iter()
            .find(|i| i.alert_type == alert_types::RATE_LIMITED)
            .expect("hits after a reset are reported");
        assert_eq!(issue.details["newHits"], json!(report.metrics.rate_limit_hits));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_purges_expired_cache_entries() {
        let executor = Arc::new(ResilientExecutor::new(
            CircuitBreakerConfig::default(),
            RetryPolicy::default(),
            CacheConfig::default().with_ttl(Duration::from_secs(1)),
            ExecutorConfig::default(),
        ));
        let _: u8 = executor
            .execute_guarded(|_| async { Ok(1u8) }, ExecuteOptions::cached("plan"))
            .await
            .unwrap();
        assert_eq!(executor.cache_len(), 1);

        let monitor = Arc::new(HealthMonitor::new(
            executor.clone(),
            Arc::new(InMemoryAlertStore::new()),
            HealthConfig {
                interval: Duration::from_secs(10),
                ..HealthConfig::default()
            },
        ));
        let shutdown = CancellationToken::new();
        let task = tokio::spawn({
            let monitor = monitor.clone();
            let shutdown = shutdown.clone();
            async move { monitor.run(shutdown).await }
        });

        tokio::time::sleep(Duration::from_secs(11)).await;
        shutdown.cancel();
        task.await.unwrap();
        assert_eq!(executor.cache_len(), 0);
    }
}
