//! Performance metrics for guarded execution
//!
//! Counters are plain atomics so the hot path never blocks. Response times go
//! into an HdrHistogram, which yields the running average and percentiles.
//! Every update is mirrored to the [`metrics`] facade so an installed
//! recorder (Prometheus exporter, statsd, ...) sees the same numbers.
//!
//! # Example
//!
//! ```rust
//! use billing_resilience::resilience::metrics::ExecutorMetrics;
//! use std::time::Duration;
//!
//! let metrics = ExecutorMetrics::new();
//! metrics.record_request();
//! metrics.record_success(Duration::from_millis(120));
//! assert_eq!(metrics.snapshot().successful_requests, 1);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use hdrhistogram::Histogram;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::circuit_breaker::CircuitState;

const REQUESTS_TOTAL: &str = "billing_resilience_requests_total";
const SUCCESSES_TOTAL: &str = "billing_resilience_requests_succeeded_total";
const FAILURES_TOTAL: &str = "billing_resilience_requests_failed_total";
const RATE_LIMIT_TOTAL: &str = "billing_resilience_rate_limit_hits_total";
const TRIPS_TOTAL: &str = "billing_resilience_circuit_breaker_trips_total";
const CACHE_HITS_TOTAL: &str = "billing_resilience_cache_hits_total";
const RESPONSE_TIME_SECONDS: &str = "billing_resilience_response_time_seconds";

/// Snapshot of executor metrics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceMetrics {
    /// Every call to `execute_guarded`
    pub total_requests: u64,
    /// Calls that returned a value (cache hits included)
    pub successful_requests: u64,
    /// Calls that returned an error (fast-fails included)
    pub failed_requests: u64,
    /// Attempts rejected by upstream rate limiting
    pub rate_limit_hits: u64,
    /// Calls rejected by an open breaker
    pub circuit_breaker_trips: u64,
    /// Calls answered from cache
    pub cache_hits: u64,
    /// Mean response time of executed operations
    pub average_response_time_ms: f64,
    /// Median response time
    pub p50_response_time_ms: f64,
    /// 95th percentile response time
    pub p95_response_time_ms: f64,
    /// 99th percentile response time
    pub p99_response_time_ms: f64,
    /// Breaker state at snapshot time
    pub circuit_breaker_state: CircuitState,
}

impl PerformanceMetrics {
    /// Fraction of requests that failed, 0.0 when nothing ran yet
    pub fn error_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.failed_requests as f64 / self.total_requests as f64
        }
    }
}

/// Thread-safe response time histogram.
///
/// Tracks 1us to 10 minutes with 3 significant figures.
#[derive(Debug)]
struct LatencyHistogram {
    inner: RwLock<Histogram<u64>>,
}

impl LatencyHistogram {
    fn new() -> Self {
        let histogram = Histogram::new_with_bounds(1, 600_000_000, 3)
            .expect("static histogram bounds are valid");
        Self {
            inner: RwLock::new(histogram),
        }
    }

    fn record(&self, latency: Duration) {
        let micros = (latency.as_micros() as u64).max(1);
        // values above the upper bound are clamped rather than dropped
        self.inner.write().saturating_record(micros);
    }

    fn mean_ms(&self) -> f64 {
        let hist = self.inner.read();
        if hist.is_empty() {
            0.0
        } else {
            hist.mean() / 1000.0
        }
    }

    fn percentile_ms(&self, p: f64) -> f64 {
        let hist = self.inner.read();
        if hist.is_empty() {
            0.0
        } else {
            hist.value_at_quantile(p) as f64 / 1000.0
        }
    }

    fn reset(&self) {
        self.inner.write().reset();
    }
}

/// Counters and latency for one executor.
#[derive(Debug)]
pub struct ExecutorMetrics {
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    rate_limit_hits: AtomicU64,
    circuit_breaker_trips: AtomicU64,
    cache_hits: AtomicU64,
    response_times: LatencyHistogram,
}

impl Default for ExecutorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutorMetrics {
    /// All counters at zero
    pub fn new() -> Self {
        Self {
            total_requests: AtomicU64::new(0),
            successful_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            rate_limit_hits: AtomicU64::new(0),
            circuit_breaker_trips: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            response_times: LatencyHistogram::new(),
        }
    }

    /// A call entered the executor
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(REQUESTS_TOTAL).increment(1);
    }

    /// An executed operation succeeded after `elapsed`
    pub fn record_success(&self, elapsed: Duration) {
        self.successful_requests.fetch_add(1, Ordering::Relaxed);
        self.response_times.record(elapsed);
        metrics::counter!(SUCCESSES_TOTAL).increment(1);
        metrics::histogram!(RESPONSE_TIME_SECONDS).record(elapsed.as_secs_f64());
    }

    /// A call was answered from cache
    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
        self.successful_requests.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(CACHE_HITS_TOTAL).increment(1);
        metrics::counter!(SUCCESSES_TOTAL).increment(1);
    }

    /// A call returned an error
    pub fn record_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(FAILURES_TOTAL).increment(1);
    }

    /// An attempt was rate limited upstream
    pub fn record_rate_limit(&self) {
        self.rate_limit_hits.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(RATE_LIMIT_TOTAL).increment(1);
    }

    /// A call was rejected by the open breaker
    pub fn record_trip(&self) {
        self.circuit_breaker_trips.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(TRIPS_TOTAL).increment(1);
    }

    /// Zero every counter and the histogram
    pub fn reset(&self) {
        self.total_requests.store(0, Ordering::Relaxed);
        self.successful_requests.store(0, Ordering::Relaxed);
        self.failed_requests.store(0, Ordering::Relaxed);
        self.rate_limit_hits.store(0, Ordering::Relaxed);
        self.circuit_breaker_trips.store(0, Ordering::Relaxed);
        self.cache_hits.store(0, Ordering::Relaxed);
        self.response_times.reset();
    }

    /// Snapshot with the breaker state left at `Closed`
    pub fn snapshot(&self) -> PerformanceMetrics {
        self.snapshot_with_state(CircuitState::Closed)
    }

    /// Snapshot including the given breaker state
    pub fn snapshot_with_state(&self, state: CircuitState) -> PerformanceMetrics {
        PerformanceMetrics {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            successful_requests: self.successful_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            rate_limit_hits: self.rate_limit_hits.load(Ordering::Relaxed),
            circuit_breaker_trips: self.circuit_breaker_trips.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            average_response_time_ms: self.response_times.mean_ms(),
            p50_response_time_ms: self.response_times.percentile_ms(0.5),
            p95_response_time_ms: self.response_times.percentile_ms(0.95),
            p99_response_time_ms: self.response_times.percentile_ms(0.99),
            circuit_breaker_state: state,
        }
    }

    /// Render a snapshot in Prometheus text format
    pub fn to_prometheus_format(&self, state: CircuitState) -> String {
        let m = self.snapshot_with_state(state);
        let mut output = String::new();

        output.push_str(&format!("{} {}\n", REQUESTS_TOTAL, m.total_requests));
        output.push_str(&format!("{} {}\n", SUCCESSES_TOTAL, m.successful_requests));
        output.push_str(&format!("{} {}\n", FAILURES_TOTAL, m.failed_requests));
        output.push_str(&format!("{} {}\n", RATE_LIMIT_TOTAL, m.rate_limit_hits));
        output.push_str(&format!("{} {}\n", TRIPS_TOTAL, m.circuit_breaker_trips));
        output.push_str(&format!("{} {}\n", CACHE_HITS_TOTAL, m.cache_hits));
        output.push_str(&format!(
            "billing_resilience_response_time_avg_ms {:.3}\n",
            m.average_response_time_ms
        ));
        output.push_str(&format!(
            "billing_resilience_response_time_p95_ms {:.3}\n",
            m.p95_response_time_ms
        ));
        output.push_str(&format!(
            "billing_resilience_circuit_breaker_open {}\n",
            u8::from(state == CircuitState::Open)
        ));

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_recording() {
        let metrics = ExecutorMetrics::new();

        metrics.record_request();
        metrics.record_success(Duration::from_millis(100));
        metrics.record_request();
        metrics.record_cache_hit();
        metrics.record_request();
        metrics.record_failure();
        metrics.record_rate_limit();
        metrics.record_trip();

        let snap = metrics.snapshot();
        assert_eq!(snap.total_requests, 3);
        assert_eq!(snap.successful_requests, 2);
        assert_eq!(snap.failed_requests, 1);
        assert_eq!(snap.cache_hits, 1);
        assert_eq!(snap.rate_limit_hits, 1);
        assert_eq!(snap.circuit_breaker_trips, 1);
        assert!((snap.error_rate() - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_average_response_time() {
        let metrics = ExecutorMetrics::new();
        metrics.record_success(Duration::from_millis(100));
        metrics.record_success(Duration::from_millis(300));

        let avg = metrics.snapshot().average_response_time_ms;
        assert!((avg - 200.0).abs() < 1.0, "avg was {}", avg);
    }

    #[test]
    fn test_reset() {
        let metrics = ExecutorMetrics::new();
        metrics.record_request();
        metrics.record_success(Duration::from_millis(5));
        metrics.reset();

        let snap = metrics.snapshot();
        assert_eq!(snap.total_requests, 0);
        assert_eq!(snap.successful_requests, 0);
        assert_eq!(snap.average_response_time_ms, 0.0);
    }

    #[test]
    fn test_prometheus_format() {
        let metrics = ExecutorMetrics::new();
        metrics.record_request();
        let text = metrics.to_prometheus_format(CircuitState::Open);
        assert!(text.contains("billing_resilience_requests_total 1"));
        assert!(text.contains("billing_resilience_circuit_breaker_open 1"));
    }
}
