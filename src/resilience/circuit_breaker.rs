//! Tri-state circuit breaker
//!
//! ```text
//!            failures >= threshold               open delay elapsed
//!   CLOSED ─────────────────────────▶ OPEN ──────────────────────▶ HALF_OPEN
//!     ▲                                 ▲                              │
//!     │                                 └────────── any failure ───────┤
//!     └──────────────── success_threshold consecutive successes ───────┘
//! ```
//!
//! Successes while closed drain the failure counter by one (leaky bucket)
//! rather than resetting it, so an intermittently failing backend still trips
//! once failures outpace successes.
//!
//! State lives behind a [`BreakerStateBackend`]. The default keeps it in
//! process memory, so every instance of a multi-instance deployment has its own
//! breaker. A shared backend can be injected with
//! [`CircuitBreaker::with_backend`] when cluster-wide circuit state is needed.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

/// The current state of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Calls pass through
    #[default]
    Closed,
    /// Calls fail fast without reaching the backend
    Open,
    /// Probing whether the backend recovered
    HalfOpen,
}

impl CircuitState {
    /// Stable label for logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Cumulative failures (net of leaked successes) that open the circuit
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close the circuit
    pub success_threshold: u32,
    /// Time since the last failure before an open circuit admits a probe
    pub open_retry_delay: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_retry_delay: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    /// Set the failure threshold
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set the half-open success threshold
    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    /// Set the open cool-down
    pub fn with_open_retry_delay(mut self, delay: Duration) -> Self {
        self.open_retry_delay = delay;
        self
    }
}

/// Mutable breaker state.
#[derive(Debug, Clone)]
pub struct BreakerState {
    /// Current state
    pub state: CircuitState,
    /// Net failures while closed, total failures while open
    pub failure_count: u32,
    /// Consecutive successes while half-open
    pub success_count: u32,
    /// Time of the most recent recorded failure
    pub last_failure_time: Option<Instant>,
    /// Time of the most recent transition
    pub last_state_change: Instant,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_time: None,
            last_state_change: Instant::now(),
        }
    }

    fn transition(&mut self, to: CircuitState) {
        self.state = to;
        self.last_state_change = Instant::now();
    }
}

/// Storage for breaker state.
///
/// `transact` must run the closure with exclusive access so that each
/// read-modify-write of the state is atomic.
pub trait BreakerStateBackend: Send + Sync + std::fmt::Debug {
    /// Run `f` against the state under an exclusive section
    fn transact(&self, f: &mut dyn FnMut(&mut BreakerState));
}

/// Process-local breaker state
#[derive(Debug)]
pub struct LocalBreakerState {
    inner: Mutex<BreakerState>,
}

impl LocalBreakerState {
    /// Fresh closed state
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BreakerState::new()),
        }
    }
}

impl Default for LocalBreakerState {
    fn default() -> Self {
        Self::new()
    }
}

impl BreakerStateBackend for LocalBreakerState {
    fn transact(&self, f: &mut dyn FnMut(&mut BreakerState)) {
        let mut guard = self.inner.lock();
        f(&mut guard);
    }
}

/// Point-in-time view returned by the admin surface.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerStatus {
    /// Current state
    pub state: CircuitState,
    /// Failure counter
    pub failure_count: u32,
    /// Half-open success counter
    pub success_count: u32,
    /// `true` only when closed
    pub is_healthy: bool,
    /// Milliseconds since the last transition
    pub time_in_state_ms: u64,
}

/// Failure-aware gate in front of a backend.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    backend: Arc<dyn BreakerStateBackend>,
}

impl CircuitBreaker {
    /// Create a breaker with process-local state
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::with_backend(config, Arc::new(LocalBreakerState::new()))
    }

    /// Create a breaker over an injected state backend
    pub fn with_backend(config: CircuitBreakerConfig, backend: Arc<dyn BreakerStateBackend>) -> Self {
        Self { config, backend }
    }

    /// Breaker configuration
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Ask permission to call the backend.
    ///
    /// An open breaker whose cool-down has elapsed moves to half-open and
    /// admits the call. Otherwise an open breaker returns the remaining
    /// cool-down as the error.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let delay = self.config.open_retry_delay;
        let mut verdict = Ok(());
        self.backend.transact(&mut |s| {
            if s.state != CircuitState::Open {
                verdict = Ok(());
                return;
            }
            let elapsed = s
                .last_failure_time
                .map(|t| t.elapsed())
                .unwrap_or(Duration::MAX);
            if elapsed >= delay {
                s.transition(CircuitState::HalfOpen);
                s.success_count = 0;
                info!(
                    open_for_ms = elapsed.as_millis() as u64,
                    "Circuit breaker half-open, probing backend"
                );
                verdict = Ok(());
            } else {
                verdict = Err(delay - elapsed);
            }
        });
        verdict
    }

    /// Record a successful call
    pub fn record_success(&self) {
        let threshold = self.config.success_threshold;
        self.backend.transact(&mut |s| match s.state {
            CircuitState::Closed => {
                s.failure_count = s.failure_count.saturating_sub(1);
            }
            CircuitState::HalfOpen => {
                s.success_count += 1;
                if s.success_count >= threshold {
                    s.transition(CircuitState::Closed);
                    s.failure_count = 0;
                    s.success_count = 0;
                    info!("Circuit breaker closed after successful probes");
                }
            }
            CircuitState::Open => {
                warn!("Success recorded while circuit breaker is open");
            }
        });
    }

    /// Record a failed call
    pub fn record_failure(&self) {
        let threshold = self.config.failure_threshold;
        self.backend.transact(&mut |s| {
            s.last_failure_time = Some(Instant::now());
            match s.state {
                CircuitState::Closed => {
                    s.failure_count += 1;
                    if s.failure_count >= threshold {
                        s.transition(CircuitState::Open);
                        warn!(
                            failure_count = s.failure_count,
                            threshold, "Circuit breaker opened"
                        );
                    }
                }
                CircuitState::HalfOpen => {
                    s.failure_count += 1;
                    s.success_count = 0;
                    s.transition(CircuitState::Open);
                    warn!("Circuit breaker probe failed, reopening");
                }
                CircuitState::Open => {
                    s.failure_count += 1;
                }
            }
        });
    }

    /// Current state
    pub fn state(&self) -> CircuitState {
        self.snapshot().state
    }

    /// Copy of the full state
    pub fn snapshot(&self) -> BreakerState {
        let mut out = None;
        self.backend.transact(&mut |s| out = Some(s.clone()));
        out.unwrap_or_else(BreakerState::new)
    }

    /// Status view for operators
    pub fn status(&self) -> CircuitBreakerStatus {
        let s = self.snapshot();
        CircuitBreakerStatus {
            state: s.state,
            failure_count: s.failure_count,
            success_count: s.success_count,
            is_healthy: s.state == CircuitState::Closed,
            time_in_state_ms: s.last_state_change.elapsed().as_millis() as u64,
        }
    }

    /// Administrative override back to closed
    pub fn reset(&self) {
        self.backend.transact(&mut |s| {
            *s = BreakerState::new();
        });
        info!("Circuit breaker manually reset");
    }
}
