//! Operations alerts
//!
//! Alerts are raised by the [`HealthMonitor`](crate::health::HealthMonitor)
//! and by the DLQ retry processor when an event is abandoned. They stay
//! visible until an operator acknowledges them.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::{system_clock, SharedClock};
use crate::error::StoreError;

/// Alert severity, ordered from least to most urgent
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    /// Informational
    Low,
    /// Needs attention soon
    Medium,
    /// Needs attention now
    High,
    /// Requires manual intervention
    Critical,
}

impl AlertSeverity {
    /// Database/string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// Parse the string representation
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

/// Alert types raised by this crate
pub mod alert_types {
    /// A webhook event exhausted its redelivery attempts
    pub const DLQ_ABANDONED: &str = "webhook_dlq_abandoned";
    /// A webhook event failed with a non-retryable error
    pub const DLQ_PERMANENT_FAILURE: &str = "webhook_dlq_permanent_failure";
    /// The DLQ has too many pending events
    pub const DLQ_BACKLOG: &str = "webhook_dlq_backlog";
    /// The executor's breaker is open
    pub const CIRCUIT_OPEN: &str = "circuit_breaker_open";
    /// Error rate above threshold
    pub const HIGH_ERROR_RATE: &str = "high_error_rate";
    /// Average response time above threshold
    pub const SLOW_RESPONSES: &str = "slow_responses";
    /// Upstream rate limiting observed
    pub const RATE_LIMITED: &str = "rate_limited";
}

/// A stored alert
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OperationsAlert {
    /// Alert id
    pub id: Uuid,
    /// Machine-readable type, see [`alert_types`]
    pub alert_type: String,
    /// Severity
    pub severity: AlertSeverity,
    /// Structured context
    pub details: serde_json::Value,
    /// An operator has seen it
    pub acknowledged: bool,
    /// The underlying condition is gone
    pub resolved: bool,
    /// When it was raised
    pub created_at: DateTime<Utc>,
}

/// Input for raising an alert
#[derive(Debug, Clone)]
pub struct NewAlert {
    /// Machine-readable type
    pub alert_type: String,
    /// Severity
    pub severity: AlertSeverity,
    /// Structured context
    pub details: serde_json::Value,
}

impl NewAlert {
    /// Build a new alert
    pub fn new(
        alert_type: impl Into<String>,
        severity: AlertSeverity,
        details: serde_json::Value,
    ) -> Self {
        Self {
            alert_type: alert_type.into(),
            severity,
            details,
        }
    }
}

/// Sort alerts most severe first, then oldest first
pub fn sort_for_triage(alerts: &mut [OperationsAlert]) {
    alerts.sort_by(|a, b| {
        b.severity
            .cmp(&a.severity)
            .then_with(|| a.created_at.cmp(&b.created_at))
    });
}

/// Persistent alert storage
#[async_trait]
pub trait AlertStore: Send + Sync + 'static {
    /// Store a new alert
    async fn raise(&self, alert: NewAlert) -> Result<OperationsAlert, StoreError>;

    /// Unacknowledged alerts, most severe first, then oldest first
    async fn unacknowledged(&self) -> Result<Vec<OperationsAlert>, StoreError>;

    /// Mark an alert acknowledged
    async fn acknowledge(&self, id: Uuid) -> Result<(), StoreError>;

    /// Mark an alert resolved
    async fn resolve(&self, id: Uuid) -> Result<(), StoreError>;

    /// Whether an unacknowledged, unresolved alert of this type exists
    async fn has_open(&self, alert_type: &str) -> Result<bool, StoreError>;
}

impl std::fmt::Debug for dyn AlertStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AlertStore")
    }
}

/// In-memory alert store
#[derive(Debug)]
pub struct InMemoryAlertStore {
    alerts: RwLock<HashMap<Uuid, OperationsAlert>>,
    clock: SharedClock,
}

impl Default for InMemoryAlertStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryAlertStore {
    /// Empty store on the system clock
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    /// Empty store on the given clock
    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            alerts: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Every alert, in triage order
    pub fn all(&self) -> Vec<OperationsAlert> {
        let mut alerts: Vec<_> = self.alerts.read().values().cloned().collect();
        sort_for_triage(&mut alerts);
        alerts
    }
}

#[async_trait]
impl AlertStore for InMemoryAlertStore {
    async fn raise(&self, alert: NewAlert) -> Result<OperationsAlert, StoreError> {
        let stored = OperationsAlert {
            id: Uuid::new_v4(),
            alert_type: alert.alert_type,
            severity: alert.severity,
            details: alert.details,
            acknowledged: false,
            resolved: false,
            created_at: self.clock.now(),
        };
        self.alerts.write().insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn unacknowledged(&self) -> Result<Vec<OperationsAlert>, StoreError> {
        let mut alerts: Vec<_> = self
            .alerts
            .read()
            .values()
            .filter(|a| !a.acknowledged)
            .cloned()
            .collect();
        sort_for_triage(&mut alerts);
        Ok(alerts)
    }

    async fn acknowledge(&self, id: Uuid) -> Result<(), StoreError> {
        let mut alerts = self.alerts.write();
        let alert = alerts
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        alert.acknowledged = true;
        Ok(())
    }

    async fn resolve(&self, id: Uuid) -> Result<(), StoreError> {
        let mut alerts = self.alerts.write();
        let alert = alerts
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        alert.resolved = true;
        Ok(())
    }

    async fn has_open(&self, alert_type: &str) -> Result<bool, StoreError> {
        Ok(self
            .alerts
            .read()
            .values()
            .any(|a| a.alert_type == alert_type && !a.acknowledged && !a.resolved))
    }
}
