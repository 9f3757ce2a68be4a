//! Subscription rows and audit log entries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Subscription status as reported by the payment provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    /// Paid and in good standing
    Active,
    /// Latest invoice failed; provider still retrying
    PastDue,
    /// Provider gave up collecting
    Unpaid,
    /// Ended
    Canceled,
    /// First payment not yet confirmed
    Incomplete,
    /// First payment never confirmed
    IncompleteExpired,
    /// In a free trial
    Trialing,
    /// Collection paused
    Paused,
    /// Status this crate does not recognise
    #[serde(other)]
    Unknown,
}

impl SubscriptionStatus {
    /// Database/string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::PastDue => "past_due",
            Self::Unpaid => "unpaid",
            Self::Canceled => "canceled",
            Self::Incomplete => "incomplete",
            Self::IncompleteExpired => "incomplete_expired",
            Self::Trialing => "trialing",
            Self::Paused => "paused",
            Self::Unknown => "unknown",
        }
    }

    /// Parse the string representation; unrecognised values map to `Unknown`
    pub fn parse(s: &str) -> Self {
        match s {
            "active" => Self::Active,
            "past_due" => Self::PastDue,
            "unpaid" => Self::Unpaid,
            "canceled" => Self::Canceled,
            "incomplete" => Self::Incomplete,
            "incomplete_expired" => Self::IncompleteExpired,
            "trialing" => Self::Trialing,
            "paused" => Self::Paused,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current state of one subscription
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRecord {
    /// Provider subscription id (sub_...)
    pub subscription_id: String,
    /// Owning user, when known
    pub user_id: Option<String>,
    /// Provider customer id (cus_...)
    pub customer_id: Option<String>,
    /// Current status
    pub status: SubscriptionStatus,
    /// Price/plan id
    pub plan_id: Option<String>,
    /// Current billing period start
    pub current_period_start: Option<DateTime<Utc>>,
    /// Current billing period end
    pub current_period_end: Option<DateTime<Utc>>,
    /// Cancels when the current period ends
    pub cancel_at_period_end: bool,
    /// When the subscription was canceled
    pub canceled_at: Option<DateTime<Utc>>,
    /// Trial end
    pub trial_end: Option<DateTime<Utc>>,
    /// Row creation
    pub created_at: DateTime<Utc>,
    /// Last applied change
    pub updated_at: DateTime<Utc>,
}

impl SubscriptionRecord {
    /// Row created by the first update seen for a subscription
    pub fn from_update(
        subscription_id: impl Into<String>,
        update: &SubscriptionUpdate,
        now: DateTime<Utc>,
    ) -> Self {
        let mut record = Self {
            subscription_id: subscription_id.into(),
            user_id: None,
            customer_id: None,
            status: SubscriptionStatus::Incomplete,
            plan_id: None,
            current_period_start: None,
            current_period_end: None,
            cancel_at_period_end: false,
            canceled_at: None,
            trial_end: None,
            created_at: now,
            updated_at: now,
        };
        record.apply(update, now);
        record
    }

    /// Overwrite the fields `update` carries
    pub fn apply(&mut self, update: &SubscriptionUpdate, now: DateTime<Utc>) {
        if let Some(user_id) = &update.user_id {
            self.user_id = Some(user_id.clone());
        }
        if let Some(customer_id) = &update.customer_id {
            self.customer_id = Some(customer_id.clone());
        }
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(plan_id) = &update.plan_id {
            self.plan_id = Some(plan_id.clone());
        }
        if update.current_period_start.is_some() {
            self.current_period_start = update.current_period_start;
        }
        if update.current_period_end.is_some() {
            self.current_period_end = update.current_period_end;
        }
        if let Some(flag) = update.cancel_at_period_end {
            self.cancel_at_period_end = flag;
        }
        if update.canceled_at.is_some() {
            self.canceled_at = update.canceled_at;
        }
        if update.trial_end.is_some() {
            self.trial_end = update.trial_end;
        }
        self.updated_at = now;
    }
}

/// A partial change to a subscription; `None` fields are left as they are
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionUpdate {
    /// Audit event type, e.g. `subscription_updated`
    pub event_type: String,
    /// Owning user
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Provider customer id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
    /// New status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SubscriptionStatus>,
    /// Plan or price id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    /// Start of the billing period
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_period_start: Option<DateTime<Utc>>,
    /// End of the billing period
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_period_end: Option<DateTime<Utc>>,
    /// Whether the subscription ends with the period
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_at_period_end: Option<bool>,
    /// When it was canceled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canceled_at: Option<DateTime<Utc>>,
    /// End of the trial
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trial_end: Option<DateTime<Utc>>,
}

impl SubscriptionUpdate {
    /// Empty update tagged with an audit event type
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            ..Self::default()
        }
    }

    /// Set the new status
    pub fn with_status(mut self, status: SubscriptionStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Set the owning user
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Set the provider customer
    pub fn with_customer_id(mut self, customer_id: impl Into<String>) -> Self {
        self.customer_id = Some(customer_id.into());
        self
    }

    /// Set the plan
    pub fn with_plan_id(mut self, plan_id: impl Into<String>) -> Self {
        self.plan_id = Some(plan_id.into());
        self
    }
}

/// Append-only audit row.
///
/// A row whose `stripe_event_id` is set marks that event as applied.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionEvent {
    /// Row id
    pub id: Uuid,
    /// Subscription the row belongs to, if any
    pub subscription_id: Option<String>,
    /// User the row belongs to, if any
    pub user_id: Option<String>,
    /// Event type, e.g. `subscription_updated`, `subscription_updated_error`
    pub event_type: String,
    /// Idempotency key of the applied event
    pub stripe_event_id: Option<String>,
    /// Structured detail
    pub event_data: serde_json::Value,
    /// When the row was written
    pub processed_at: DateTime<Utc>,
}

/// Input for appending an audit row
#[derive(Debug, Clone)]
pub struct NewSubscriptionEvent {
    /// Subscription the row belongs to
    pub subscription_id: Option<String>,
    /// User the row belongs to
    pub user_id: Option<String>,
    /// Audit event type
    pub event_type: String,
    /// Idempotency key; set only for applied provider events
    pub stripe_event_id: Option<String>,
    /// Structured detail
    pub event_data: serde_json::Value,
}

impl NewSubscriptionEvent {
    /// Stamp the row with an id and time
    pub fn into_event(self, processed_at: DateTime<Utc>) -> SubscriptionEvent {
        SubscriptionEvent {
            id: Uuid::new_v4(),
            subscription_id: self.subscription_id,
            user_id: self.user_id,
            event_type: self.event_type,
            stripe_event_id: self.stripe_event_id,
            event_data: self.event_data,
            processed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_status_parsing() {
        assert_eq!(SubscriptionStatus::parse("past_due"), SubscriptionStatus::PastDue);
        assert_eq!(SubscriptionStatus::parse("bogus"), SubscriptionStatus::Unknown);
    }

    #[test]
    fn test_apply_only_overwrites_present_fields() {
        let now = Utc::now();
        let mut record = SubscriptionRecord::from_update(
            "sub_A",
            &SubscriptionUpdate::new("subscription_created")
                .with_status(SubscriptionStatus::Active)
                .with_plan_id("price_pro")
                .with_user_id("user_1"),
            now,
        );

        record.apply(
            &SubscriptionUpdate::new("payment_failed").with_status(SubscriptionStatus::PastDue),
            now,
        );
        assert_eq!(record.status, SubscriptionStatus::PastDue);
        assert_eq!(record.plan_id.as_deref(), Some("price_pro"));
        assert_eq!(record.user_id.as_deref(), Some("user_1"));
    }

    #[test]
    fn test_update_serializes_only_set_fields() {
        let update =
            SubscriptionUpdate::new("subscription_updated").with_status(SubscriptionStatus::Active);
        let value = serde_json::to_value(&update).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"eventType": "subscription_updated", "status": "active"})
        );
    }
}
