//! Payment provider event envelope
//!
//! Typed views of the Stripe webhook events that change subscription state,
//! and their translation into a [`SubscriptionUpdate`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::OperationError;
use crate::subscription::{SubscriptionStatus, SubscriptionUpdate};

/// Stripe event types that affect subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StripeEventType {
    /// `customer.subscription.created`
    #[serde(rename = "customer.subscription.created")]
    SubscriptionCreated,
    /// `customer.subscription.updated`
    #[serde(rename = "customer.subscription.updated")]
    SubscriptionUpdated,
    /// `customer.subscription.deleted`
    #[serde(rename = "customer.subscription.deleted")]
    SubscriptionDeleted,
    /// `invoice.payment_succeeded`
    #[serde(rename = "invoice.payment_succeeded")]
    InvoicePaymentSucceeded,
    /// `invoice.payment_failed`
    #[serde(rename = "invoice.payment_failed")]
    InvoicePaymentFailed,

    /// Any other event type
    #[serde(other)]
    Unknown,
}

impl StripeEventType {
    /// Parse a provider event type; anything unrecognised is `Unknown`
    pub fn parse(s: &str) -> Self {
        match s {
            "customer.subscription.created" => Self::SubscriptionCreated,
            "customer.subscription.updated" => Self::SubscriptionUpdated,
            "customer.subscription.deleted" => Self::SubscriptionDeleted,
            "invoice.payment_succeeded" => Self::InvoicePaymentSucceeded,
            "invoice.payment_failed" => Self::InvoicePaymentFailed,
            _ => Self::Unknown,
        }
    }

    /// Get the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SubscriptionCreated => "customer.subscription.created",
            Self::SubscriptionUpdated => "customer.subscription.updated",
            Self::SubscriptionDeleted => "customer.subscription.deleted",
            Self::InvoicePaymentSucceeded => "invoice.payment_succeeded",
            Self::InvoicePaymentFailed => "invoice.payment_failed",
            Self::Unknown => "unknown",
        }
    }

    /// Audit log event type written for this provider event
    pub fn audit_type(&self) -> &'static str {
        match self {
            Self::SubscriptionCreated => "subscription_created",
            Self::SubscriptionUpdated => "subscription_updated",
            Self::SubscriptionDeleted => "subscription_deleted",
            Self::InvoicePaymentSucceeded => "payment_succeeded",
            Self::InvoicePaymentFailed => "payment_failed",
            Self::Unknown => "unknown",
        }
    }
}

/// Generic Stripe event envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StripeEvent {
    /// Unique identifier for the event
    pub id: String,

    /// Type of event
    #[serde(rename = "type")]
    pub event_type: String,

    /// Time of event creation (Unix timestamp)
    #[serde(default)]
    pub created: i64,

    /// Whether this is a live mode event
    #[serde(default)]
    pub livemode: bool,

    /// Object containing event data
    pub data: EventData,
}

/// Event data container
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventData {
    /// The actual event object (subscription, invoice, ...)
    pub object: serde_json::Value,

    /// Previous values for updated fields (only in *.updated events)
    #[serde(default)]
    pub previous_attributes: Option<serde_json::Value>,
}

/// A subscription change derived from a provider event
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionChange {
    /// Provider subscription id
    pub subscription_id: String,
    /// Fields to apply
    pub update: SubscriptionUpdate,
}

impl StripeEvent {
    /// Parse a stored JSON payload
    pub fn from_value(value: &serde_json::Value) -> Result<Self, OperationError> {
        Self::deserialize(value)
            .map_err(|e| OperationError::permanent(format!("invalid event payload: {}", e)))
    }

    /// Get the typed event type
    pub fn typed_event_type(&self) -> StripeEventType {
        StripeEventType::parse(&self.event_type)
    }

    /// The subscription change this event carries.
    ///
    /// `Ok(None)` for event types that do not touch subscriptions and for
    /// invoices not tied to a subscription. A malformed object is a permanent
    /// error; redelivering it cannot succeed.
    pub fn subscription_change(&self) -> Result<Option<SubscriptionChange>, OperationError> {
        let event_type = self.typed_event_type();
        match event_type {
            StripeEventType::SubscriptionCreated | StripeEventType::SubscriptionUpdated => {
                let sub = self.object::<Subscription>()?;
                let update = sub.to_update(event_type.audit_type());
                Ok(Some(SubscriptionChange {
                    subscription_id: sub.id,
                    update,
                }))
            }
            StripeEventType::SubscriptionDeleted => {
                let sub = self.object::<Subscription>()?;
                let mut update = sub.to_update(event_type.audit_type());
                update.status = Some(SubscriptionStatus::Canceled);
                if update.canceled_at.is_none() {
                    update.canceled_at = unix_time(Some(self.created));
                }
                Ok(Some(SubscriptionChange {
                    subscription_id: sub.id,
                    update,
                }))
            }
            StripeEventType::InvoicePaymentSucceeded | StripeEventType::InvoicePaymentFailed => {
                let invoice = self.object::<Invoice>()?;
                let Some(subscription_id) = invoice.subscription else {
                    return Ok(None);
                };
                let status = if event_type == StripeEventType::InvoicePaymentSucceeded {
                    SubscriptionStatus::Active
                } else {
                    SubscriptionStatus::PastDue
                };
                let mut update = SubscriptionUpdate::new(event_type.audit_type()).with_status(status);
                update.customer_id = invoice.customer;
                Ok(Some(SubscriptionChange {
                    subscription_id,
                    update,
                }))
            }
            StripeEventType::Unknown => Ok(None),
        }
    }

    fn object<T: serde::de::DeserializeOwned>(&self) -> Result<T, OperationError> {
        T::deserialize(&self.data.object).map_err(|e| {
            OperationError::permanent(format!(
                "invalid {} object in event {}: {}",
                self.event_type, self.id, e
            ))
        })
    }
}

// =============================================================================
// Subscription Types
// =============================================================================

/// Stripe subscription object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    /// Subscription ID (sub_...)
    pub id: String,
    /// Customer ID (cus_...)
    #[serde(default)]
    pub customer: Option<String>,
    /// Subscription status
    pub status: SubscriptionStatus,
    /// Current billing period start (Unix timestamp)
    #[serde(default)]
    pub current_period_start: Option<i64>,
    /// Current billing period end (Unix timestamp)
    #[serde(default)]
    pub current_period_end: Option<i64>,
    /// Whether subscription will cancel at period end
    #[serde(default)]
    pub cancel_at_period_end: bool,
    /// When the subscription was canceled (if applicable)
    #[serde(default)]
    pub canceled_at: Option<i64>,
    /// Trial end date (if applicable)
    #[serde(default)]
    pub trial_end: Option<i64>,
    /// Subscription items (plans/prices)
    #[serde(default)]
    pub items: SubscriptionItems,
    /// Metadata attached to the subscription
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Subscription {
    /// The price id of the first item
    pub fn plan_id(&self) -> Option<&str> {
        self.items.data.first().map(|item| item.price.id.as_str())
    }

    /// `metadata.user_id`, set at checkout
    pub fn user_id(&self) -> Option<&str> {
        self.metadata.get("user_id").and_then(|v| v.as_str())
    }

    fn to_update(&self, audit_type: &str) -> SubscriptionUpdate {
        SubscriptionUpdate {
            event_type: audit_type.to_string(),
            user_id: self.user_id().map(str::to_string),
            customer_id: self.customer.clone(),
            status: Some(self.status),
            plan_id: self.plan_id().map(str::to_string),
            current_period_start: unix_time(self.current_period_start),
            current_period_end: unix_time(self.current_period_end),
            cancel_at_period_end: Some(self.cancel_at_period_end),
            canceled_at: unix_time(self.canceled_at),
            trial_end: unix_time(self.trial_end),
        }
    }
}

fn unix_time(secs: Option<i64>) -> Option<DateTime<Utc>> {
    secs.and_then(|s| DateTime::from_timestamp(s, 0))
}

/// Subscription items container
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscriptionItems {
    /// List of subscription items
    #[serde(default)]
    pub data: Vec<SubscriptionItem>,
}

/// Individual subscription item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionItem {
    /// Item ID
    pub id: String,
    /// Price object
    pub price: Price,
}

/// Price object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Price {
    /// Price ID
    pub id: String,
}

// =============================================================================
// Invoice Types
// =============================================================================

/// Stripe invoice object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    /// Invoice ID (in_...)
    pub id: String,
    /// Customer ID
    #[serde(default)]
    pub customer: Option<String>,
    /// Associated subscription ID (if any)
    #[serde(default)]
    pub subscription: Option<String>,
    /// Total amount in cents
    #[serde(default)]
    pub amount_due: i64,
    /// Amount paid in cents
    #[serde(default)]
    pub amount_paid: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn subscription_event(event_type: &str) -> StripeEvent {
        StripeEvent::from_value(&json!({
            "id": "evt_1234567890",
            "type": event_type,
            "created": 1614556800,
            "livemode": false,
            "data": {
                "object": {
                    "id": "sub_1234567890",
                    "customer": "cus_1234567890",
                    "status": "active",
                    "current_period_start": 1614556800,
                    "current_period_end": 1617235200,
                    "cancel_at_period_end": false,
                    "items": {
                        "data": [{
                            "id": "si_1234567890",
                            "price": { "id": "price_pro_monthly" }
                        }]
                    },
                    "metadata": { "user_id": "user_42" }
                }
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_event_type_parsing() {
        assert_eq!(
            StripeEventType::parse("customer.subscription.created"),
            StripeEventType::SubscriptionCreated
        );
        assert_eq!(
            StripeEventType::parse("invoice.payment_succeeded"),
            StripeEventType::InvoicePaymentSucceeded
        );
        assert_eq!(
            StripeEventType::parse("unknown.event"),
            StripeEventType::Unknown
        );
    }

    #[test]
    fn test_subscription_created_change() {
        let change = subscription_event("customer.subscription.created")
            .subscription_change()
            .unwrap()
            .unwrap();

        assert_eq!(change.subscription_id, "sub_1234567890");
        assert_eq!(change.update.event_type, "subscription_created");
        assert_eq!(change.update.status, Some(SubscriptionStatus::Active));
        assert_eq!(change.update.plan_id.as_deref(), Some("price_pro_monthly"));
        assert_eq!(change.update.user_id.as_deref(), Some("user_42"));
        assert_eq!(
            change.update.current_period_end,
            DateTime::from_timestamp(1617235200, 0)
        );
    }

    #[test]
    fn test_subscription_deleted_forces_canceled() {
        let change = subscription_event("customer.subscription.deleted")
            .subscription_change()
            .unwrap()
            .unwrap();
        assert_eq!(change.update.status, Some(SubscriptionStatus::Canceled));
        assert!(change.update.canceled_at.is_some());
    }

    #[test]
    fn test_invoice_events_map_to_status() {
        let event = |t: &str| {
            StripeEvent::from_value(&json!({
                "id": "evt_invoice_1234",
                "type": t,
                "created": 1614556800,
                "data": {
                    "object": {
                        "id": "in_1234567890",
                        "customer": "cus_1234567890",
                        "subscription": "sub_1234567890",
                        "amount_due": 2000,
                        "amount_paid": 0
                    }
                }
            }))
            .unwrap()
        };

        let failed = event("invoice.payment_failed")
            .subscription_change()
            .unwrap()
            .unwrap();
        assert_eq!(failed.update.status, Some(SubscriptionStatus::PastDue));
        assert_eq!(failed.update.event_type, "payment_failed");

        let paid = event("invoice.payment_succeeded")
            .subscription_change()
            .unwrap()
            .unwrap();
        assert_eq!(paid.update.status, Some(SubscriptionStatus::Active));
    }

    #[test]
    fn test_unknown_event_has_no_change() {
        let event = StripeEvent::from_value(&json!({
            "id": "evt_unknown_123",
            "type": "some.unknown.event",
            "data": { "object": {} }
        }))
        .unwrap();
        assert_eq!(event.subscription_change().unwrap(), None);
    }

    #[test]
    fn test_malformed_object_is_permanent() {
        let event = StripeEvent::from_value(&json!({
            "id": "evt_bad",
            "type": "customer.subscription.updated",
            "data": { "object": { "status": "active" } }
        }))
        .unwrap();
        let err = event.subscription_change().unwrap_err();
        assert!(!err.is_retryable());
    }
}
