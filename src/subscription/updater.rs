//! Exactly-once application of subscription changes
//!
//! ```text
//! apply_event(event_id, subscription_id, update)
//!       │
//!       ▼
//! [audit row for event_id?] ──yes──▶ AlreadyProcessed
//!       │ no
//!       ▼
//! [lock subscription] ──timeout──┐
//!       │                        │
//!       ▼                        │
//! [re-check inside lock]         │
//!       │                        │
//!       ▼                        │
//! [upsert row + audit row]       │
//!       │                        │
//!   commit ──fail────────────────┤
//!       │                        ▼
//!       ▼                 {type}_error audit row, error returned
//!    Applied
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use super::model::{
    NewSubscriptionEvent, SubscriptionEvent, SubscriptionRecord, SubscriptionStatus,
    SubscriptionUpdate,
};
use super::store::{SubscriptionStore, SubscriptionTx};
use crate::clock::{system_clock, SharedClock};
use crate::error::{FailureKind, OperationError, StoreError};

/// Errors from [`TransactionalSubscriptionUpdater`]
#[derive(Error, Debug)]
pub enum UpdaterError {
    /// Input rejected before any write
    #[error("invalid update: {0}")]
    Invalid(String),

    /// Persistence failed; the transaction was rolled back
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl UpdaterError {
    /// Failure classification
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Invalid(_) => FailureKind::Validation,
            Self::Store(e) => e.kind(),
        }
    }

    /// Whether redelivering the event may succeed
    pub fn is_retryable(&self) -> bool {
        self.kind().is_transient()
    }
}

impl From<UpdaterError> for OperationError {
    fn from(err: UpdaterError) -> Self {
        OperationError::new(err.kind(), err.to_string())
    }
}

/// Result of [`TransactionalSubscriptionUpdater::apply_event`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The change was written
    Applied {
        /// Status before the change, `None` for a new subscription
        old_status: Option<SubscriptionStatus>,
        /// Status after the change
        new_status: SubscriptionStatus,
    },
    /// The event had been applied before; nothing was written
    AlreadyProcessed,
}

/// Result of [`TransactionalSubscriptionUpdater::retry_failed_operation`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// A retry was recorded
    Scheduled {
        /// 1-based retry number
        attempt: u32,
    },
    /// The ceiling was reached; no retry was recorded
    Exhausted {
        /// Retries recorded before giving up
        attempts: u32,
    },
}

/// Updater settings
#[derive(Debug, Clone)]
pub struct UpdaterConfig {
    /// Maximum wait for the subscription lock
    pub lock_timeout: Duration,
    /// Per-operation-type retry ceiling
    pub max_operation_retries: u32,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(5),
            max_operation_retries: 3,
        }
    }
}

/// Applies subscription changes atomically, at most once per event id, with
/// an append-only audit trail.
#[derive(Debug)]
pub struct TransactionalSubscriptionUpdater {
    store: Arc<dyn SubscriptionStore>,
    config: UpdaterConfig,
    clock: SharedClock,
}

impl TransactionalSubscriptionUpdater {
    /// Updater over `store` on the system clock
    pub fn new(store: Arc<dyn SubscriptionStore>, config: UpdaterConfig) -> Self {
        Self::with_clock(store, config, system_clock())
    }

    /// Updater with an explicit clock for row timestamps
    pub fn with_clock(
        store: Arc<dyn SubscriptionStore>,
        config: UpdaterConfig,
        clock: SharedClock,
    ) -> Self {
        Self {
            store,
            config,
            clock,
        }
    }

    /// Underlying store
    pub fn store(&self) -> &Arc<dyn SubscriptionStore> {
        &self.store
    }

    /// Apply `update` to `subscription_id` unless `event_id` was applied before.
    ///
    /// On failure an `{event_type}_error` audit row is written before the
    /// error is returned.
    #[instrument(skip(self, update), fields(event_type = %update.event_type))]
    pub async fn apply_event(
        &self,
        event_id: &str,
        subscription_id: &str,
        update: SubscriptionUpdate,
    ) -> Result<ApplyOutcome, UpdaterError> {
        match self.apply_checked(event_id, subscription_id, &update).await {
            Ok(outcome) => Ok(outcome),
            // a concurrent delivery of the same event committed first
            Err(UpdaterError::Store(StoreError::Duplicate(_))) => {
                debug!("Event applied concurrently");
                Ok(ApplyOutcome::AlreadyProcessed)
            }
            Err(e) => {
                self.record_error(event_id, subscription_id, &update, &e)
                    .await;
                Err(e)
            }
        }
    }

    async fn apply_checked(
        &self,
        event_id: &str,
        subscription_id: &str,
        update: &SubscriptionUpdate,
    ) -> Result<ApplyOutcome, UpdaterError> {
        if event_id.is_empty() {
            return Err(UpdaterError::Invalid("event id is empty".to_string()));
        }
        if subscription_id.is_empty() {
            return Err(UpdaterError::Invalid("subscription id is empty".to_string()));
        }
        if update.event_type.is_empty() {
            return Err(UpdaterError::Invalid("event type is empty".to_string()));
        }

        if self.store.event_exists(event_id).await? {
            debug!("Event already applied");
            return Ok(ApplyOutcome::AlreadyProcessed);
        }

        self.apply_locked(event_id, subscription_id, update).await
    }

    async fn apply_locked(
        &self,
        event_id: &str,
        subscription_id: &str,
        update: &SubscriptionUpdate,
    ) -> Result<ApplyOutcome, UpdaterError> {
        let mut tx = self
            .store
            .begin(subscription_id, self.config.lock_timeout)
            .await?;

        let outcome = match self
            .write_in_tx(tx.as_mut(), event_id, subscription_id, update)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "Rollback failed");
                }
                return Err(e);
            }
        };

        tx.commit().await?;

        if let ApplyOutcome::Applied {
            old_status,
            new_status,
        } = &outcome
        {
            info!(
                subscription_id,
                old_status = ?old_status,
                new_status = %new_status,
                "Subscription updated"
            );
        }
        Ok(outcome)
    }

    async fn write_in_tx(
        &self,
        tx: &mut dyn SubscriptionTx,
        event_id: &str,
        subscription_id: &str,
        update: &SubscriptionUpdate,
    ) -> Result<ApplyOutcome, UpdaterError> {
        if tx.event_exists(event_id).await? {
            return Ok(ApplyOutcome::AlreadyProcessed);
        }

        let now = self.clock.now();
        let current = tx.current().await?;
        let old_status = current.as_ref().map(|r| r.status);
        let record = match current {
            Some(mut record) => {
                record.apply(update, now);
                record
            }
            None => SubscriptionRecord::from_update(subscription_id, update, now),
        };
        tx.save(&record).await?;

        tx.append_event(NewSubscriptionEvent {
            subscription_id: Some(subscription_id.to_string()),
            user_id: record.user_id.clone(),
            event_type: update.event_type.clone(),
            stripe_event_id: Some(event_id.to_string()),
            event_data: json!({
                "oldStatus": old_status,
                "newStatus": record.status,
                "updates": update,
            }),
        })
        .await?;

        Ok(ApplyOutcome::Applied {
            old_status,
            new_status: record.status,
        })
    }

    async fn record_error(
        &self,
        event_id: &str,
        subscription_id: &str,
        update: &SubscriptionUpdate,
        err: &UpdaterError,
    ) {
        error!(
            event_id,
            subscription_id,
            error = %err,
            "Subscription update failed"
        );
        let event_type = if update.event_type.is_empty() {
            "subscription_update"
        } else {
            update.event_type.as_str()
        };
        let row = NewSubscriptionEvent {
            subscription_id: (!subscription_id.is_empty()).then(|| subscription_id.to_string()),
            user_id: update.user_id.clone(),
            event_type: format!("{}_error", event_type),
            stripe_event_id: None,
            event_data: json!({
                "eventId": event_id,
                "error": err.to_string(),
                "kind": err.kind(),
                "updates": update,
            }),
        };
        if let Err(audit_err) = self.store.append_event(row).await {
            error!(event_id, error = %audit_err, "Failed to write error audit row");
        }
    }

    /// Record one more retry of a failed `operation_type` for `user_id`.
    ///
    /// Each user and operation type gets at most `max_operation_retries`
    /// `{type}_retry` rows; the call after that writes a
    /// `{type}_max_retries_exceeded` row and reports exhaustion.
    #[instrument(skip(self, payload))]
    pub async fn retry_failed_operation(
        &self,
        user_id: &str,
        operation_type: &str,
        payload: serde_json::Value,
    ) -> Result<RetryDecision, UpdaterError> {
        if user_id.is_empty() || operation_type.is_empty() {
            return Err(UpdaterError::Invalid(
                "user id and operation type are required".to_string(),
            ));
        }

        let retry_type = format!("{}_retry", operation_type);
        let attempts = self.store.count_events(user_id, &retry_type).await?;
        let attempts = u32::try_from(attempts).unwrap_or(u32::MAX);
        let subscription_id = payload
            .get("subscriptionId")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        if attempts >= self.config.max_operation_retries {
            warn!(attempts, "Operation retries exhausted");
            self.store
                .append_event(NewSubscriptionEvent {
                    subscription_id,
                    user_id: Some(user_id.to_string()),
                    event_type: format!("{}_max_retries_exceeded", operation_type),
                    stripe_event_id: None,
                    event_data: json!({ "attempts": attempts, "payload": payload }),
                })
                .await?;
            return Ok(RetryDecision::Exhausted { attempts });
        }

        let attempt = attempts + 1;
        self.store
            .append_event(NewSubscriptionEvent {
                subscription_id,
                user_id: Some(user_id.to_string()),
                event_type: retry_type,
                stripe_event_id: None,
                event_data: json!({ "attempt": attempt, "payload": payload }),
            })
            .await?;
        info!(attempt, "Operation retry recorded");
        Ok(RetryDecision::Scheduled { attempt })
    }

    /// Current row for a subscription
    pub async fn get_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Option<SubscriptionRecord>, UpdaterError> {
        Ok(self.store.get_subscription(subscription_id).await?)
    }

    /// Audit rows for a subscription, oldest first
    pub async fn audit_trail(
        &self,
        subscription_id: &str,
    ) -> Result<Vec<SubscriptionEvent>, UpdaterError> {
        Ok(self.store.events_for_subscription(subscription_id).await?)
    }
}
