//! DLQ retry processor
//!
//! Periodically redrives due DLQ records. Each pass:
//!
//! ```text
//! [expire stale pending] ─▶ [release orphaned claims] ─▶ [claim due batch]
//!                                                              │
//!                                            ┌─────────────────┘
//!                                            ▼
//!                                    [redeliver, with timeout]
//!                                            │
//!           ok ──────────────────────────────┼──────────── permanent error
//!           │                                │                    │
//!           ▼                          retryable error            ▼
//!       completed                            │             failed + high alert
//!                                            ▼
//!                               reschedule, or abandon + critical alert
//! ```
//!
//! Several processors may share one store; the store's atomic claim keeps
//! them from redelivering the same record.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::json;
use tokio::time::{timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::dlq::{DlqConfig, DlqStore, FailureOutcome, WebhookDlqRecord};
use super::events::StripeEvent;
use crate::alerts::{alert_types, AlertSeverity, AlertStore, NewAlert};
use crate::error::{OperationError, StoreError};
use crate::subscription::{ApplyOutcome, TransactionalSubscriptionUpdater};

/// Redelivers one stored webhook event
#[async_trait]
pub trait WebhookRedeliverer: Send + Sync + 'static {
    /// Process the event again; the error's kind decides whether it is retried
    async fn redeliver(&self, record: &WebhookDlqRecord) -> Result<(), OperationError>;
}

/// Redelivers subscription events through the transactional updater
#[derive(Debug)]
pub struct SubscriptionRedeliverer {
    updater: Arc<TransactionalSubscriptionUpdater>,
}

impl SubscriptionRedeliverer {
    /// Redeliverer applying events through `updater`
    pub fn new(updater: Arc<TransactionalSubscriptionUpdater>) -> Self {
        Self { updater }
    }
}

#[async_trait]
impl WebhookRedeliverer for SubscriptionRedeliverer {
    async fn redeliver(&self, record: &WebhookDlqRecord) -> Result<(), OperationError> {
        let event = StripeEvent::from_value(&record.payload)?;
        let Some(change) = event.subscription_change()? else {
            debug!(
                event_id = %record.event_id,
                event_type = %record.event_type,
                "Ignoring event without subscription change"
            );
            return Ok(());
        };

        match self
            .updater
            .apply_event(&record.event_id, &change.subscription_id, change.update)
            .await?
        {
            ApplyOutcome::Applied { .. } => Ok(()),
            ApplyOutcome::AlreadyProcessed => {
                debug!(event_id = %record.event_id, "Event was already applied");
                Ok(())
            }
        }
    }
}

/// Counts from one processor pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessorReport {
    /// Pending records moved to expired
    pub expired: u64,
    /// Orphaned claims returned to pending
    pub released: u64,
    /// Records claimed this pass
    pub claimed: u64,
    /// Redelivered successfully
    pub completed: u64,
    /// Failed and rescheduled
    pub rescheduled: u64,
    /// Failed for the last time
    pub abandoned: u64,
    /// Failed permanently
    pub failed: u64,
    /// Outcome could not be persisted; the claim is released later
    pub store_errors: u64,
}

impl ProcessorReport {
    /// Whether the pass did anything
    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }
}

enum RecordOutcome {
    Completed,
    Rescheduled,
    Abandoned,
    Failed,
    StoreError,
}

/// Claims due DLQ records and redrives them
pub struct WebhookRetryProcessor<R: WebhookRedeliverer> {
    store: Arc<dyn DlqStore>,
    alerts: Arc<dyn AlertStore>,
    redeliverer: Arc<R>,
    config: DlqConfig,
}

impl<R: WebhookRedeliverer> WebhookRetryProcessor<R> {
    /// Create a new processor
    pub fn new(
        store: Arc<dyn DlqStore>,
        alerts: Arc<dyn AlertStore>,
        redeliverer: Arc<R>,
        config: DlqConfig,
    ) -> Self {
        Self {
            store,
            alerts,
            redeliverer,
            config,
        }
    }

    /// The DLQ this processor drains
    pub fn store(&self) -> &Arc<dyn DlqStore> {
        &self.store
    }

    /// Run one pass
    #[instrument(skip(self))]
    pub async fn run_once(&self) -> Result<ProcessorReport, StoreError> {
        let mut report = ProcessorReport {
            expired: self.store.expire_stale(self.config.stale_after).await?,
            released: self
                .store
                .release_stale_claims(self.config.claim_timeout)
                .await?,
            ..ProcessorReport::default()
        };

        let batch = self.store.claim_due_batch(self.config.batch_size).await?;
        report.claimed = batch.len() as u64;

        let outcomes: Vec<RecordOutcome> = stream::iter(batch)
            .map(|record| self.process_record(record))
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        for outcome in outcomes {
            match outcome {
                RecordOutcome::Completed => report.completed += 1,
                RecordOutcome::Rescheduled => report.rescheduled += 1,
                RecordOutcome::Abandoned => report.abandoned += 1,
                RecordOutcome::Failed => report.failed += 1,
                RecordOutcome::StoreError => report.store_errors += 1,
            }
        }
        Ok(report)
    }

    async fn process_record(&self, record: WebhookDlqRecord) -> RecordOutcome {
        let result = match timeout(
            self.config.redelivery_timeout,
            self.redeliverer.redeliver(&record),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(OperationError::timeout(self.config.redelivery_timeout)),
        };

        let outcome = match result {
            Ok(()) => self
                .store
                .mark_completed(record.id)
                .await
                .map(|()| RecordOutcome::Completed),
            Err(err) if err.is_retryable() => {
                warn!(
                    event_id = %record.event_id,
                    attempt = record.retry_count + 1,
                    max_retries = record.max_retries,
                    error = %err,
                    "Redelivery failed"
                );
                self.reschedule(&record, &err).await
            }
            Err(err) => {
                error!(
                    event_id = %record.event_id,
                    error = %err,
                    "Redelivery failed permanently"
                );
                self.fail_permanently(&record, &err).await
            }
        };

        outcome.unwrap_or_else(|e| {
            error!(
                event_id = %record.event_id,
                error = %e,
                "Failed to record redelivery outcome"
            );
            RecordOutcome::StoreError
        })
    }

    async fn reschedule(
        &self,
        record: &WebhookDlqRecord,
        err: &OperationError,
    ) -> Result<RecordOutcome, StoreError> {
        let message = err.to_string();
        match self
            .store
            .mark_failed_and_reschedule(record.id, &message)
            .await?
        {
            FailureOutcome::Rescheduled { .. } => Ok(RecordOutcome::Rescheduled),
            FailureOutcome::Abandoned { retry_count } => {
                self.raise(NewAlert::new(
                    alert_types::DLQ_ABANDONED,
                    AlertSeverity::Critical,
                    json!({
                        "dlqId": record.id,
                        "eventId": record.event_id,
                        "eventType": record.event_type,
                        "retryCount": retry_count,
                        "lastError": message,
                    }),
                ))
                .await;
                Ok(RecordOutcome::Abandoned)
            }
        }
    }

    async fn fail_permanently(
        &self,
        record: &WebhookDlqRecord,
        err: &OperationError,
    ) -> Result<RecordOutcome, StoreError> {
        let message = err.to_string();
        self.store
            .mark_failed_permanently(record.id, &message)
            .await?;
        self.raise(NewAlert::new(
            alert_types::DLQ_PERMANENT_FAILURE,
            AlertSeverity::High,
            json!({
                "dlqId": record.id,
                "eventId": record.event_id,
                "eventType": record.event_type,
                "error": message,
            }),
        ))
        .await;
        Ok(RecordOutcome::Failed)
    }

    async fn raise(&self, alert: NewAlert) {
        let alert_type = alert.alert_type.clone();
        if let Err(e) = self.alerts.raise(alert).await {
            error!(alert_type = %alert_type, error = %e, "Failed to raise alert");
        }
    }

    /// Run passes every `poll_interval` until `shutdown` is cancelled
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "Starting webhook retry processor"
        );

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => match self.run_once().await {
                    Ok(report) if report.is_idle() => debug!("DLQ pass found nothing due"),
                    Ok(report) => info!(
                        claimed = report.claimed,
                        completed = report.completed,
                        rescheduled = report.rescheduled,
                        abandoned = report.abandoned,
                        failed = report.failed,
                        expired = report.expired,
                        "DLQ pass finished"
                    ),
                    Err(e) => error!(error = %e, "DLQ pass failed"),
                },
            }
        }

        info!("Webhook retry processor shutting down");
    }
}
