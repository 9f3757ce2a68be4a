//! Webhook dead-letter queue
//!
//! Events that fail normal processing are persisted here and redriven by the
//! [`WebhookRetryProcessor`](crate::webhook::WebhookRetryProcessor).
//!
//! # Record lifecycle
//!
//! ```text
//! enqueue ──▶ pending ──claim──▶ processing ──ok──▶ completed
//!               ▲                    │
//!               │     retryable err  │ retry_count < max
//!               └────────────────────┤
//!                                    │ retry_count == max ──▶ abandoned
//!                                    │ permanent err      ──▶ failed
//!  pending older than stale_after ──────────────────────────▶ expired
//! ```
//!
//! `completed`, `failed`, `abandoned` and `expired` are terminal.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::{system_clock, SharedClock};
use crate::error::StoreError;

/// Longest redelivery backoff (30 days)
pub const MAX_BACKOFF_SECS: u64 = 30 * 24 * 60 * 60;

/// DLQ and retry processor settings
#[derive(Debug, Clone)]
pub struct DlqConfig {
    /// Records claimed per processor pass
    pub batch_size: usize,
    /// Redelivery attempts before a record is abandoned
    pub max_retries: u32,
    /// Pending records older than this are expired
    pub stale_after: Duration,
    /// Processing records untouched for this long are returned to pending
    pub claim_timeout: Duration,
    /// Base of the exponential redelivery backoff, in seconds
    pub backoff_base_secs: u64,
    /// Interval between processor passes
    pub poll_interval: Duration,
    /// Deadline for a single redelivery
    pub redelivery_timeout: Duration,
    /// Redeliveries run concurrently within one batch
    pub concurrency: usize,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            max_retries: 3,
            stale_after: Duration::from_secs(7 * 24 * 60 * 60),
            claim_timeout: Duration::from_secs(5 * 60),
            backoff_base_secs: 2,
            poll_interval: Duration::from_secs(30),
            redelivery_timeout: Duration::from_secs(30),
            concurrency: 4,
        }
    }
}

impl DlqConfig {
    /// Set the batch size
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the redelivery ceiling
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the stale-event cutoff
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Set the poll interval
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Delay before the next redelivery once `retry_count` attempts have failed.
    ///
    /// `base^(retry_count + 1)` seconds: 4s, 8s, 16s with the default base.
    /// Capped at [`MAX_BACKOFF_SECS`].
    pub fn backoff_after(&self, retry_count: u32) -> chrono::Duration {
        let secs = self
            .backoff_base_secs
            .saturating_pow(retry_count.saturating_add(1))
            .min(MAX_BACKOFF_SECS);
        chrono::Duration::seconds(secs as i64)
    }
}

/// DLQ record status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DlqStatus {
    /// Waiting for its next redelivery
    Pending,
    /// Claimed by a processor
    Processing,
    /// Redelivered successfully
    Completed,
    /// Failed with a non-retryable error
    Failed,
    /// Exhausted its redelivery attempts
    Abandoned,
    /// Stayed pending past the stale-event cutoff
    Expired,
}

impl DlqStatus {
    /// Database/string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Abandoned => "abandoned",
            Self::Expired => "expired",
        }
    }

    /// Parse the string representation
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "abandoned" => Some(Self::Abandoned),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }
}

impl std::fmt::Display for DlqStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted failed webhook delivery
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WebhookDlqRecord {
    /// Record id
    pub id: Uuid,
    /// Provider event id, unique
    pub event_id: String,
    /// Provider event type
    pub event_type: String,
    /// Raw event payload
    pub payload: serde_json::Value,
    /// Failed redelivery attempts so far
    pub retry_count: u32,
    /// Redelivery ceiling
    pub max_retries: u32,
    /// Earliest time the record may be claimed
    pub next_retry_at: DateTime<Utc>,
    /// Most recent failure
    pub last_error: Option<String>,
    /// Current status
    pub status: DlqStatus,
    /// First failure
    pub created_at: DateTime<Utc>,
    /// Last transition
    pub updated_at: DateTime<Utc>,
}

/// Input for [`DlqStore::enqueue`]
#[derive(Debug, Clone)]
pub struct NewDlqRecord {
    /// Provider event id
    pub event_id: String,
    /// Provider event type
    pub event_type: String,
    /// Raw event payload
    pub payload: serde_json::Value,
    /// Ceiling override; the store default applies when `None`
    pub max_retries: Option<u32>,
    /// Error from the original processing attempt
    pub last_error: Option<String>,
}

impl NewDlqRecord {
    /// Build a record with the store's default ceiling
    pub fn new(
        event_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            event_type: event_type.into(),
            payload,
            max_retries: None,
            last_error: None,
        }
    }

    /// Dead-letter a provider event whose processing failed with `error`
    pub fn from_event(
        event: &super::events::StripeEvent,
        error: impl Into<String>,
    ) -> Result<Self, StoreError> {
        Ok(Self::new(
            event.id.clone(),
            event.event_type.clone(),
            serde_json::to_value(event)?,
        )
        .with_last_error(error))
    }

    /// Override the redelivery ceiling
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Attach the original processing error
    pub fn with_last_error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(error.into());
        self
    }
}

/// Result of an enqueue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new record was created
    Inserted(Uuid),
    /// A record for the event id already existed; nothing was written
    Duplicate(Uuid),
}

impl EnqueueOutcome {
    /// Id of the record holding the event
    pub fn id(&self) -> Uuid {
        match self {
            Self::Inserted(id) | Self::Duplicate(id) => *id,
        }
    }

    /// Whether a new record was created
    pub fn is_inserted(&self) -> bool {
        matches!(self, Self::Inserted(_))
    }
}

/// Result of [`DlqStore::mark_failed_and_reschedule`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Back to pending
    Rescheduled {
        /// Failed attempts so far
        retry_count: u32,
        /// When the record becomes due again
        next_retry_at: DateTime<Utc>,
    },
    /// Ceiling reached; the record is terminal
    Abandoned {
        /// Failed attempts, equal to the ceiling
        retry_count: u32,
    },
}

/// Queue statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DlqStats {
    /// Records waiting for redelivery
    pub pending_count: u64,
    /// Records claimed by a processor
    pub processing_count: u64,
    /// Redelivered records
    pub completed_count: u64,
    /// Permanently failed records
    pub failed_count: u64,
    /// Records that exhausted their attempts
    pub abandoned_count: u64,
    /// Records past the stale-event cutoff
    pub expired_count: u64,
    /// Sum of retry counts over all records
    pub total_retries: u64,
    /// Creation time of the oldest pending record
    pub oldest_pending: Option<DateTime<Utc>>,
    /// Mean retry count over all records
    pub avg_retry_count: f64,
}

/// Persistent DLQ storage.
///
/// Implementations must make [`claim_due_batch`](DlqStore::claim_due_batch)
/// atomic so concurrent processors never claim the same record.
#[async_trait]
pub trait DlqStore: Send + Sync + 'static {
    /// Insert a record; a duplicate event id is a successful no-op
    async fn enqueue(&self, record: NewDlqRecord) -> Result<EnqueueOutcome, StoreError>;

    /// Move up to `limit` due pending records to processing, oldest due first
    async fn claim_due_batch(&self, limit: usize) -> Result<Vec<WebhookDlqRecord>, StoreError>;

    /// Redelivery succeeded
    async fn mark_completed(&self, id: Uuid) -> Result<(), StoreError>;

    /// Redelivery failed with a retryable error
    async fn mark_failed_and_reschedule(
        &self,
        id: Uuid,
        error: &str,
    ) -> Result<FailureOutcome, StoreError>;

    /// Redelivery failed with a non-retryable error
    async fn mark_failed_permanently(&self, id: Uuid, error: &str) -> Result<(), StoreError>;

    /// Expire pending records created more than `max_age` ago
    async fn expire_stale(&self, max_age: Duration) -> Result<u64, StoreError>;

    /// Return processing records untouched for `older_than` to pending
    async fn release_stale_claims(&self, older_than: Duration) -> Result<u64, StoreError>;

    /// Fetch by record id
    async fn get(&self, id: Uuid) -> Result<Option<WebhookDlqRecord>, StoreError>;

    /// Fetch by provider event id
    async fn get_by_event_id(&self, event_id: &str)
        -> Result<Option<WebhookDlqRecord>, StoreError>;

    /// Queue statistics
    async fn stats(&self) -> Result<DlqStats, StoreError>;
}

impl std::fmt::Debug for dyn DlqStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DlqStore")
    }
}

pub(crate) fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

/// `t + d`, saturating at the end of chrono's range
fn saturating_add(t: DateTime<Utc>, d: chrono::Duration) -> DateTime<Utc> {
    t.checked_add_signed(d).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `t - d`, saturating at the start of chrono's range
fn saturating_sub(t: DateTime<Utc>, d: chrono::Duration) -> DateTime<Utc> {
    t.checked_sub_signed(d).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[derive(Debug, Default)]
struct Records {
    by_id: HashMap<Uuid, WebhookDlqRecord>,
    by_event: HashMap<String, Uuid>,
}

/// In-memory DLQ store.
///
/// A single mutex guards the table, which makes every operation, claims
/// included, atomic.
#[derive(Debug)]
pub struct InMemoryDlqStore {
    records: Mutex<Records>,
    config: DlqConfig,
    clock: SharedClock,
}

impl Default for InMemoryDlqStore {
    fn default() -> Self {
        Self::new(DlqConfig::default())
    }
}

impl InMemoryDlqStore {
    /// Empty store on the system clock
    pub fn new(config: DlqConfig) -> Self {
        Self::with_clock(config, system_clock())
    }

    /// Empty store on the given clock
    pub fn with_clock(config: DlqConfig, clock: SharedClock) -> Self {
        Self {
            records: Mutex::new(Records::default()),
            config,
            clock,
        }
    }

    /// Every record, oldest first
    pub fn all(&self) -> Vec<WebhookDlqRecord> {
        let mut all: Vec<_> = self.records.lock().by_id.values().cloned().collect();
        all.sort_by_key(|r| r.created_at);
        all
    }
}

#[async_trait]
impl DlqStore for InMemoryDlqStore {
    async fn enqueue(&self, record: NewDlqRecord) -> Result<EnqueueOutcome, StoreError> {
        let now = self.clock.now();
        let mut records = self.records.lock();

        if let Some(existing) = records.by_event.get(&record.event_id) {
            debug!(event_id = %record.event_id, "Event already in DLQ");
            return Ok(EnqueueOutcome::Duplicate(*existing));
        }

        let stored = WebhookDlqRecord {
            id: Uuid::new_v4(),
            event_id: record.event_id,
            event_type: record.event_type,
            payload: record.payload,
            retry_count: 0,
            max_retries: record.max_retries.unwrap_or(self.config.max_retries),
            next_retry_at: now,
            last_error: record.last_error,
            status: DlqStatus::Pending,
            created_at: now,
            updated_at: now,
        };
        info!(
            event_id = %stored.event_id,
            event_type = %stored.event_type,
            "Event added to DLQ"
        );
        let id = stored.id;
        records.by_event.insert(stored.event_id.clone(), id);
        records.by_id.insert(id, stored);
        Ok(EnqueueOutcome::Inserted(id))
    }

    async fn claim_due_batch(&self, limit: usize) -> Result<Vec<WebhookDlqRecord>, StoreError> {
        let now = self.clock.now();
        let mut records = self.records.lock();

        let mut due: Vec<(DateTime<Utc>, DateTime<Utc>, Uuid)> = records
            .by_id
            .values()
            .filter(|r| {
                r.status == DlqStatus::Pending
                    && r.next_retry_at <= now
                    && r.retry_count < r.max_retries
            })
            .map(|r| (r.next_retry_at, r.created_at, r.id))
            .collect();
        due.sort();
        due.truncate(limit);

        let mut claimed = Vec::with_capacity(due.len());
        for (_, _, id) in due {
            if let Some(record) = records.by_id.get_mut(&id) {
                record.status = DlqStatus::Processing;
                record.updated_at = now;
                claimed.push(record.clone());
            }
        }
        if !claimed.is_empty() {
            debug!(count = claimed.len(), "Claimed DLQ batch");
        }
        Ok(claimed)
    }

    async fn mark_completed(&self, id: Uuid) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut records = self.records.lock();
        let record = claimed_record(&mut records, id)?;
        record.status = DlqStatus::Completed;
        record.updated_at = now;
        info!(event_id = %record.event_id, "DLQ event redelivered");
        Ok(())
    }

    async fn mark_failed_and_reschedule(
        &self,
        id: Uuid,
        error: &str,
    ) -> Result<FailureOutcome, StoreError> {
        let now = self.clock.now();
        let mut records = self.records.lock();
        let record = claimed_record(&mut records, id)?;

        record.retry_count = (record.retry_count + 1).min(record.max_retries);
        record.last_error = Some(error.to_string());
        record.updated_at = now;
        record.next_retry_at = saturating_add(now, self.config.backoff_after(record.retry_count));

        if record.retry_count >= record.max_retries {
            record.status = DlqStatus::Abandoned;
            warn!(
                event_id = %record.event_id,
                retry_count = record.retry_count,
                error,
                "DLQ event abandoned"
            );
            Ok(FailureOutcome::Abandoned {
                retry_count: record.retry_count,
            })
        } else {
            record.status = DlqStatus::Pending;
            debug!(
                event_id = %record.event_id,
                retry_count = record.retry_count,
                next_retry_at = %record.next_retry_at,
                "DLQ event rescheduled"
            );
            Ok(FailureOutcome::Rescheduled {
                retry_count: record.retry_count,
                next_retry_at: record.next_retry_at,
            })
        }
    }

    async fn mark_failed_permanently(&self, id: Uuid, error: &str) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut records = self.records.lock();
        let record = claimed_record(&mut records, id)?;
        record.status = DlqStatus::Failed;
        record.last_error = Some(error.to_string());
        record.updated_at = now;
        warn!(event_id = %record.event_id, error, "DLQ event failed permanently");
        Ok(())
    }

    async fn expire_stale(&self, max_age: Duration) -> Result<u64, StoreError> {
        let now = self.clock.now();
        let cutoff = saturating_sub(now, chrono_duration(max_age));
        let mut records = self.records.lock();
        let mut expired = 0;
        for record in records.by_id.values_mut() {
            if record.status == DlqStatus::Pending && record.created_at < cutoff {
                record.status = DlqStatus::Expired;
                record.updated_at = now;
                expired += 1;
            }
        }
        if expired > 0 {
            info!(count = expired, "Expired stale DLQ events");
        }
        Ok(expired)
    }

    async fn release_stale_claims(&self, older_than: Duration) -> Result<u64, StoreError> {
        let now = self.clock.now();
        let cutoff = saturating_sub(now, chrono_duration(older_than));
        let mut records = self.records.lock();
        let mut released = 0;
        for record in records.by_id.values_mut() {
            if record.status == DlqStatus::Processing && record.updated_at < cutoff {
                record.status = DlqStatus::Pending;
                record.updated_at = now;
                released += 1;
            }
        }
        if released > 0 {
            warn!(count = released, "Released stale DLQ claims");
        }
        Ok(released)
    }

    async fn get(&self, id: Uuid) -> Result<Option<WebhookDlqRecord>, StoreError> {
        Ok(self.records.lock().by_id.get(&id).cloned())
    }

    async fn get_by_event_id(
        &self,
        event_id: &str,
    ) -> Result<Option<WebhookDlqRecord>, StoreError> {
        let records = self.records.lock();
        Ok(records
            .by_event
            .get(event_id)
            .and_then(|id| records.by_id.get(id))
            .cloned())
    }

    async fn stats(&self) -> Result<DlqStats, StoreError> {
        let records = self.records.lock();
        let mut stats = DlqStats::default();
        for record in records.by_id.values() {
            match record.status {
                DlqStatus::Pending => {
                    stats.pending_count += 1;
                    stats.oldest_pending = Some(match stats.oldest_pending {
                        Some(oldest) => oldest.min(record.created_at),
                        None => record.created_at,
                    });
                }
                DlqStatus::Processing => stats.processing_count += 1,
                DlqStatus::Completed => stats.completed_count += 1,
                DlqStatus::Failed => stats.failed_count += 1,
                DlqStatus::Abandoned => stats.abandoned_count += 1,
                DlqStatus::Expired => stats.expired_count += 1,
            }
            stats.total_retries += u64::from(record.retry_count);
        }
        if !records.by_id.is_empty() {
            stats.avg_retry_count = stats.total_retries as f64 / records.by_id.len() as f64;
        }
        Ok(stats)
    }
}

fn claimed_record(records: &mut Records, id: Uuid) -> Result<&mut WebhookDlqRecord, StoreError> {
    let record = records
        .by_id
        .get_mut(&id)
        .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
    if record.status != DlqStatus::Processing {
        return Err(StoreError::InvalidState(format!(
            "DLQ record {} is {}, expected processing",
            id, record.status
        )));
    }
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use serde_json::json;
    use std::sync::Arc;

    fn store() -> (InMemoryDlqStore, ManualClock) {
        let clock = ManualClock::default();
        let store = InMemoryDlqStore::with_clock(DlqConfig::default(), Arc::new(clock.clone()));
        (store, clock)
    }

    #[test]
    fn test_backoff_after() {
        let config = DlqConfig::default();
        assert_eq!(config.backoff_after(1), chrono::Duration::seconds(4));
        assert_eq!(config.backoff_after(2), chrono::Duration::seconds(8));
        assert_eq!(config.backoff_after(3), chrono::Duration::seconds(16));
    }

    #[test]
    fn test_backoff_after_is_capped() {
        let config = DlqConfig {
            backoff_base_secs: 3600,
            ..DlqConfig::default()
        };
        assert_eq!(config.backoff_after(0), chrono::Duration::hours(1));
        assert_eq!(
            config.backoff_after(3),
            chrono::Duration::seconds(MAX_BACKOFF_SECS as i64)
        );
        assert_eq!(
            config.backoff_after(u32::MAX),
            chrono::Duration::seconds(MAX_BACKOFF_SECS as i64)
        );
    }

    #[tokio::test]
    async fn test_enqueue_is_idempotent() {
        let (store, _) = store();
        let first = store
            .enqueue(NewDlqRecord::new("evt_1", "invoice.payment_failed", json!({})))
            .await
            .unwrap();
        let second = store
            .enqueue(NewDlqRecord::new("evt_1", "invoice.payment_failed", json!({})))
            .await
            .unwrap();

        assert!(first.is_inserted());
        assert_eq!(second, EnqueueOutcome::Duplicate(first.id()));
        assert_eq!(store.all().len(), 1);
    }

    #[tokio::test]
    async fn test_new_record_is_due_immediately() {
        let (store, clock) = store();
        store
            .enqueue(NewDlqRecord::new("evt_1", "t", json!({})))
            .await
            .unwrap();
        let record = store.get_by_event_id("evt_1").await.unwrap().unwrap();
        assert_eq!(record.status, DlqStatus::Pending);
        assert_eq!(record.next_retry_at, clock.now());
        assert_eq!(record.max_retries, 3);
    }

    #[tokio::test]
    async fn test_claim_orders_by_due_time_and_respects_limit() {
        let (store, clock) = store();
        for id in ["evt_a", "evt_b", "evt_c"] {
            store
                .enqueue(NewDlqRecord::new(id, "t", json!({})))
                .await
                .unwrap();
            clock.advance(chrono::Duration::seconds(1));
        }

        let batch = store.claim_due_batch(2).await.unwrap();
        let ids: Vec<_> = batch.iter().map(|r| r.event_id.as_str()).collect();
        assert_eq!(ids, vec!["evt_a", "evt_b"]);
        assert!(batch.iter().all(|r| r.status == DlqStatus::Processing));

        // claimed records are not handed out twice
        let rest = store.claim_due_batch(10).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].event_id, "evt_c");
        assert!(store.claim_due_batch(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reschedule_uses_exponential_backoff() {
        let (store, clock) = store();
        let id = store
            .enqueue(NewDlqRecord::new("evt_1", "t", json!({})))
            .await
            .unwrap()
            .id();

        store.claim_due_batch(50).await.unwrap();
        let outcome = store
            .mark_failed_and_reschedule(id, "connection reset")
            .await
            .unwrap();
        assert_eq!(
            outcome,
            FailureOutcome::Rescheduled {
                retry_count: 1,
                next_retry_at: clock.now() + chrono::Duration::seconds(4),
            }
        );

        // not due yet
        assert!(store.claim_due_batch(50).await.unwrap().is_empty());
        clock.advance(chrono::Duration::seconds(4));
        assert_eq!(store.claim_due_batch(50).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_last_failure_abandons() {
        let (store, clock) = store();
        let id = store
            .enqueue(NewDlqRecord::new("evt_1", "t", json!({})).with_max_retries(2))
            .await
            .unwrap()
            .id();

        store.claim_due_batch(50).await.unwrap();
        store.mark_failed_and_reschedule(id, "e1").await.unwrap();
        clock.advance(chrono::Duration::seconds(60));
        store.claim_due_batch(50).await.unwrap();
        let outcome = store.mark_failed_and_reschedule(id, "e2").await.unwrap();

        assert_eq!(outcome, FailureOutcome::Abandoned { retry_count: 2 });
        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, DlqStatus::Abandoned);
        assert_eq!(record.last_error.as_deref(), Some("e2"));

        clock.advance(chrono::Duration::days(1));
        assert!(store.claim_due_batch(50).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_long_retry_chain_stays_in_range() {
        let (store, clock) = store();
        let id = store
            .enqueue(NewDlqRecord::new("evt_1", "t", json!({})).with_max_retries(64))
            .await
            .unwrap()
            .id();

        for attempt in 1..64 {
            assert_eq!(store.claim_due_batch(50).await.unwrap().len(), 1);
            let outcome = store.mark_failed_and_reschedule(id, "timeout").await.unwrap();
            let FailureOutcome::Rescheduled { next_retry_at, .. } = outcome else {
                panic!("attempt {attempt} should reschedule, got {outcome:?}");
            };
            assert!(next_retry_at - clock.now() <= chrono::Duration::days(30));
            clock.set(next_retry_at);
        }

        store.claim_due_batch(50).await.unwrap();
        let outcome = store.mark_failed_and_reschedule(id, "timeout").await.unwrap();
        assert_eq!(outcome, FailureOutcome::Abandoned { retry_count: 64 });
    }

    #[tokio::test]
    async fn test_unbounded_ages_do_not_overflow() {
        let (store, _) = store();
        store
            .enqueue(NewDlqRecord::new("evt_1", "t", json!({})))
            .await
            .unwrap();
        store.claim_due_batch(50).await.unwrap();

        assert_eq!(store.expire_stale(Duration::MAX).await.unwrap(), 0);
        assert_eq!(store.release_stale_claims(Duration::MAX).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_transitions_require_claim() {
        let (store, _) = store();
        let id = store
            .enqueue(NewDlqRecord::new("evt_1", "t", json!({})))
            .await
            .unwrap()
            .id();

        let err = store.mark_completed(id).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidState(_)));
        let err = store.mark_completed(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_expire_stale_pending() {
        let (store, clock) = store();
        store
            .enqueue(NewDlqRecord::new("evt_old", "t", json!({})))
            .await
            .unwrap();
        clock.advance(chrono::Duration::days(7) + chrono::Duration::seconds(1));
        store
            .enqueue(NewDlqRecord::new("evt_new", "t", json!({})))
            .await
            .unwrap();

        let expired = store
            .expire_stale(Duration::from_secs(7 * 24 * 3600))
            .await
            .unwrap();
        assert_eq!(expired, 1);
        let old = store.get_by_event_id("evt_old").await.unwrap().unwrap();
        assert_eq!(old.status, DlqStatus::Expired);
        let new = store.get_by_event_id("evt_new").await.unwrap().unwrap();
        assert_eq!(new.status, DlqStatus::Pending);
    }

    #[tokio::test]
    async fn test_release_stale_claims() {
        let (store, clock) = store();
        store
            .enqueue(NewDlqRecord::new("evt_1", "t", json!({})))
            .await
            .unwrap();
        store.claim_due_batch(50).await.unwrap();

        assert_eq!(
            store
                .release_stale_claims(Duration::from_secs(300))
                .await
                .unwrap(),
            0
        );
        clock.advance(chrono::Duration::minutes(6));
        assert_eq!(
            store
                .release_stale_claims(Duration::from_secs(300))
                .await
                .unwrap(),
            1
        );
        assert_eq!(store.claim_due_batch(50).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stats() {
        let (store, clock) = store();
        let start = clock.now();
        for id in ["evt_1", "evt_2", "evt_3"] {
            store
                .enqueue(NewDlqRecord::new(id, "t", json!({})))
                .await
                .unwrap();
        }
        let batch = store.claim_due_batch(2).await.unwrap();
        store.mark_completed(batch[0].id).await.unwrap();
        store
            .mark_failed_and_reschedule(batch[1].id, "boom")
            .await
            .unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.pending_count, 2);
        assert_eq!(stats.completed_count, 1);
        assert_eq!(stats.total_retries, 1);
        assert_eq!(stats.oldest_pending, Some(start));
        assert!((stats.avg_retry_count - 1.0 / 3.0).abs() < 1e-9);
    }
}
