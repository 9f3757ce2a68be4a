//! PostgreSQL backend
//!
//! [`PgStore`] implements [`DlqStore`], [`AlertStore`] and
//! [`SubscriptionStore`] on one connection pool. The database clock is the
//! only clock: every timestamp comes from `now()`.
//!
//! ```text
//! claim_due_batch ──> UPDATE ... WHERE id IN (SELECT ... FOR UPDATE SKIP LOCKED)
//! begin(sub)      ──> BEGIN; set_config('lock_timeout'); pg_advisory_xact_lock(hashtext(sub))
//! ```
//!
//! Requires the `postgres` feature.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgConnection, PgPool, Postgres, Row, Transaction};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::alerts::{AlertSeverity, AlertStore, NewAlert, OperationsAlert};
use crate::error::StoreError;
use crate::subscription::{
    NewSubscriptionEvent, SubscriptionEvent, SubscriptionRecord, SubscriptionStatus,
    SubscriptionStore, SubscriptionTx,
};
use crate::webhook::{
    DlqConfig, DlqStats, DlqStatus, DlqStore, EnqueueOutcome, FailureOutcome, NewDlqRecord,
    WebhookDlqRecord,
};

const MIGRATION: &str = include_str!("../migrations/0001_resilience.sql");

const DLQ_COLUMNS: &str = "id, event_id, event_type, payload, retry_count, max_retries, \
     next_retry_at, last_error, status, created_at, updated_at";

const SUBSCRIPTION_COLUMNS: &str = "subscription_id, user_id, customer_id, status, plan_id, \
     current_period_start, current_period_end, cancel_at_period_end, canceled_at, trial_end, \
     created_at, updated_at";

const EVENT_COLUMNS: &str =
    "id, subscription_id, user_id, event_type, stripe_event_id, event_data, processed_at";

const ALERT_COLUMNS: &str =
    "id, alert_type, severity, details, acknowledged, resolved, created_at";

// SQLSTATE codes
const UNIQUE_VIOLATION: &str = "23505";
const LOCK_NOT_AVAILABLE: &str = "55P03";

/// Store backed by a PostgreSQL pool
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    config: DlqConfig,
}

impl PgStore {
    /// Wrap an existing pool
    pub fn new(pool: PgPool, config: DlqConfig) -> Self {
        Self { pool, config }
    }

    /// Open a pool against `database_url`
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        config: DlqConfig,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        info!(max_connections, "Connected to PostgreSQL");
        Ok(Self::new(pool, config))
    }

    /// The underlying pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables and indexes if they do not exist
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(MIGRATION).execute(&self.pool).await?;
        info!("Schema migrated");
        Ok(())
    }

    /// Explain why a transition on `id` matched no row
    async fn transition_refused(&self, id: Uuid) -> StoreError {
        let status = sqlx::query("SELECT status FROM webhook_dlq WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await;
        match status {
            Ok(Some(row)) => match row.try_get::<String, _>("status") {
                Ok(status) => StoreError::InvalidState(format!(
                    "DLQ record {} is {}, expected processing",
                    id, status
                )),
                Err(e) => e.into(),
            },
            Ok(None) => StoreError::NotFound(id.to_string()),
            Err(e) => e.into(),
        }
    }
}

fn secs_f64(d: Duration) -> f64 {
    d.as_secs_f64()
}

fn sqlstate(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db) => db.code().map(|c| c.into_owned()),
        _ => None,
    }
}

fn dlq_record(row: &PgRow) -> Result<WebhookDlqRecord, StoreError> {
    let status: String = row.try_get("status")?;
    let status = DlqStatus::parse(&status)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown DLQ status {:?}", status)))?;
    let retry_count: i32 = row.try_get("retry_count")?;
    let max_retries: i32 = row.try_get("max_retries")?;

    Ok(WebhookDlqRecord {
        id: row.try_get("id")?,
        event_id: row.try_get("event_id")?,
        event_type: row.try_get("event_type")?,
        payload: row.try_get("payload")?,
        retry_count: u32::try_from(retry_count)
            .map_err(|_| StoreError::Corrupt(format!("negative retry_count {}", retry_count)))?,
        max_retries: u32::try_from(max_retries)
            .map_err(|_| StoreError::Corrupt(format!("negative max_retries {}", max_retries)))?,
        next_retry_at: row.try_get("next_retry_at")?,
        last_error: row.try_get("last_error")?,
        status,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn subscription_record(row: &PgRow) -> Result<SubscriptionRecord, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(SubscriptionRecord {
        subscription_id: row.try_get("subscription_id")?,
        user_id: row.try_get("user_id")?,
        customer_id: row.try_get("customer_id")?,
        status: SubscriptionStatus::parse(&status),
        plan_id: row.try_get("plan_id")?,
        current_period_start: row.try_get("current_period_start")?,
        current_period_end: row.try_get("current_period_end")?,
        cancel_at_period_end: row.try_get("cancel_at_period_end")?,
        canceled_at: row.try_get("canceled_at")?,
        trial_end: row.try_get("trial_end")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn subscription_event(row: &PgRow) -> Result<SubscriptionEvent, StoreError> {
    Ok(SubscriptionEvent {
        id: row.try_get("id")?,
        subscription_id: row.try_get("subscription_id")?,
        user_id: row.try_get("user_id")?,
        event_type: row.try_get("event_type")?,
        stripe_event_id: row.try_get("stripe_event_id")?,
        event_data: row.try_get("event_data")?,
        processed_at: row.try_get("processed_at")?,
    })
}

fn alert(row: &PgRow) -> Result<OperationsAlert, StoreError> {
    let severity: String = row.try_get("severity")?;
    Ok(OperationsAlert {
        id: row.try_get("id")?,
        alert_type: row.try_get("alert_type")?,
        severity: AlertSeverity::parse(&severity)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown severity {:?}", severity)))?,
        details: row.try_get("details")?,
        acknowledged: row.try_get("acknowledged")?,
        resolved: row.try_get("resolved")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl DlqStore for PgStore {
    #[instrument(skip(self, record), fields(event_id = %record.event_id))]
    async fn enqueue(&self, record: NewDlqRecord) -> Result<EnqueueOutcome, StoreError> {
        let max_retries = record.max_retries.unwrap_or(self.config.max_retries);
        let inserted = sqlx::query(
            r#"
            INSERT INTO webhook_dlq (id, event_id, event_type, payload, max_retries, last_error)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (event_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&record.event_id)
        .bind(&record.event_type)
        .bind(&record.payload)
        .bind(i32::try_from(max_retries).unwrap_or(i32::MAX))
        .bind(&record.last_error)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            let id: Uuid = row.try_get("id")?;
            info!(event_type = %record.event_type, "Event added to DLQ");
            return Ok(EnqueueOutcome::Inserted(id));
        }

        let row = sqlx::query("SELECT id FROM webhook_dlq WHERE event_id = $1")
            .bind(&record.event_id)
            .fetch_one(&self.pool)
            .await?;
        debug!("Event already in DLQ");
        Ok(EnqueueOutcome::Duplicate(row.try_get("id")?))
    }

    async fn claim_due_batch(&self, limit: usize) -> Result<Vec<WebhookDlqRecord>, StoreError> {
        let sql = format!(
            r#"
            UPDATE webhook_dlq SET status = 'processing', updated_at = now()
            WHERE id IN (
                SELECT id FROM webhook_dlq
                WHERE status = 'pending'
                  AND next_retry_at <= now()
                  AND retry_count < max_retries
                ORDER BY next_retry_at ASC, created_at ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {}
            "#,
            DLQ_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;

        let mut claimed = rows.iter().map(dlq_record).collect::<Result<Vec<_>, _>>()?;
        // RETURNING does not preserve the subquery order
        claimed.sort_by(|a, b| {
            a.next_retry_at
                .cmp(&b.next_retry_at)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        if !claimed.is_empty() {
            debug!(count = claimed.len(), "Claimed DLQ batch");
        }
        Ok(claimed)
    }

    async fn mark_completed(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE webhook_dlq SET status = 'completed', updated_at = now() \
             WHERE id = $1 AND status = 'processing'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(self.transition_refused(id).await);
        }
        info!(dlq_id = %id, "DLQ event redelivered");
        Ok(())
    }

    async fn mark_failed_and_reschedule(
        &self,
        id: Uuid,
        error: &str,
    ) -> Result<FailureOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "SELECT retry_count, max_retries FROM webhook_dlq \
             WHERE id = $1 AND status = 'processing' FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            tx.rollback().await?;
            return Err(self.transition_refused(id).await);
        };

        let retry_count: i32 = row.try_get("retry_count")?;
        let max_retries: i32 = row.try_get("max_retries")?;
        let retry_count = (retry_count + 1).min(max_retries);
        let abandoned = retry_count >= max_retries;
        let status = if abandoned {
            DlqStatus::Abandoned
        } else {
            DlqStatus::Pending
        };
        let backoff = self
            .config
            .backoff_after(u32::try_from(retry_count).unwrap_or(0))
            .num_seconds();

        let row = sqlx::query(
            r#"
            UPDATE webhook_dlq SET
                retry_count = $2,
                last_error = $3,
                status = $4,
                next_retry_at = now() + make_interval(secs => $5),
                updated_at = now()
            WHERE id = $1
            RETURNING next_retry_at
            "#,
        )
        .bind(id)
        .bind(retry_count)
        .bind(error)
        .bind(status.as_str())
        .bind(backoff as f64)
        .fetch_one(&mut *tx)
        .await?;
        let next_retry_at = row.try_get("next_retry_at")?;
        tx.commit().await?;

        let retry_count = u32::try_from(retry_count).unwrap_or(0);
        if abandoned {
            warn!(dlq_id = %id, retry_count, error, "DLQ event abandoned");
            Ok(FailureOutcome::Abandoned { retry_count })
        } else {
            debug!(dlq_id = %id, retry_count, %next_retry_at, "DLQ event rescheduled");
            Ok(FailureOutcome::Rescheduled {
                retry_count,
                next_retry_at,
            })
        }
    }

    async fn mark_failed_permanently(&self, id: Uuid, error: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE webhook_dlq SET status = 'failed', last_error = $2, updated_at = now() \
             WHERE id = $1 AND status = 'processing'",
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(self.transition_refused(id).await);
        }
        warn!(dlq_id = %id, error, "DLQ event failed permanently");
        Ok(())
    }

    async fn expire_stale(&self, max_age: Duration) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE webhook_dlq SET status = 'expired', updated_at = now() \
             WHERE status = 'pending' AND created_at < now() - make_interval(secs => $1)",
        )
        .bind(secs_f64(max_age))
        .execute(&self.pool)
        .await?;
        let expired = result.rows_affected();
        if expired > 0 {
            info!(count = expired, "Expired stale DLQ events");
        }
        Ok(expired)
    }

    async fn release_stale_claims(&self, older_than: Duration) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE webhook_dlq SET status = 'pending', updated_at = now() \
             WHERE status = 'processing' AND updated_at < now() - make_interval(secs => $1)",
        )
        .bind(secs_f64(older_than))
        .execute(&self.pool)
        .await?;
        let released = result.rows_affected();
        if released > 0 {
            warn!(count = released, "Released stale DLQ claims");
        }
        Ok(released)
    }

    async fn get(&self, id: Uuid) -> Result<Option<WebhookDlqRecord>, StoreError> {
        let sql = format!("SELECT {} FROM webhook_dlq WHERE id = $1", DLQ_COLUMNS);
        sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(dlq_record)
            .transpose()
    }

    async fn get_by_event_id(
        &self,
        event_id: &str,
    ) -> Result<Option<WebhookDlqRecord>, StoreError> {
        let sql = format!("SELECT {} FROM webhook_dlq WHERE event_id = $1", DLQ_COLUMNS);
        sqlx::query(&sql)
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(dlq_record)
            .transpose()
    }

    async fn stats(&self) -> Result<DlqStats, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending')    AS pending_count,
                COUNT(*) FILTER (WHERE status = 'processing') AS processing_count,
                COUNT(*) FILTER (WHERE status = 'completed')  AS completed_count,
                COUNT(*) FILTER (WHERE status = 'failed')     AS failed_count,
                COUNT(*) FILTER (WHERE status = 'abandoned')  AS abandoned_count,
                COUNT(*) FILTER (WHERE status = 'expired')    AS expired_count,
                COALESCE(SUM(retry_count), 0)::BIGINT         AS total_retries,
                MIN(created_at) FILTER (WHERE status = 'pending') AS oldest_pending,
                COALESCE(AVG(retry_count), 0)::FLOAT8         AS avg_retry_count
            FROM webhook_dlq
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let count = |name: &str| -> Result<u64, StoreError> {
            let n: i64 = row.try_get(name)?;
            Ok(n.max(0) as u64)
        };
        Ok(DlqStats {
            pending_count: count("pending_count")?,
            processing_count: count("processing_count")?,
            completed_count: count("completed_count")?,
            failed_count: count("failed_count")?,
            abandoned_count: count("abandoned_count")?,
            expired_count: count("expired_count")?,
            total_retries: count("total_retries")?,
            oldest_pending: row.try_get("oldest_pending")?,
            avg_retry_count: row.try_get("avg_retry_count")?,
        })
    }
}

#[async_trait]
impl AlertStore for PgStore {
    async fn raise(&self, alert_in: NewAlert) -> Result<OperationsAlert, StoreError> {
        let sql = format!(
            "INSERT INTO operations_alerts (id, alert_type, severity, details) \
             VALUES ($1, $2, $3, $4) RETURNING {}",
            ALERT_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(Uuid::new_v4())
            .bind(&alert_in.alert_type)
            .bind(alert_in.severity.as_str())
            .bind(&alert_in.details)
            .fetch_one(&self.pool)
            .await?;
        alert(&row)
    }

    async fn unacknowledged(&self) -> Result<Vec<OperationsAlert>, StoreError> {
        let sql = format!(
            r#"
            SELECT {} FROM operations_alerts
            WHERE NOT acknowledged
            ORDER BY CASE severity
                WHEN 'critical' THEN 4
                WHEN 'high' THEN 3
                WHEN 'medium' THEN 2
                ELSE 1
            END DESC, created_at ASC
            "#,
            ALERT_COLUMNS
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(alert).collect()
    }

    async fn acknowledge(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE operations_alerts SET acknowledged = true WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn resolve(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE operations_alerts SET resolved = true WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn has_open(&self, alert_type: &str) -> Result<bool, StoreError> {
        let row = sqlx::query(
            "SELECT EXISTS (SELECT 1 FROM operations_alerts \
             WHERE alert_type = $1 AND NOT acknowledged AND NOT resolved) AS open",
        )
        .bind(alert_type)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("open")?)
    }
}

async fn insert_event(
    conn: &mut PgConnection,
    event: NewSubscriptionEvent,
) -> Result<SubscriptionEvent, StoreError> {
    let sql = format!(
        "INSERT INTO subscription_events \
         (id, subscription_id, user_id, event_type, stripe_event_id, event_data) \
         VALUES ($1, $2, $3, $4, $5, $6) RETURNING {}",
        EVENT_COLUMNS
    );
    let result = sqlx::query(&sql)
        .bind(Uuid::new_v4())
        .bind(&event.subscription_id)
        .bind(&event.user_id)
        .bind(&event.event_type)
        .bind(&event.stripe_event_id)
        .bind(&event.event_data)
        .fetch_one(conn)
        .await;
    match result {
        Ok(row) => subscription_event(&row),
        Err(e) if sqlstate(&e).as_deref() == Some(UNIQUE_VIOLATION) => Err(StoreError::Duplicate(
            event.stripe_event_id.unwrap_or_default(),
        )),
        Err(e) => Err(e.into()),
    }
}

async fn event_key_exists(conn: &mut PgConnection, key: &str) -> Result<bool, StoreError> {
    let row = sqlx::query(
        "SELECT EXISTS (SELECT 1 FROM subscription_events WHERE stripe_event_id = $1) AS present",
    )
    .bind(key)
    .fetch_one(conn)
    .await?;
    Ok(row.try_get("present")?)
}

#[async_trait]
impl SubscriptionStore for PgStore {
    #[instrument(skip(self))]
    async fn begin(
        &self,
        subscription_id: &str,
        lock_timeout: Duration,
    ) -> Result<Box<dyn SubscriptionTx>, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT set_config('lock_timeout', $1, true)")
            .bind(format!("{}ms", lock_timeout.as_millis().max(1)))
            .execute(&mut *tx)
            .await?;

        let locked = sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(subscription_id)
            .execute(&mut *tx)
            .await;
        match locked {
            Ok(_) => {}
            Err(e) if sqlstate(&e).as_deref() == Some(LOCK_NOT_AVAILABLE) => {
                return Err(StoreError::LockTimeout {
                    resource: format!("subscription:{}", subscription_id),
                    waited: lock_timeout,
                });
            }
            Err(e) => return Err(e.into()),
        }

        Ok(Box::new(PgSubscriptionTx {
            tx,
            subscription_id: subscription_id.to_string(),
        }))
    }

    async fn event_exists(&self, stripe_event_id: &str) -> Result<bool, StoreError> {
        let mut conn = self.pool.acquire().await?;
        event_key_exists(&mut *conn, stripe_event_id).await
    }

    async fn append_event(
        &self,
        event: NewSubscriptionEvent,
    ) -> Result<SubscriptionEvent, StoreError> {
        let mut conn = self.pool.acquire().await?;
        insert_event(&mut *conn, event).await
    }

    async fn count_events(&self, user_id: &str, event_type: &str) -> Result<u64, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM subscription_events WHERE user_id = $1 AND event_type = $2",
        )
        .bind(user_id)
        .bind(event_type)
        .fetch_one(&self.pool)
        .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n.max(0) as u64)
    }

    async fn get_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Option<SubscriptionRecord>, StoreError> {
        let sql = format!(
            "SELECT {} FROM subscriptions WHERE subscription_id = $1",
            SUBSCRIPTION_COLUMNS
        );
        sqlx::query(&sql)
            .bind(subscription_id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(subscription_record)
            .transpose()
    }

    async fn events_for_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Vec<SubscriptionEvent>, StoreError> {
        let sql = format!(
            "SELECT {} FROM subscription_events WHERE subscription_id = $1 \
             ORDER BY processed_at ASC, id ASC",
            EVENT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(subscription_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(subscription_event).collect()
    }
}

/// A database transaction holding one subscription's advisory lock
struct PgSubscriptionTx {
    tx: Transaction<'static, Postgres>,
    subscription_id: String,
}

#[async_trait]
impl SubscriptionTx for PgSubscriptionTx {
    async fn event_exists(&mut self, stripe_event_id: &str) -> Result<bool, StoreError> {
        event_key_exists(&mut *self.tx, stripe_event_id).await
    }

    async fn current(&mut self) -> Result<Option<SubscriptionRecord>, StoreError> {
        let sql = format!(
            "SELECT {} FROM subscriptions WHERE subscription_id = $1",
            SUBSCRIPTION_COLUMNS
        );
        sqlx::query(&sql)
            .bind(&self.subscription_id)
            .fetch_optional(&mut *self.tx)
            .await?
            .as_ref()
            .map(subscription_record)
            .transpose()
    }

    async fn save(&mut self, record: &SubscriptionRecord) -> Result<(), StoreError> {
        if record.subscription_id != self.subscription_id {
            return Err(StoreError::InvalidState(format!(
                "transaction holds {} but write targets {}",
                self.subscription_id, record.subscription_id
            )));
        }
        sqlx::query(
            r#"
            INSERT INTO subscriptions (
                subscription_id, user_id, customer_id, status, plan_id,
                current_period_start, current_period_end, cancel_at_period_end,
                canceled_at, trial_end, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (subscription_id) DO UPDATE SET
                user_id = EXCLUDED.user_id,
                customer_id = EXCLUDED.customer_id,
                status = EXCLUDED.status,
                plan_id = EXCLUDED.plan_id,
                current_period_start = EXCLUDED.current_period_start,
                current_period_end = EXCLUDED.current_period_end,
                cancel_at_period_end = EXCLUDED.cancel_at_period_end,
                canceled_at = EXCLUDED.canceled_at,
                trial_end = EXCLUDED.trial_end,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&record.subscription_id)
        .bind(&record.user_id)
        .bind(&record.customer_id)
        .bind(record.status.as_str())
        .bind(&record.plan_id)
        .bind(record.current_period_start)
        .bind(record.current_period_end)
        .bind(record.cancel_at_period_end)
        .bind(record.canceled_at)
        .bind(record.trial_end)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn append_event(
        &mut self,
        event: NewSubscriptionEvent,
    ) -> Result<SubscriptionEvent, StoreError> {
        insert_event(&mut *self.tx, event).await
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await.map_err(|e| match sqlstate(&e).as_deref() {
            Some(UNIQUE_VIOLATION) => StoreError::Duplicate(e.to_string()),
            _ => e.into(),
        })
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}
