//! Subscription persistence and the per-subscription lock
//!
//! [`SubscriptionStore::begin`] opens a transaction holding an exclusive lock
//! on one subscription. Writes made through the [`SubscriptionTx`] become
//! visible together on [`commit`](SubscriptionTx::commit) and are discarded on
//! rollback or drop.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::model::{NewSubscriptionEvent, SubscriptionEvent, SubscriptionRecord};
use crate::clock::{system_clock, SharedClock};
use crate::error::StoreError;

/// Persistent subscription and audit storage
#[async_trait]
pub trait SubscriptionStore: Send + Sync + 'static {
    /// Open a transaction locking `subscription_id`, waiting at most `lock_timeout`
    async fn begin(
        &self,
        subscription_id: &str,
        lock_timeout: Duration,
    ) -> Result<Box<dyn SubscriptionTx>, StoreError>;

    /// Whether an audit row carries this idempotency key
    async fn event_exists(&self, stripe_event_id: &str) -> Result<bool, StoreError>;

    /// Append an audit row outside any transaction
    async fn append_event(
        &self,
        event: NewSubscriptionEvent,
    ) -> Result<SubscriptionEvent, StoreError>;

    /// Number of audit rows of `event_type` for `user_id`
    async fn count_events(&self, user_id: &str, event_type: &str) -> Result<u64, StoreError>;

    /// Current row for a subscription
    async fn get_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Option<SubscriptionRecord>, StoreError>;

    /// Audit rows for a subscription, oldest first
    async fn events_for_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Vec<SubscriptionEvent>, StoreError>;
}

impl std::fmt::Debug for dyn SubscriptionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SubscriptionStore")
    }
}

/// An open transaction holding one subscription's lock
#[async_trait]
pub trait SubscriptionTx: Send {
    /// Whether an audit row carries this idempotency key, including uncommitted rows
    async fn event_exists(&mut self, stripe_event_id: &str) -> Result<bool, StoreError>;

    /// The locked subscription's row as seen by this transaction
    async fn current(&mut self) -> Result<Option<SubscriptionRecord>, StoreError>;

    /// Insert or replace the locked subscription's row
    async fn save(&mut self, record: &SubscriptionRecord) -> Result<(), StoreError>;

    /// Append an audit row
    async fn append_event(
        &mut self,
        event: NewSubscriptionEvent,
    ) -> Result<SubscriptionEvent, StoreError>;

    /// Make every write visible and release the lock
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    /// Discard every write and release the lock
    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
struct Tables {
    subscriptions: HashMap<String, SubscriptionRecord>,
    events: Vec<SubscriptionEvent>,
    event_keys: HashSet<String>,
}

type LockTable = Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

/// Drop the table entry for `subscription_id` once no transaction holds or
/// waits for it
fn release_lock(table: &LockTable, subscription_id: &str) {
    let mut locks = table.lock();
    if locks
        .get(subscription_id)
        .is_some_and(|lock| Arc::strong_count(lock) == 1)
    {
        locks.remove(subscription_id);
    }
}

/// A held subscription lock
struct SubscriptionLock {
    guard: Option<OwnedMutexGuard<()>>,
    subscription_id: String,
    table: LockTable,
}

impl Drop for SubscriptionLock {
    fn drop(&mut self) {
        // the guard keeps a reference to the mutex; release it first
        self.guard.take();
        release_lock(&self.table, &self.subscription_id);
    }
}

/// In-memory subscription store.
///
/// Each subscription has its own async mutex; a transaction owns the guard
/// until it commits or rolls back. Mutexes nobody holds or waits for are
/// dropped.
#[derive(Debug)]
pub struct InMemorySubscriptionStore {
    tables: Arc<Mutex<Tables>>,
    locks: LockTable,
    clock: SharedClock,
}

impl Default for InMemorySubscriptionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemorySubscriptionStore {
    /// Empty store on the system clock
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    /// Empty store on the given clock
    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            tables: Arc::new(Mutex::new(Tables::default())),
            locks: Arc::new(Mutex::new(HashMap::new())),
            clock,
        }
    }

    /// Every audit row, oldest first
    pub fn all_events(&self) -> Vec<SubscriptionEvent> {
        self.tables.lock().events.clone()
    }

    fn lock_for(&self, subscription_id: &str) -> Arc<AsyncMutex<()>> {
        self.locks
            .lock()
            .entry(subscription_id.to_string())
            .or_default()
            .clone()
    }

    #[cfg(test)]
    fn lock_entries(&self) -> usize {
        self.locks.lock().len()
    }
}

#[async_trait]
impl SubscriptionStore for InMemorySubscriptionStore {
    async fn begin(
        &self,
        subscription_id: &str,
        lock_timeout: Duration,
    ) -> Result<Box<dyn SubscriptionTx>, StoreError> {
        let lock = self.lock_for(subscription_id);
        let guard = match tokio::time::timeout(lock_timeout, lock.lock_owned()).await {
            Ok(guard) => guard,
            Err(_) => {
                release_lock(&self.locks, subscription_id);
                return Err(StoreError::LockTimeout {
                    resource: format!("subscription:{}", subscription_id),
                    waited: lock_timeout,
                });
            }
        };

        Ok(Box::new(InMemoryTx {
            _lock: SubscriptionLock {
                guard: Some(guard),
                subscription_id: subscription_id.to_string(),
                table: self.locks.clone(),
            },
            subscription_id: subscription_id.to_string(),
            tables: self.tables.clone(),
            clock: self.clock.clone(),
            record: None,
            events: Vec::new(),
        }))
    }

    async fn event_exists(&self, stripe_event_id: &str) -> Result<bool, StoreError> {
        Ok(self.tables.lock().event_keys.contains(stripe_event_id))
    }

    async fn append_event(
        &self,
        event: NewSubscriptionEvent,
    ) -> Result<SubscriptionEvent, StoreError> {
        let mut tables = self.tables.lock();
        if let Some(key) = &event.stripe_event_id {
            if !tables.event_keys.insert(key.clone()) {
                return Err(StoreError::Duplicate(key.clone()));
            }
        }
        let event = event.into_event(self.clock.now());
        tables.events.push(event.clone());
        Ok(event)
    }

    async fn count_events(&self, user_id: &str, event_type: &str) -> Result<u64, StoreError> {
        Ok(self
            .tables
            .lock()
            .events
            .iter()
            .filter(|e| e.user_id.as_deref() == Some(user_id) && e.event_type == event_type)
            .count() as u64)
    }

    async fn get_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Option<SubscriptionRecord>, StoreError> {
        Ok(self.tables.lock().subscriptions.get(subscription_id).cloned())
    }

    async fn events_for_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Vec<SubscriptionEvent>, StoreError> {
        Ok(self
            .tables
            .lock()
            .events
            .iter()
            .filter(|e| e.subscription_id.as_deref() == Some(subscription_id))
            .cloned()
            .collect())
    }
}

struct InMemoryTx {
    _lock: SubscriptionLock,
    subscription_id: String,
    tables: Arc<Mutex<Tables>>,
    clock: SharedClock,
    record: Option<SubscriptionRecord>,
    events: Vec<SubscriptionEvent>,
}

#[async_trait]
impl SubscriptionTx for InMemoryTx {
    async fn event_exists(&mut self, stripe_event_id: &str) -> Result<bool, StoreError> {
        let pending = self
            .events
            .iter()
            .any(|e| e.stripe_event_id.as_deref() == Some(stripe_event_id));
        Ok(pending || self.tables.lock().event_keys.contains(stripe_event_id))
    }

    async fn current(&mut self) -> Result<Option<SubscriptionRecord>, StoreError> {
        if let Some(record) = &self.record {
            return Ok(Some(record.clone()));
        }
        Ok(self
            .tables
            .lock()
            .subscriptions
            .get(&self.subscription_id)
            .cloned())
    }

    async fn save(&mut self, record: &SubscriptionRecord) -> Result<(), StoreError> {
        if record.subscription_id != self.subscription_id {
            return Err(StoreError::InvalidState(format!(
                "transaction holds {} but write targets {}",
                self.subscription_id, record.subscription_id
            )));
        }
        self.record = Some(record.clone());
        Ok(())
    }

    async fn append_event(
        &mut self,
        event: NewSubscriptionEvent,
    ) -> Result<SubscriptionEvent, StoreError> {
        if let Some(key) = &event.stripe_event_id {
            if self.event_exists(key).await? {
                return Err(StoreError::Duplicate(key.clone()));
            }
        }
        let event = event.into_event(self.clock.now());
        self.events.push(event.clone());
        Ok(event)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        let mut tables = this.tables.lock();

        // idempotency keys are unique across subscriptions, which this lock does not cover
        for event in &this.events {
            if let Some(key) = &event.stripe_event_id {
                if tables.event_keys.contains(key) {
                    return Err(StoreError::Duplicate(key.clone()));
                }
            }
        }

        if let Some(record) = this.record {
            tables
                .subscriptions
                .insert(record.subscription_id.clone(), record);
        }
        for event in this.events {
            if let Some(key) = &event.stripe_event_id {
                tables.event_keys.insert(key.clone());
            }
            tables.events.push(event);
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}
