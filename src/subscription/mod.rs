//! Subscription state and its audit trail
//!
//! Every change to a subscription goes through the
//! [`TransactionalSubscriptionUpdater`], which serialises writers per
//! subscription, applies each provider event at most once and appends an
//! audit row for every outcome.

pub mod model;
pub mod store;
pub mod updater;

pub use model::{
    NewSubscriptionEvent, SubscriptionEvent, SubscriptionRecord, SubscriptionStatus,
    SubscriptionUpdate,
};
pub use store::{InMemorySubscriptionStore, SubscriptionStore, SubscriptionTx};
pub use updater::{
    ApplyOutcome, RetryDecision, TransactionalSubscriptionUpdater, UpdaterConfig, UpdaterError,
};
