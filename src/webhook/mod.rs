//! Webhook dead-letter queue and redelivery
//!
//! Provider events that fail normal processing are enqueued into a
//! [`DlqStore`]. The [`WebhookRetryProcessor`] periodically claims due records
//! and redrives them through a [`WebhookRedeliverer`], normally the
//! [`SubscriptionRedeliverer`], with exponential backoff between attempts.

pub mod dlq;
pub mod events;
pub mod processor;

pub use dlq::{
    DlqConfig, DlqStats, DlqStatus, DlqStore, EnqueueOutcome, FailureOutcome, InMemoryDlqStore,
    NewDlqRecord, WebhookDlqRecord,
};
pub use events::{StripeEvent, StripeEventType, SubscriptionChange};
pub use processor::{
    ProcessorReport, SubscriptionRedeliverer, WebhookRedeliverer, WebhookRetryProcessor,
};
