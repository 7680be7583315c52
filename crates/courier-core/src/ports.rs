//! Narrow contracts over the external collaborators.
//!
//! The engine is written against these traits only; production adapters
//! live in [`crate::adapters`] and tests inject in-memory implementations.
//! Methods return boxed futures so the traits stay object-safe and can be
//! shared as `Arc<dyn ...>` across the loops.

use std::{future::Future, pin::Pin, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::Result,
    models::{Delivery, Message, MessageId, MessageStatus, QueueMessage},
};

/// Boxed future returned by port methods.
pub type PortFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Contract over the durable message store (D).
///
/// The store is authoritative for message state; every mutation refreshes
/// `updated_at`, which the staleness machinery depends on.
pub trait MessageRepository: Send + Sync + 'static {
    /// Persists a new message record.
    fn create(&self, message: &Message) -> PortFuture<'_, ()>;

    /// Loads a message by id; `None` when no record exists.
    fn find_by_id(&self, id: MessageId) -> PortFuture<'_, Option<Message>>;

    /// Fetches up to `limit` messages in `unsent` status.
    fn find_unsent(&self, limit: usize) -> PortFuture<'_, Vec<Message>>;

    /// Lists all message records.
    fn list(&self) -> PortFuture<'_, Vec<Message>>;

    /// Sets the status of a message and refreshes `updated_at`.
    fn update_status(&self, id: MessageId, status: MessageStatus) -> PortFuture<'_, ()>;

    /// Increments the retry counter and refreshes `updated_at`.
    fn increment_retry_count(&self, id: MessageId) -> PortFuture<'_, ()>;

    /// Finds `processing` records whose `updated_at` is before `cutoff`.
    fn find_stale_processing(&self, cutoff: DateTime<Utc>) -> PortFuture<'_, Vec<Message>>;

    /// Cheap connectivity probe.
    fn ping(&self) -> PortFuture<'_, ()>;
}

/// Contract over the broker (Q) and its main/retry/dead-letter topology.
///
/// Routing is always explicit: the consumer republishes to the retry or
/// dead-letter queue itself rather than relying on broker-side nacks, so
/// every routing decision stays in one place.
pub trait MessageQueue: Send + Sync + 'static {
    /// Publishes a payload onto the main queue with persistent delivery.
    fn publish(&self, message: &QueueMessage) -> PortFuture<'_, ()>;

    /// Blocks until the next main-queue delivery; `None` once the channel
    /// is closed.
    fn receive(&self) -> PortFuture<'_, Option<Delivery>>;

    /// Acknowledges a delivery with the broker.
    fn ack(&self, delivery: &Delivery) -> PortFuture<'_, ()>;

    /// Republishes a delivery onto the retry queue (TTL-delayed return).
    fn send_to_retry(&self, delivery: &Delivery) -> PortFuture<'_, ()>;

    /// Routes a delivery to the dead-letter queue.
    fn send_to_dead_letter(&self, delivery: &Delivery) -> PortFuture<'_, ()>;

    /// Current dead-letter queue depth, for health and alerting.
    fn dead_letter_count(&self) -> PortFuture<'_, u32>;
}

/// Contract over the deduplication cache (I).
///
/// Keys are the raw id strings carried on queue payloads; the check runs
/// before id validation so duplicate redeliveries never touch the store.
pub trait IdempotencyStore: Send + Sync + 'static {
    /// Whether the id was already processed.
    fn is_processed(&self, message_id: &str) -> PortFuture<'_, bool>;

    /// Marks the id processed (24-hour TTL).
    fn mark_processed(&self, message_id: &str) -> PortFuture<'_, ()>;

    /// Retains the webhook-assigned id for later reconciliation.
    fn store_webhook_message_id(
        &self,
        message_id: &str,
        webhook_message_id: &str,
        ttl: Duration,
    ) -> PortFuture<'_, ()>;

    /// Cheap connectivity probe.
    fn ping(&self) -> PortFuture<'_, ()>;
}

/// Response returned by the external webhook (W).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookResponse {
    /// Human-readable acknowledgement from the webhook.
    #[serde(default)]
    pub message: String,
    /// Webhook-assigned message id, when provided.
    #[serde(rename = "messageId", default)]
    pub message_id: Option<String>,
}

/// Contract over the external webhook client (W).
pub trait WebhookClient: Send + Sync + 'static {
    /// Delivers `(content, to)` to the webhook under the outbound guard.
    fn send(&self, content: &str, to: &str) -> PortFuture<'_, WebhookResponse>;
}
