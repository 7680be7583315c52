//! Domain models and strongly-typed identifiers.
//!
//! Defines the persisted `Message` record, its status state machine, the
//! broker wire payload, and the deduplication cache record. The durable
//! store is authoritative for everything here; the `retry` field carried on
//! the wire is advisory only.

use std::fmt;

use bson::oid::ObjectId;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{CourierError, Result};

/// Strongly-typed message identifier.
///
/// Wraps a 12-byte object id and travels as its 24-hex-character string
/// form on every external surface (HTTP responses, queue payloads, cache
/// keys). Stable for the lifetime of a message and used as the idempotency
/// key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId(pub ObjectId);

impl MessageId {
    /// Creates a new random message id.
    pub fn new() -> Self {
        Self(ObjectId::new())
    }

    /// Parses a 24-hex-character id string.
    ///
    /// # Errors
    ///
    /// Returns `CourierError::InvalidId` when the value is not 24 hex
    /// characters.
    pub fn parse(value: &str) -> Result<Self> {
        ObjectId::parse_str(value)
            .map(Self)
            .map_err(|_| CourierError::invalid_id(value))
    }

    /// The 24-hex-character string form.
    pub fn to_hex(&self) -> String {
        self.0.to_hex()
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_hex())
    }
}

impl From<ObjectId> for MessageId {
    fn from(oid: ObjectId) -> Self {
        Self(oid)
    }
}

// On JSON surfaces the id is a plain hex string, not a structured ObjectId.
impl Serialize for MessageId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_hex())
    }
}

impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        ObjectId::parse_str(&value)
            .map(Self)
            .map_err(|_| serde::de::Error::custom(format!("invalid message id: {value}")))
    }
}

/// Message lifecycle status.
///
/// ```text
/// unsent -> processing -> sent
///                      -> failed     (exhausted, stale, or poison routing)
///                      -> duplicate  (idempotency hit on redelivery)
/// ```
///
/// `sent`, `failed`, and `duplicate` are terminal; a terminal record is
/// never mutated again by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Persisted but not yet handed to the broker.
    Unsent,
    /// Published to the broker; delivery is in flight or pending retry.
    Processing,
    /// Delivered to the webhook exactly once from this record's view.
    Sent,
    /// Exhausted, stale, or routed to the dead-letter queue.
    Failed,
    /// A redelivery arrived after the id was already processed.
    Duplicate,
}

impl MessageStatus {
    /// Whether this status is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Sent | Self::Failed | Self::Duplicate)
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unsent => write!(f, "unsent"),
            Self::Processing => write!(f, "processing"),
            Self::Sent => write!(f, "sent"),
            Self::Failed => write!(f, "failed"),
            Self::Duplicate => write!(f, "duplicate"),
        }
    }
}

/// Persisted message record, one per intake.
///
/// `updated_at` doubles as the staleness clock: it is refreshed on every
/// status or retry mutation and compared against the stale threshold by
/// both the consumer's policy gate and the sweeper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique identifier, stable for the message's lifetime.
    pub id: MessageId,
    /// Recipient address. Opaque to the engine.
    pub to: String,
    /// Payload. Opaque to the engine.
    pub content: String,
    /// Current lifecycle status.
    pub status: MessageStatus,
    /// Number of failed webhook attempts counted so far.
    pub retry_count: u32,
    /// Set at intake, never mutated.
    pub created_at: DateTime<Utc>,
    /// Refreshed on every mutation; monotonic per message.
    pub updated_at: DateTime<Utc>,
}

impl Message {
    /// Creates a new unsent message at the given intake time.
    pub fn new(to: impl Into<String>, content: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: MessageId::new(),
            to: to.into(),
            content: content.into(),
            status: MessageStatus::Unsent,
            retry_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// The broker payload for this record.
    pub fn to_queue_message(&self) -> QueueMessage {
        QueueMessage {
            id: self.id.to_hex(),
            content: self.content.clone(),
            to: self.to.clone(),
            retry: self.retry_count,
        }
    }
}

/// Wire payload published to the broker.
///
/// The `retry` field is advisory; the authoritative counter lives in the
/// durable store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMessage {
    /// 24-hex message id.
    pub id: String,
    /// Payload.
    pub content: String,
    /// Recipient address.
    pub to: String,
    /// Retry count at publish time.
    pub retry: u32,
}

impl QueueMessage {
    /// Encodes the payload as JSON bytes for publication.
    ///
    /// # Errors
    ///
    /// Returns `CourierError::MalformedPayload` if serialization fails.
    pub fn to_bytes(&self) -> Result<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| CourierError::malformed_payload(e.to_string()))
    }

    /// Decodes a broker delivery body.
    ///
    /// # Errors
    ///
    /// Returns `CourierError::MalformedPayload` when the body is not the
    /// expected JSON shape.
    pub fn from_bytes(body: &[u8]) -> Result<Self> {
        serde_json::from_slice(body).map_err(|e| CourierError::malformed_payload(e.to_string()))
    }
}

/// Record stored in the deduplication cache under `inbox:<id>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    /// Marker value; always `"processed"` when written by the engine.
    pub status: String,
    /// Unix timestamp of the mark.
    pub timestamp: i64,
}

impl IdempotencyRecord {
    /// Marker literal used for processed messages.
    pub const PROCESSED: &'static str = "processed";

    /// Creates a processed marker at the given time.
    pub fn processed(now: DateTime<Utc>) -> Self {
        Self { status: Self::PROCESSED.to_string(), timestamp: now.timestamp() }
    }

    /// Whether the record marks the message as processed.
    pub fn is_processed(&self) -> bool {
        self.status == Self::PROCESSED
    }
}

/// A delivery taken from the broker, broker-agnostic.
///
/// A `delivery_tag` of zero marks a synthetic delivery (the sweeper emits
/// these when routing stale records to the dead-letter queue); synthetic
/// deliveries are never acknowledged.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Raw payload bytes as received.
    pub body: Bytes,
    /// Content type announced by the publisher.
    pub content_type: String,
    /// Broker acknowledgement tag; zero for synthetic deliveries.
    pub delivery_tag: u64,
}

impl Delivery {
    /// Creates a delivery from raw parts.
    pub fn new(body: Bytes, content_type: impl Into<String>, delivery_tag: u64) -> Self {
        Self { body, content_type: content_type.into(), delivery_tag }
    }
}
