//! Fixture builders for message records and broker deliveries.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use courier_core::models::{Delivery, Message, MessageStatus};

/// A fresh unsent message created now.
pub fn unsent_message(to: &str, content: &str) -> Message {
    Message::new(to, content, Utc::now())
}

/// A message in an arbitrary lifecycle position.
pub fn message_in_state(
    status: MessageStatus,
    retry_count: u32,
    updated_at: DateTime<Utc>,
) -> Message {
    let mut message = Message::new("+90111111111", "fixture", updated_at);
    message.status = status;
    message.retry_count = retry_count;
    message.updated_at = updated_at;
    message
}

/// A broker delivery carrying the message's queue payload.
pub fn delivery_for(message: &Message, tag: u64) -> Delivery {
    Delivery::new(
        message.to_queue_message().to_bytes().expect("queue message encodes"),
        "application/json",
        tag,
    )
}

/// A broker delivery with an arbitrary body.
pub fn raw_delivery(body: &[u8], tag: u64) -> Delivery {
    Delivery::new(Bytes::copy_from_slice(body), "application/json", tag)
}
