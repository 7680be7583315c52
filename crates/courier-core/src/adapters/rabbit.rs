//! RabbitMQ queue topology and adapter.
//!
//! Three durable queues wired so that time-based retry needs no in-process
//! timer:
//!
//! ```text
//!                 messages.exchange
//!                        │
//!                        ▼
//!   ┌─────────────── messages ───────────────┐
//!   │  x-dead-letter → messages.retry.exchange │
//!   └──────────────────────────────────────────┘
//!                        ▲
//!         TTL expiry dead-letters back
//!                        │
//!   ┌──────────── messages.retry ─────────────┐
//!   │  x-message-ttl = retry interval          │
//!   │  x-dead-letter → messages.exchange       │
//!   └──────────────────────────────────────────┘
//!
//!            messages.dlq   (terminal bin, no consumer)
//! ```
//!
//! The engine still publishes to retry and dlq explicitly; the broker-side
//! dead-letter wiring only provides the delayed reappearance on the main
//! queue.

use bytes::Bytes;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind,
};
use tokio::sync::Mutex;

use crate::{
    error::{CourierError, Result},
    models::{Delivery, QueueMessage},
    ports::{MessageQueue, PortFuture},
};

/// Main queue name.
pub const MAIN_QUEUE: &str = "messages";
/// Retry queue name.
pub const RETRY_QUEUE: &str = "messages.retry";
/// Dead-letter queue name.
pub const DLQ_QUEUE: &str = "messages.dlq";
/// Main exchange name.
pub const MAIN_EXCHANGE: &str = "messages.exchange";
/// Retry exchange name.
pub const RETRY_EXCHANGE: &str = "messages.retry.exchange";

const CONSUMER_TAG: &str = "courier-processor";
const CONTENT_TYPE_JSON: &str = "application/json";
const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// RabbitMQ implementation of [`MessageQueue`].
pub struct RabbitMessageQueue {
    // Held so the channel outlives this adapter.
    _connection: Connection,
    channel: Channel,
    consumer: Mutex<Option<Consumer>>,
}

impl RabbitMessageQueue {
    /// Connects to the broker and declares the full topology.
    ///
    /// `retry_delay` becomes the retry queue's per-queue TTL.
    ///
    /// # Errors
    ///
    /// Returns `CourierError::Queue` when the connection, channel, or any
    /// declaration fails.
    pub async fn connect(uri: &str, retry_delay: std::time::Duration) -> Result<Self> {
        let connection = Connection::connect(uri, ConnectionProperties::default())
            .await
            .map_err(|e| CourierError::queue(format!("failed to connect to RabbitMQ: {e}")))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| CourierError::queue(format!("failed to open channel: {e}")))?;

        declare_topology(&channel, retry_delay).await?;

        Ok(Self { _connection: connection, channel, consumer: Mutex::new(None) })
    }

    // Publishes never block past the shared operation deadline; only the
    // consuming receive is allowed to wait indefinitely.
    async fn publish_raw(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        content_type: &str,
    ) -> Result<()> {
        super::with_deadline(async {
            let properties = BasicProperties::default()
                .with_content_type(content_type.into())
                .with_delivery_mode(DELIVERY_MODE_PERSISTENT);

            let confirm = self
                .channel
                .basic_publish(
                    exchange,
                    routing_key,
                    BasicPublishOptions::default(),
                    body,
                    properties,
                )
                .await
                .map_err(|e| {
                    CourierError::queue(format!("publish to {routing_key} failed: {e}"))
                })?;
            confirm
                .await
                .map_err(|e| {
                    CourierError::queue(format!("publish to {routing_key} failed: {e}"))
                })?;
            Ok(())
        })
        .await
    }
}

impl MessageQueue for RabbitMessageQueue {
    fn publish(&self, message: &QueueMessage) -> PortFuture<'_, ()> {
        let encoded = message.to_bytes();
        Box::pin(async move {
            let body = encoded?;
            self.publish_raw(MAIN_EXCHANGE, MAIN_QUEUE, &body, CONTENT_TYPE_JSON).await
        })
    }

    fn receive(&self) -> PortFuture<'_, Option<Delivery>> {
        Box::pin(async move {
            let mut guard = self.consumer.lock().await;
            if guard.is_none() {
                let consumer = self
                    .channel
                    .basic_consume(
                        MAIN_QUEUE,
                        CONSUMER_TAG,
                        BasicConsumeOptions::default(),
                        FieldTable::default(),
                    )
                    .await
                    .map_err(|e| CourierError::queue(format!("consume failed: {e}")))?;
                *guard = Some(consumer);
            }

            let Some(consumer) = guard.as_mut() else {
                return Ok(None);
            };
            match consumer.next().await {
                Some(Ok(delivery)) => {
                    let content_type = delivery
                        .properties
                        .content_type()
                        .as_ref()
                        .map_or(CONTENT_TYPE_JSON, |ct| ct.as_str())
                        .to_string();
                    Ok(Some(Delivery::new(
                        Bytes::from(delivery.data),
                        content_type,
                        delivery.delivery_tag,
                    )))
                },
                Some(Err(e)) => Err(CourierError::queue(format!("delivery failed: {e}"))),
                None => Ok(None),
            }
        })
    }

    fn ack(&self, delivery: &Delivery) -> PortFuture<'_, ()> {
        let tag = delivery.delivery_tag;
        Box::pin(async move {
            super::with_deadline(async {
                self.channel
                    .basic_ack(tag, BasicAckOptions::default())
                    .await
                    .map_err(|e| CourierError::queue(format!("ack failed: {e}")))
            })
            .await
        })
    }

    fn send_to_retry(&self, delivery: &Delivery) -> PortFuture<'_, ()> {
        let body = delivery.body.clone();
        let content_type = delivery.content_type.clone();
        Box::pin(async move {
            self.publish_raw(RETRY_EXCHANGE, RETRY_QUEUE, &body, &content_type).await
        })
    }

    fn send_to_dead_letter(&self, delivery: &Delivery) -> PortFuture<'_, ()> {
        let body = delivery.body.clone();
        let content_type = delivery.content_type.clone();
        // The dlq is not bound to an exchange; publish through the default
        // exchange straight at the queue.
        Box::pin(async move { self.publish_raw("", DLQ_QUEUE, &body, &content_type).await })
    }

    fn dead_letter_count(&self) -> PortFuture<'_, u32> {
        Box::pin(async move {
            super::with_deadline(async {
                let queue = self
                    .channel
                    .queue_declare(
                        DLQ_QUEUE,
                        QueueDeclareOptions { passive: true, ..QueueDeclareOptions::default() },
                        FieldTable::default(),
                    )
                    .await
                    .map_err(|e| CourierError::queue(format!("dlq inspect failed: {e}")))?;
                Ok(queue.message_count())
            })
            .await
        })
    }
}

async fn declare_topology(channel: &Channel, retry_delay: std::time::Duration) -> Result<()> {
    let durable = ExchangeDeclareOptions { durable: true, ..ExchangeDeclareOptions::default() };
    for exchange in [MAIN_EXCHANGE, RETRY_EXCHANGE] {
        channel
            .exchange_declare(exchange, ExchangeKind::Direct, durable, FieldTable::default())
            .await
            .map_err(|e| CourierError::queue(format!("declare {exchange} failed: {e}")))?;
    }

    let durable_queue = QueueDeclareOptions { durable: true, ..QueueDeclareOptions::default() };

    // Main queue: broker-level rejections dead-letter into the retry flow.
    let mut main_args = FieldTable::default();
    main_args.insert("x-dead-letter-exchange".into(), AMQPValue::LongString(RETRY_EXCHANGE.into()));
    main_args.insert("x-dead-letter-routing-key".into(), AMQPValue::LongString(RETRY_QUEUE.into()));
    channel
        .queue_declare(MAIN_QUEUE, durable_queue, main_args)
        .await
        .map_err(|e| CourierError::queue(format!("declare {MAIN_QUEUE} failed: {e}")))?;

    // Retry queue: TTL expiry dead-letters back onto the main queue, which
    // is the engine's only retry timer.
    let ttl_ms = i32::try_from(retry_delay.as_millis()).unwrap_or(i32::MAX);
    let mut retry_args = FieldTable::default();
    retry_args.insert("x-message-ttl".into(), AMQPValue::LongInt(ttl_ms));
    retry_args.insert("x-dead-letter-exchange".into(), AMQPValue::LongString(MAIN_EXCHANGE.into()));
    retry_args.insert("x-dead-letter-routing-key".into(), AMQPValue::LongString(MAIN_QUEUE.into()));
    channel
        .queue_declare(RETRY_QUEUE, durable_queue, retry_args)
        .await
        .map_err(|e| CourierError::queue(format!("declare {RETRY_QUEUE} failed: {e}")))?;

    channel
        .queue_declare(DLQ_QUEUE, durable_queue, FieldTable::default())
        .await
        .map_err(|e| CourierError::queue(format!("declare {DLQ_QUEUE} failed: {e}")))?;

    channel
        .queue_bind(
            MAIN_QUEUE,
            MAIN_EXCHANGE,
            MAIN_QUEUE,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|e| CourierError::queue(format!("bind {MAIN_QUEUE} failed: {e}")))?;
    channel
        .queue_bind(
            RETRY_QUEUE,
            RETRY_EXCHANGE,
            RETRY_QUEUE,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|e| CourierError::queue(format!("bind {RETRY_QUEUE} failed: {e}")))?;

    Ok(())
}
