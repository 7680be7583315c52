//! Consumer processor.
//!
//! Drains the main queue one delivery at a time and drives each message to
//! a terminal state. The delivery is acknowledged before any work happens:
//! recovery never relies on broker redelivery (which loops forever on
//! poison messages) but on the explicit retry queue and the staleness
//! sweeper. A crash after the ack leaves a `processing` row the sweeper
//! reconciles.
//!
//! Per delivery:
//!
//! 1. ack
//! 2. decode — malformed payloads go straight to the dead-letter queue
//! 3. idempotency check on the raw id — hits become `duplicate` without
//!    touching the store
//! 4. id validation — invalid ids are poison, dead-letter queue
//! 5. load from the store — transient failures go to the retry queue
//! 6. policy gate — exhausted or stale records become `failed` + dlq
//! 7. webhook call under the outbound guard
//! 8. on failure: bump the retry counter, refresh `processing`, and route
//!    to retry or dlq depending on the remaining budget

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use courier_core::{
    error::{CourierError, Result},
    models::{Delivery, Message, MessageId, MessageStatus, QueueMessage},
    policy::{ProcessDecision, ProcessingPolicy},
    ports::{IdempotencyStore, MessageQueue, MessageRepository, WebhookClient, WebhookResponse},
};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Retention for webhook-assigned ids kept for reconciliation.
const WEBHOOK_MESSAGE_ID_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Pause after a broker receive error before polling again.
const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Counters for processed deliveries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessorStats {
    /// Deliveries taken from the main queue.
    pub deliveries: u64,
    /// Messages delivered to the webhook and marked `sent`.
    pub sent: u64,
    /// Redeliveries resolved as `duplicate`.
    pub duplicates: u64,
    /// Deliveries routed to the retry queue.
    pub retried: u64,
    /// Deliveries routed to the dead-letter queue.
    pub dead_lettered: u64,
}

/// The consumer loop and its per-delivery pipeline.
pub struct Processor {
    repository: Arc<dyn MessageRepository>,
    queue: Arc<dyn MessageQueue>,
    idempotency: Arc<dyn IdempotencyStore>,
    webhook: Arc<dyn WebhookClient>,
    policy: ProcessingPolicy,
    stats: RwLock<ProcessorStats>,
}

impl Processor {
    /// Creates a processor over the given collaborators.
    pub fn new(
        repository: Arc<dyn MessageRepository>,
        queue: Arc<dyn MessageQueue>,
        idempotency: Arc<dyn IdempotencyStore>,
        webhook: Arc<dyn WebhookClient>,
        policy: ProcessingPolicy,
    ) -> Self {
        Self { repository, queue, idempotency, webhook, policy, stats: RwLock::default() }
    }

    /// Consumes the main queue until cancelled or the channel closes.
    ///
    /// A single delivery's failure never kills the loop; it is logged and
    /// the next delivery is processed.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!("message processor started");

        loop {
            tokio::select! {
                received = self.queue.receive() => match received {
                    Ok(Some(delivery)) => {
                        if let Err(err) = self.process_delivery(delivery).await {
                            warn!(error = %err, "delivery left unresolved");
                        }
                    }
                    Ok(None) => {
                        info!("delivery channel closed");
                        break;
                    }
                    Err(err) => {
                        error!(error = %err, "failed to receive from broker");
                        tokio::select! {
                            () = tokio::time::sleep(RECEIVE_ERROR_BACKOFF) => {}
                            () = shutdown.cancelled() => break,
                        }
                    }
                },
                () = shutdown.cancelled() => break,
            }
        }

        info!("message processor stopped");
    }

    /// Processes a single delivery through the lifecycle pipeline.
    ///
    /// # Errors
    ///
    /// Returns an error when the delivery could not be brought to a
    /// resolution (it has then been routed to retry or dlq as far as
    /// possible); callers log and continue.
    pub async fn process_delivery(&self, delivery: Delivery) -> Result<()> {
        // Ack first. Synthetic deliveries (tag 0) were never on the broker.
        if delivery.delivery_tag > 0 {
            if let Err(err) = self.queue.ack(&delivery).await {
                warn!(error = %err, tag = delivery.delivery_tag, "failed to ack delivery");
            }
        }
        self.stats.write().await.deliveries += 1;

        let payload = match QueueMessage::from_bytes(&delivery.body) {
            Ok(payload) => payload,
            Err(err) => return self.handle_malformed(&delivery, err).await,
        };

        match self.idempotency.is_processed(&payload.id).await {
            Ok(true) => return self.handle_duplicate(&payload).await,
            Ok(false) => {},
            Err(err) => return self.handle_transient(&delivery, &payload.id, err).await,
        }

        let message_id = match MessageId::parse(&payload.id) {
            Ok(id) => id,
            Err(err) => return self.handle_poison(&delivery, err).await,
        };

        let message = match self.repository.find_by_id(message_id).await {
            Ok(Some(message)) => message,
            Ok(None) => {
                return self
                    .handle_poison(&delivery, CourierError::not_found(payload.id.clone()))
                    .await
            },
            Err(err) => return self.handle_transient(&delivery, &payload.id, err).await,
        };

        match self.policy.evaluate(message.retry_count, message.updated_at, Utc::now()) {
            ProcessDecision::Exhausted => {
                return self.handle_terminal(&delivery, &message, "retry budget spent").await
            },
            ProcessDecision::Stale => {
                return self.handle_terminal(&delivery, &message, "stale in processing").await
            },
            ProcessDecision::Process => {},
        }

        match self.webhook.send(&message.content, &message.to).await {
            Ok(response) => self.handle_delivered(&message, response).await,
            Err(err) => self.handle_webhook_failure(&delivery, &message, err).await,
        }
    }

    /// Current processing counters.
    pub async fn stats(&self) -> ProcessorStats {
        *self.stats.read().await
    }

    async fn handle_malformed(&self, delivery: &Delivery, err: CourierError) -> Result<()> {
        warn!(error = %err, "undecodable delivery, routing to dead-letter queue");
        if let Err(route_err) = self.queue.send_to_dead_letter(delivery).await {
            error!(error = %route_err, "failed to dead-letter malformed delivery");
        }
        self.stats.write().await.dead_lettered += 1;
        Err(err)
    }

    async fn handle_poison(&self, delivery: &Delivery, err: CourierError) -> Result<()> {
        warn!(error = %err, "poison delivery, routing to dead-letter queue");
        if let Err(route_err) = self.queue.send_to_dead_letter(delivery).await {
            error!(error = %route_err, "failed to dead-letter poison delivery");
        }
        self.stats.write().await.dead_lettered += 1;
        Err(err)
    }

    async fn handle_duplicate(&self, payload: &QueueMessage) -> Result<()> {
        let message_id = MessageId::parse(&payload.id)?;
        self.repository.update_status(message_id, MessageStatus::Duplicate).await?;
        self.stats.write().await.duplicates += 1;
        info!(message_id = %payload.id, "redelivery of processed message marked duplicate");
        Ok(())
    }

    async fn handle_transient(
        &self,
        delivery: &Delivery,
        message_id: &str,
        err: CourierError,
    ) -> Result<()> {
        warn!(
            message_id = %message_id,
            error = %err,
            "transient failure, routing delivery to retry queue"
        );
        self.queue.send_to_retry(delivery).await?;
        self.stats.write().await.retried += 1;
        Err(err)
    }

    async fn handle_terminal(
        &self,
        delivery: &Delivery,
        message: &Message,
        reason: &str,
    ) -> Result<()> {
        warn!(message_id = %message.id, reason, "message is terminal, routing to dead-letter queue");
        if let Err(err) = self.queue.send_to_dead_letter(delivery).await {
            error!(error = %err, "failed to dead-letter terminal message");
        }
        self.repository.update_status(message.id, MessageStatus::Failed).await?;
        self.stats.write().await.dead_lettered += 1;
        Ok(())
    }

    async fn handle_delivered(&self, message: &Message, response: WebhookResponse) -> Result<()> {
        let id = message.id.to_hex();

        match response.message_id.as_deref() {
            Some(webhook_id) if !webhook_id.is_empty() => {
                // Retained for reconciliation only; losing it is not worth
                // failing the delivery over.
                if let Err(err) = self
                    .idempotency
                    .store_webhook_message_id(&id, webhook_id, WEBHOOK_MESSAGE_ID_TTL)
                    .await
                {
                    warn!(message_id = %id, error = %err, "failed to retain webhook-assigned id");
                }
            },
            _ => debug!(message_id = %id, "webhook did not assign a message id"),
        }

        // Mark-then-update: if the process dies between these two writes
        // the row stays `processing` and the sweeper resolves it; a crash
        // before the mark can cause one extra webhook call on redelivery,
        // the acknowledged at-least-once seam.
        self.idempotency.mark_processed(&id).await?;
        self.repository.update_status(message.id, MessageStatus::Sent).await?;
        self.stats.write().await.sent += 1;
        info!(message_id = %id, "message delivered");
        Ok(())
    }

    async fn handle_webhook_failure(
        &self,
        delivery: &Delivery,
        message: &Message,
        err: CourierError,
    ) -> Result<()> {
        warn!(
            message_id = %message.id,
            attempt = message.retry_count + 1,
            error = %err,
            "webhook delivery failed"
        );

        self.repository.increment_retry_count(message.id).await?;
        self.repository.update_status(message.id, MessageStatus::Processing).await?;

        let updated = self
            .repository
            .find_by_id(message.id)
            .await?
            .ok_or_else(|| CourierError::not_found(message.id.to_hex()))?;

        if updated.retry_count >= self.policy.max_retries() {
            return self.handle_terminal(delivery, &updated, "retry budget spent").await;
        }

        self.queue.send_to_retry(delivery).await?;
        self.stats.write().await.retried += 1;
        debug!(
            message_id = %message.id,
            retry_count = updated.retry_count,
            "delivery parked on retry queue"
        );
        Ok(())
    }
}
