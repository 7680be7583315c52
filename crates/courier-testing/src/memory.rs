//! In-memory implementations of the core ports.
//!
//! Deterministic stand-ins for MongoDB, Redis, and RabbitMQ. Each supports
//! injecting a one-shot failure so tests can exercise the transient-error
//! paths, and exposes verification helpers for assertions.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use courier_core::{
    error::{CourierError, Result},
    models::{Delivery, Message, MessageId, MessageStatus, QueueMessage},
    ports::{IdempotencyStore, MessageQueue, MessageRepository, PortFuture},
    IdempotencyRecord,
};
use tokio::sync::{mpsc, Mutex, RwLock};

/// In-memory message repository.
#[derive(Default)]
pub struct InMemoryRepository {
    messages: RwLock<HashMap<MessageId, Message>>,
    insertion_order: RwLock<Vec<MessageId>>,
    fail_next: Mutex<Option<String>>,
}

impl InMemoryRepository {
    /// Creates an empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a message record directly, bypassing the port.
    pub async fn insert(&self, message: Message) {
        self.insertion_order.write().await.push(message.id);
        self.messages.write().await.insert(message.id, message);
    }

    /// Reads a record directly for assertions.
    pub async fn get(&self, id: MessageId) -> Option<Message> {
        self.messages.read().await.get(&id).cloned()
    }

    /// Makes the next repository operation fail with a storage error.
    pub async fn fail_next_operation(&self, message: impl Into<String>) {
        *self.fail_next.lock().await = Some(message.into());
    }

    async fn check_failure(&self) -> Result<()> {
        if let Some(message) = self.fail_next.lock().await.take() {
            return Err(CourierError::storage(message));
        }
        Ok(())
    }
}

impl MessageRepository for InMemoryRepository {
    fn create(&self, message: &Message) -> PortFuture<'_, ()> {
        let message = message.clone();
        Box::pin(async move {
            self.check_failure().await?;
            self.insert(message).await;
            Ok(())
        })
    }

    fn find_by_id(&self, id: MessageId) -> PortFuture<'_, Option<Message>> {
        Box::pin(async move {
            self.check_failure().await?;
            Ok(self.messages.read().await.get(&id).cloned())
        })
    }

    fn find_unsent(&self, limit: usize) -> PortFuture<'_, Vec<Message>> {
        Box::pin(async move {
            self.check_failure().await?;
            let order = self.insertion_order.read().await;
            let messages = self.messages.read().await;
            Ok(order
                .iter()
                .filter_map(|id| messages.get(id))
                .filter(|m| m.status == MessageStatus::Unsent)
                .take(limit)
                .cloned()
                .collect())
        })
    }

    fn list(&self) -> PortFuture<'_, Vec<Message>> {
        Box::pin(async move {
            self.check_failure().await?;
            let order = self.insertion_order.read().await;
            let messages = self.messages.read().await;
            Ok(order.iter().filter_map(|id| messages.get(id)).cloned().collect())
        })
    }

    fn update_status(&self, id: MessageId, status: MessageStatus) -> PortFuture<'_, ()> {
        Box::pin(async move {
            self.check_failure().await?;
            if let Some(message) = self.messages.write().await.get_mut(&id) {
                message.status = status;
                message.updated_at = Utc::now();
            }
            Ok(())
        })
    }

    fn increment_retry_count(&self, id: MessageId) -> PortFuture<'_, ()> {
        Box::pin(async move {
            self.check_failure().await?;
            if let Some(message) = self.messages.write().await.get_mut(&id) {
                message.retry_count += 1;
                message.updated_at = Utc::now();
            }
            Ok(())
        })
    }

    fn find_stale_processing(&self, cutoff: DateTime<Utc>) -> PortFuture<'_, Vec<Message>> {
        Box::pin(async move {
            self.check_failure().await?;
            Ok(self
                .messages
                .read()
                .await
                .values()
                .filter(|m| m.status == MessageStatus::Processing && m.updated_at < cutoff)
                .cloned()
                .collect())
        })
    }

    fn ping(&self) -> PortFuture<'_, ()> {
        Box::pin(async move { self.check_failure().await })
    }
}

/// In-memory idempotency store.
#[derive(Default)]
pub struct InMemoryIdempotencyStore {
    processed: RwLock<HashMap<String, String>>,
    webhook_ids: RwLock<HashMap<String, String>>,
    fail_next: Mutex<Option<String>>,
    fail_next_mark: Mutex<Option<String>>,
}

impl InMemoryIdempotencyStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks an id as processed directly, bypassing the port.
    pub async fn seed_processed(&self, message_id: &str) {
        let record = IdempotencyRecord::processed(Utc::now());
        let payload = serde_json::to_string(&record).expect("marker serializes");
        self.processed.write().await.insert(message_id.to_string(), payload);
    }

    /// The raw stored marker for an id, if any.
    pub async fn processed_record(&self, message_id: &str) -> Option<String> {
        self.processed.read().await.get(message_id).cloned()
    }

    /// The stored webhook-assigned id, if any.
    pub async fn webhook_id(&self, message_id: &str) -> Option<String> {
        self.webhook_ids.read().await.get(message_id).cloned()
    }

    /// Makes the next store operation fail with a cache error.
    pub async fn fail_next_operation(&self, message: impl Into<String>) {
        *self.fail_next.lock().await = Some(message.into());
    }

    /// Makes the next `mark_processed` call (only) fail with a cache error.
    pub async fn fail_next_mark(&self, message: impl Into<String>) {
        *self.fail_next_mark.lock().await = Some(message.into());
    }

    async fn check_failure(&self) -> Result<()> {
        if let Some(message) = self.fail_next.lock().await.take() {
            return Err(CourierError::cache(message));
        }
        Ok(())
    }
}

impl IdempotencyStore for InMemoryIdempotencyStore {
    fn is_processed(&self, message_id: &str) -> PortFuture<'_, bool> {
        let key = message_id.to_string();
        Box::pin(async move {
            self.check_failure().await?;
            Ok(self.processed.read().await.contains_key(&key))
        })
    }

    fn mark_processed(&self, message_id: &str) -> PortFuture<'_, ()> {
        let key = message_id.to_string();
        Box::pin(async move {
            self.check_failure().await?;
            if let Some(message) = self.fail_next_mark.lock().await.take() {
                return Err(CourierError::cache(message));
            }
            let record = IdempotencyRecord::processed(Utc::now());
            let payload = serde_json::to_string(&record)
                .map_err(|e| CourierError::cache(e.to_string()))?;
            self.processed.write().await.insert(key, payload);
            Ok(())
        })
    }

    fn store_webhook_message_id(
        &self,
        message_id: &str,
        webhook_message_id: &str,
        _ttl: Duration,
    ) -> PortFuture<'_, ()> {
        let key = message_id.to_string();
        let value = webhook_message_id.to_string();
        Box::pin(async move {
            self.check_failure().await?;
            self.webhook_ids.write().await.insert(key, value);
            Ok(())
        })
    }

    fn ping(&self) -> PortFuture<'_, ()> {
        Box::pin(async move { self.check_failure().await })
    }
}

/// In-memory broker with main/retry/dead-letter routing.
///
/// The main queue is a channel the consumer blocks on. Retried deliveries
/// park in a buffer until the test calls [`InMemoryQueue::release_retries`],
/// which plays the role of the broker-side TTL expiry.
pub struct InMemoryQueue {
    main_tx: mpsc::UnboundedSender<Delivery>,
    main_rx: Mutex<mpsc::UnboundedReceiver<Delivery>>,
    retries: RwLock<Vec<Delivery>>,
    dead_letters: RwLock<Vec<Delivery>>,
    published: RwLock<Vec<QueueMessage>>,
    acked_tags: RwLock<Vec<u64>>,
    next_tag: AtomicU64,
    fail_next_publish: Mutex<Option<String>>,
    fail_next_dead_letter: Mutex<Option<String>>,
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        let (main_tx, main_rx) = mpsc::unbounded_channel();
        Self {
            main_tx,
            main_rx: Mutex::new(main_rx),
            retries: RwLock::new(Vec::new()),
            dead_letters: RwLock::new(Vec::new()),
            published: RwLock::new(Vec::new()),
            acked_tags: RwLock::new(Vec::new()),
            next_tag: AtomicU64::new(1),
            fail_next_publish: Mutex::new(None),
            fail_next_dead_letter: Mutex::new(None),
        }
    }

    /// Injects a delivery onto the main queue, as a broker redelivery would.
    pub fn inject(&self, message: &QueueMessage) -> Delivery {
        let delivery = Delivery::new(
            message.to_bytes().expect("queue message encodes"),
            "application/json",
            self.next_tag.fetch_add(1, Ordering::Relaxed),
        );
        let _ = self.main_tx.send(delivery.clone());
        delivery
    }

    /// Injects raw bytes onto the main queue (malformed-payload tests).
    pub fn inject_raw(&self, body: &'static [u8]) -> Delivery {
        let delivery = Delivery::new(
            Bytes::from_static(body),
            "application/json",
            self.next_tag.fetch_add(1, Ordering::Relaxed),
        );
        let _ = self.main_tx.send(delivery.clone());
        delivery
    }

    /// Moves every parked retry back onto the main queue, simulating the
    /// retry queue's TTL expiry. Returns how many were released.
    pub async fn release_retries(&self) -> usize {
        let mut retries = self.retries.write().await;
        let released = retries.len();
        for delivery in retries.drain(..) {
            let _ = self.main_tx.send(delivery);
        }
        released
    }

    /// Deliveries currently parked on the retry queue.
    pub async fn retry_depth(&self) -> usize {
        self.retries.read().await.len()
    }

    /// Snapshot of the dead-letter queue.
    pub async fn dead_letters(&self) -> Vec<Delivery> {
        self.dead_letters.read().await.clone()
    }

    /// Payloads published to the main queue via the port.
    pub async fn published(&self) -> Vec<QueueMessage> {
        self.published.read().await.clone()
    }

    /// Tags acknowledged so far.
    pub async fn acked_tags(&self) -> Vec<u64> {
        self.acked_tags.read().await.clone()
    }

    /// Makes the next publish fail with a queue error.
    pub async fn fail_next_publish(&self, message: impl Into<String>) {
        *self.fail_next_publish.lock().await = Some(message.into());
    }

    /// Makes the next dead-letter routing fail with a queue error.
    pub async fn fail_next_dead_letter(&self, message: impl Into<String>) {
        *self.fail_next_dead_letter.lock().await = Some(message.into());
    }

    /// Pops the next main-queue delivery, panicking when the queue is
    /// empty. Test-side shortcut around the blocking port method.
    pub async fn receive_now(&self) -> Delivery {
        self.main_rx
            .lock()
            .await
            .try_recv()
            .expect("expected a delivery on the main queue")
    }
}

impl MessageQueue for InMemoryQueue {
    fn publish(&self, message: &QueueMessage) -> PortFuture<'_, ()> {
        let message = message.clone();
        Box::pin(async move {
            if let Some(error) = self.fail_next_publish.lock().await.take() {
                return Err(CourierError::queue(error));
            }
            self.published.write().await.push(message.clone());
            self.inject(&message);
            Ok(())
        })
    }

    fn receive(&self) -> PortFuture<'_, Option<Delivery>> {
        Box::pin(async move {
            let mut rx = self.main_rx.lock().await;
            Ok(rx.recv().await)
        })
    }

    fn ack(&self, delivery: &Delivery) -> PortFuture<'_, ()> {
        let tag = delivery.delivery_tag;
        Box::pin(async move {
            self.acked_tags.write().await.push(tag);
            Ok(())
        })
    }

    fn send_to_retry(&self, delivery: &Delivery) -> PortFuture<'_, ()> {
        let delivery = delivery.clone();
        Box::pin(async move {
            self.retries.write().await.push(delivery);
            Ok(())
        })
    }

    fn send_to_dead_letter(&self, delivery: &Delivery) -> PortFuture<'_, ()> {
        let delivery = delivery.clone();
        Box::pin(async move {
            if let Some(error) = self.fail_next_dead_letter.lock().await.take() {
                return Err(CourierError::queue(error));
            }
            self.dead_letters.write().await.push(delivery);
            Ok(())
        })
    }

    fn dead_letter_count(&self) -> PortFuture<'_, u32> {
        Box::pin(async move {
            Ok(u32::try_from(self.dead_letters.read().await.len()).unwrap_or(u32::MAX))
        })
    }
}

/// Shared handles used by most engine tests.
pub struct TestPorts {
    /// The in-memory repository.
    pub repository: Arc<InMemoryRepository>,
    /// The in-memory queue.
    pub queue: Arc<InMemoryQueue>,
    /// The in-memory idempotency store.
    pub idempotency: Arc<InMemoryIdempotencyStore>,
}

impl Default for TestPorts {
    fn default() -> Self {
        Self::new()
    }
}

impl TestPorts {
    /// Creates a fresh set of in-memory ports.
    pub fn new() -> Self {
        Self {
            repository: Arc::new(InMemoryRepository::new()),
            queue: Arc::new(InMemoryQueue::new()),
            idempotency: Arc::new(InMemoryIdempotencyStore::new()),
        }
    }
}
