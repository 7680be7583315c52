//! MongoDB-backed message repository.
//!
//! Stores one document per message in the `messages` collection. Every
//! mutation refreshes `updated_at` server-side of the engine so the
//! staleness clock keeps moving even when the broker and store disagree.
//! All operations run under the repository's circuit breaker with a
//! per-operation deadline.

use std::{future::Future, sync::Arc};

use bson::{doc, oid::ObjectId, DateTime as BsonDateTime};
use futures_util::TryStreamExt;
use mongodb::{Client, Collection, Database};
use serde::{Deserialize, Serialize};

use super::with_deadline;
use crate::{
    error::{CourierError, Result},
    guard::{CircuitBreaker, CircuitConfig},
    models::{Message, MessageId, MessageStatus},
    ports::{MessageRepository, PortFuture},
};

const COLLECTION_NAME: &str = "messages";

/// Document shape persisted in MongoDB.
///
/// Kept separate from the domain [`Message`] so BSON concerns (ObjectId
/// `_id`, millisecond datetimes) never leak onto the JSON surfaces.
#[derive(Debug, Serialize, Deserialize)]
struct MessageDocument {
    #[serde(rename = "_id")]
    id: ObjectId,
    to: String,
    content: String,
    status: MessageStatus,
    retry_count: i64,
    created_at: BsonDateTime,
    updated_at: BsonDateTime,
}

impl From<&Message> for MessageDocument {
    fn from(message: &Message) -> Self {
        Self {
            id: message.id.0,
            to: message.to.clone(),
            content: message.content.clone(),
            status: message.status,
            retry_count: i64::from(message.retry_count),
            created_at: BsonDateTime::from_chrono(message.created_at),
            updated_at: BsonDateTime::from_chrono(message.updated_at),
        }
    }
}

impl MessageDocument {
    fn into_message(self) -> Message {
        Message {
            id: MessageId(self.id),
            to: self.to,
            content: self.content,
            status: self.status,
            retry_count: u32::try_from(self.retry_count).unwrap_or(0),
            created_at: self.created_at.to_chrono(),
            updated_at: self.updated_at.to_chrono(),
        }
    }
}

/// MongoDB implementation of [`MessageRepository`].
pub struct MongoMessageRepository {
    database: Database,
    collection: Collection<MessageDocument>,
    breaker: Arc<CircuitBreaker>,
}

impl MongoMessageRepository {
    /// Connects to MongoDB and binds the `messages` collection.
    ///
    /// # Errors
    ///
    /// Returns `CourierError::Storage` when the client cannot be built
    /// from the URI.
    pub async fn connect(uri: &str, database: &str) -> Result<Self> {
        let client = Client::with_uri_str(uri)
            .await
            .map_err(|e| CourierError::storage(format!("failed to connect to MongoDB: {e}")))?;
        let database = client.database(database);
        let collection = database.collection(COLLECTION_NAME);

        Ok(Self {
            database,
            collection,
            breaker: Arc::new(CircuitBreaker::new("mongodb-repository", CircuitConfig::default())),
        })
    }

    async fn guarded<T>(&self, op: impl Future<Output = Result<T>>) -> Result<T> {
        self.breaker.call(with_deadline(op)).await
    }

    fn status_filter(status: MessageStatus) -> bson::Document {
        doc! { "status": status.to_string() }
    }
}

impl MessageRepository for MongoMessageRepository {
    fn create(&self, message: &Message) -> PortFuture<'_, ()> {
        let document = MessageDocument::from(message);
        Box::pin(async move {
            self.guarded(async {
                self.collection
                    .insert_one(document)
                    .await
                    .map_err(|e| CourierError::storage(format!("insert failed: {e}")))?;
                Ok(())
            })
            .await
        })
    }

    fn find_by_id(&self, id: MessageId) -> PortFuture<'_, Option<Message>> {
        Box::pin(async move {
            self.guarded(async {
                let document = self
                    .collection
                    .find_one(doc! { "_id": id.0 })
                    .await
                    .map_err(|e| CourierError::storage(format!("find failed: {e}")))?;
                Ok(document.map(MessageDocument::into_message))
            })
            .await
        })
    }

    fn find_unsent(&self, limit: usize) -> PortFuture<'_, Vec<Message>> {
        Box::pin(async move {
            self.guarded(async {
                let cursor = self
                    .collection
                    .find(Self::status_filter(MessageStatus::Unsent))
                    .limit(i64::try_from(limit).unwrap_or(i64::MAX))
                    .await
                    .map_err(|e| CourierError::storage(format!("unsent scan failed: {e}")))?;
                let documents: Vec<MessageDocument> = cursor
                    .try_collect()
                    .await
                    .map_err(|e| CourierError::storage(format!("unsent scan failed: {e}")))?;
                Ok(documents.into_iter().map(MessageDocument::into_message).collect())
            })
            .await
        })
    }

    fn list(&self) -> PortFuture<'_, Vec<Message>> {
        Box::pin(async move {
            self.guarded(async {
                let cursor = self
                    .collection
                    .find(doc! {})
                    .await
                    .map_err(|e| CourierError::storage(format!("list failed: {e}")))?;
                let documents: Vec<MessageDocument> = cursor
                    .try_collect()
                    .await
                    .map_err(|e| CourierError::storage(format!("list failed: {e}")))?;
                Ok(documents.into_iter().map(MessageDocument::into_message).collect())
            })
            .await
        })
    }

    fn update_status(&self, id: MessageId, status: MessageStatus) -> PortFuture<'_, ()> {
        Box::pin(async move {
            self.guarded(async {
                self.collection
                    .update_one(
                        doc! { "_id": id.0 },
                        doc! { "$set": {
                            "status": status.to_string(),
                            "updated_at": BsonDateTime::now(),
                        }},
                    )
                    .await
                    .map_err(|e| CourierError::storage(format!("status update failed: {e}")))?;
                Ok(())
            })
            .await
        })
    }

    fn increment_retry_count(&self, id: MessageId) -> PortFuture<'_, ()> {
        Box::pin(async move {
            self.guarded(async {
                self.collection
                    .update_one(
                        doc! { "_id": id.0 },
                        doc! {
                            "$inc": { "retry_count": 1 },
                            "$set": { "updated_at": BsonDateTime::now() },
                        },
                    )
                    .await
                    .map_err(|e| CourierError::storage(format!("retry increment failed: {e}")))?;
                Ok(())
            })
            .await
        })
    }

    fn find_stale_processing(
        &self,
        cutoff: chrono::DateTime<chrono::Utc>,
    ) -> PortFuture<'_, Vec<Message>> {
        Box::pin(async move {
            self.guarded(async {
                let filter = doc! {
                    "status": MessageStatus::Processing.to_string(),
                    "updated_at": { "$lt": BsonDateTime::from_chrono(cutoff) },
                };
                let cursor = self
                    .collection
                    .find(filter)
                    .await
                    .map_err(|e| CourierError::storage(format!("stale scan failed: {e}")))?;
                let documents: Vec<MessageDocument> = cursor
                    .try_collect()
                    .await
                    .map_err(|e| CourierError::storage(format!("stale scan failed: {e}")))?;
                Ok(documents.into_iter().map(MessageDocument::into_message).collect())
            })
            .await
        })
    }

    fn ping(&self) -> PortFuture<'_, ()> {
        Box::pin(async move {
            self.guarded(async {
                self.database
                    .run_command(doc! { "ping": 1 })
                    .await
                    .map_err(|e| CourierError::storage(format!("ping failed: {e}")))?;
                Ok(())
            })
            .await
        })
    }
}
