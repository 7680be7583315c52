//! Redis-backed idempotency store.
//!
//! Holds the `inbox:<id>` processed markers and the `webhook:msg:<id>`
//! reconciliation ids, both with a 24-hour TTL. The connection is
//! established lazily so the pipeline can come up (and report an unhealthy
//! cache) while Redis is down; every operation runs under the store's
//! circuit breaker with a per-operation deadline.

use std::{future::Future, sync::Arc, time::Duration};

use chrono::Utc;
use redis::{aio::ConnectionManager, AsyncCommands};
use tokio::sync::OnceCell;

use super::with_deadline;
use crate::{
    error::{CourierError, Result},
    guard::{CircuitBreaker, CircuitConfig},
    models::IdempotencyRecord,
    ports::{IdempotencyStore, PortFuture},
};

/// TTL applied to `inbox:<id>` processed markers.
pub const PROCESSED_MARKER_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Redis implementation of [`IdempotencyStore`].
pub struct RedisIdempotencyStore {
    client: redis::Client,
    connection: OnceCell<ConnectionManager>,
    breaker: Arc<CircuitBreaker>,
}

impl RedisIdempotencyStore {
    /// Builds a store from the configured address, password, and database.
    ///
    /// The address may omit the `redis://` scheme; credentials and the
    /// database index are folded into the connection URL. No connection is
    /// attempted here.
    ///
    /// # Errors
    ///
    /// Returns `CourierError::Cache` when the address cannot be parsed.
    pub fn new(uri: &str, password: &str, db: i64) -> Result<Self> {
        let url = build_url(uri, password, db);
        let client = redis::Client::open(url)
            .map_err(|e| CourierError::cache(format!("invalid Redis address: {e}")))?;

        Ok(Self {
            client,
            connection: OnceCell::new(),
            breaker: Arc::new(CircuitBreaker::new("redis-idempotency", CircuitConfig::default())),
        })
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        let manager = self
            .connection
            .get_or_try_init(|| async {
                ConnectionManager::new(self.client.clone())
                    .await
                    .map_err(|e| CourierError::cache(format!("failed to connect to Redis: {e}")))
            })
            .await?;
        Ok(manager.clone())
    }

    async fn guarded<T>(&self, op: impl Future<Output = Result<T>>) -> Result<T> {
        self.breaker.call(with_deadline(op)).await
    }

    fn inbox_key(message_id: &str) -> String {
        format!("inbox:{message_id}")
    }

    fn webhook_key(message_id: &str) -> String {
        format!("webhook:msg:{message_id}")
    }
}

impl IdempotencyStore for RedisIdempotencyStore {
    fn is_processed(&self, message_id: &str) -> PortFuture<'_, bool> {
        let key = Self::inbox_key(message_id);
        Box::pin(async move {
            self.guarded(async {
                let mut conn = self.connection().await?;
                let value: Option<String> = conn
                    .get(&key)
                    .await
                    .map_err(|e| CourierError::cache(format!("GET {key} failed: {e}")))?;

                let Some(value) = value else { return Ok(false) };

                // Older markers were written as the bare literal.
                match serde_json::from_str::<IdempotencyRecord>(&value) {
                    Ok(record) => Ok(record.is_processed()),
                    Err(_) => Ok(value == IdempotencyRecord::PROCESSED),
                }
            })
            .await
        })
    }

    fn mark_processed(&self, message_id: &str) -> PortFuture<'_, ()> {
        let key = Self::inbox_key(message_id);
        Box::pin(async move {
            self.guarded(async {
                let record = IdempotencyRecord::processed(Utc::now());
                let payload = serde_json::to_string(&record)
                    .map_err(|e| CourierError::cache(format!("marker encode failed: {e}")))?;

                let mut conn = self.connection().await?;
                let _: () = conn
                    .set_ex(&key, payload, PROCESSED_MARKER_TTL.as_secs())
                    .await
                    .map_err(|e| CourierError::cache(format!("SET {key} failed: {e}")))?;
                Ok(())
            })
            .await
        })
    }

    fn store_webhook_message_id(
        &self,
        message_id: &str,
        webhook_message_id: &str,
        ttl: Duration,
    ) -> PortFuture<'_, ()> {
        let key = Self::webhook_key(message_id);
        let value = webhook_message_id.to_string();
        Box::pin(async move {
            self.guarded(async {
                let mut conn = self.connection().await?;
                let _: () = conn
                    .set_ex(&key, value, ttl.as_secs())
                    .await
                    .map_err(|e| CourierError::cache(format!("SET {key} failed: {e}")))?;
                Ok(())
            })
            .await
        })
    }

    fn ping(&self) -> PortFuture<'_, ()> {
        Box::pin(async move {
            self.guarded(async {
                let mut conn = self.connection().await?;
                let _: String = redis::cmd("PING")
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| CourierError::cache(format!("PING failed: {e}")))?;
                Ok(())
            })
            .await
        })
    }
}

fn build_url(uri: &str, password: &str, db: i64) -> String {
    if uri.starts_with("redis://") || uri.starts_with("rediss://") {
        return uri.to_string();
    }
    if password.is_empty() {
        format!("redis://{uri}/{db}")
    } else {
        format!("redis://:{password}@{uri}/{db}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_built_from_bare_address() {
        assert_eq!(build_url("localhost:6380", "", 0), "redis://localhost:6380/0");
        assert_eq!(
            build_url("localhost:6380", "hunter2", 2),
            "redis://:hunter2@localhost:6380/2"
        );
    }

    #[test]
    fn explicit_scheme_passes_through() {
        assert_eq!(
            build_url("redis://cache.internal:6379/1", "ignored", 0),
            "redis://cache.internal:6379/1"
        );
    }

    #[test]
    fn keys_match_cache_contract() {
        assert_eq!(RedisIdempotencyStore::inbox_key("abc"), "inbox:abc");
        assert_eq!(RedisIdempotencyStore::webhook_key("abc"), "webhook:msg:abc");
    }
}
