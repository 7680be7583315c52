//! Production adapters for the store, cache, and broker ports.

pub mod mongo;
pub mod rabbit;
pub mod redis;

use std::{future::Future, time::Duration};

use crate::error::{CourierError, Result};

/// Per-operation deadline applied to every adapter call.
pub(crate) const OPERATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Bounds an adapter operation by [`OPERATION_TIMEOUT`].
pub(crate) async fn with_deadline<T>(op: impl Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(OPERATION_TIMEOUT, op).await {
        Ok(result) => result,
        Err(_) => Err(CourierError::timeout(OPERATION_TIMEOUT.as_secs())),
    }
}

pub use mongo::MongoMessageRepository;
pub use rabbit::RabbitMessageQueue;
pub use redis::RedisIdempotencyStore;
