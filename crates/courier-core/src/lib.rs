//! Core domain types, contracts, and adapters for the courier pipeline.
//!
//! Provides the message model and its status state machine, the pure
//! processing policy, the port traits over the durable store, broker,
//! deduplication cache, and webhook, the outbound-guard primitives, and
//! the production MongoDB/RabbitMQ/Redis adapters. The engine and API
//! crates depend on these foundations and nothing here depends on them.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod adapters;
pub mod config;
pub mod error;
pub mod guard;
pub mod models;
pub mod policy;
pub mod ports;

pub use config::{masked_uri, Config};
pub use error::{CourierError, Result};
pub use guard::{CircuitBreaker, CircuitConfig, CircuitState, RateLimiter};
pub use models::{
    Delivery, IdempotencyRecord, Message, MessageId, MessageStatus, QueueMessage,
};
pub use policy::{ProcessDecision, ProcessingPolicy};
pub use ports::{
    IdempotencyStore, MessageQueue, MessageRepository, PortFuture, WebhookClient, WebhookResponse,
};
