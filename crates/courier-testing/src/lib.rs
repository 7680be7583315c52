//! Test support for the courier pipeline.
//!
//! In-memory implementations of the core ports plus fixture builders.
//! Engine and API tests run the real lifecycle logic against these fakes
//! for deterministic behavior without a running MongoDB, RabbitMQ, or
//! Redis.

pub mod fixtures;
pub mod memory;

pub use memory::{InMemoryIdempotencyStore, InMemoryQueue, InMemoryRepository, TestPorts};
