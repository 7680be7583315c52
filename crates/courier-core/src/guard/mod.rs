//! Outbound-guard primitives.
//!
//! Every call to the webhook goes through a token-bucket rate limiter and
//! a circuit breaker; the store and cache clients each carry their own
//! breaker as well.

pub mod circuit;
pub mod ratelimit;

pub use circuit::{CircuitBreaker, CircuitConfig, CircuitState};
pub use ratelimit::RateLimiter;
