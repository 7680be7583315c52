//! Ingress HTTP API and health surface.
//!
//! Hosts the `/api/v1` message endpoints behind the try-mode rate limiter
//! and the standalone health listener that reports per-dependency probe
//! results.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod handlers;
pub mod health;
pub mod server;

use std::sync::Arc;

use courier_core::{guard::RateLimiter, ports::MessageRepository};
use courier_engine::Scheduler;
use health::HealthService;

/// Shared state for the ingress router.
#[derive(Clone)]
pub struct AppState {
    /// Durable message store.
    pub repository: Arc<dyn MessageRepository>,
    /// Producer loop controller for the scheduler endpoints.
    pub scheduler: Arc<Scheduler>,
    /// Dependency probe aggregator.
    pub health: Arc<HealthService>,
    /// Ingress rate limiter, used in try mode.
    pub limiter: Arc<RateLimiter>,
}

impl AppState {
    /// Creates the shared router state.
    pub fn new(
        repository: Arc<dyn MessageRepository>,
        scheduler: Arc<Scheduler>,
        health: Arc<HealthService>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self { repository, scheduler, health, limiter }
    }
}

pub use server::create_router;
