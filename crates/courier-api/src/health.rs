//! Dependency health aggregation and the standalone health listener.
//!
//! Each backing dependency gets a bounded probe: the store answers a ping
//! command, the broker a passive inspect of the dead-letter queue, and the
//! cache an idempotency read of a reserved key. The listener serves the
//! aggregate on its own port so the processor side stays observable even
//! when the ingress API is saturated.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{extract::State, routing::get, Json, Router};
use courier_core::ports::{IdempotencyStore, MessageQueue, MessageRepository};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Deadline applied to each dependency probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Reserved idempotency key used for cache probes.
const HEALTH_CHECK_KEY: &str = "health-check";

/// Aggregate health snapshot.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct HealthStatus {
    /// Durable store reachable.
    pub mongodb: bool,
    /// Broker reachable.
    pub rabbitmq: bool,
    /// Deduplication cache reachable.
    pub redis: bool,
    /// The service itself is up; always true when answering.
    pub service: bool,
}

/// Probes the three backing dependencies.
pub struct HealthService {
    repository: Arc<dyn MessageRepository>,
    queue: Arc<dyn MessageQueue>,
    idempotency: Arc<dyn IdempotencyStore>,
}

impl HealthService {
    /// Creates a health service over the given collaborators.
    pub fn new(
        repository: Arc<dyn MessageRepository>,
        queue: Arc<dyn MessageQueue>,
        idempotency: Arc<dyn IdempotencyStore>,
    ) -> Self {
        Self { repository, queue, idempotency }
    }

    /// Runs all probes and returns the aggregate snapshot.
    pub async fn check(&self) -> HealthStatus {
        let mongodb = probe(self.repository.ping()).await;
        let rabbitmq = probe(self.queue.dead_letter_count()).await;
        let redis = probe(self.idempotency.is_processed(HEALTH_CHECK_KEY)).await;

        debug!(mongodb, rabbitmq, redis, "health probes completed");
        HealthStatus { mongodb, rabbitmq, redis, service: true }
    }
}

async fn probe<T>(
    op: impl std::future::Future<Output = courier_core::error::Result<T>>,
) -> bool {
    matches!(tokio::time::timeout(PROBE_TIMEOUT, op).await, Ok(Ok(_)))
}

async fn status_handler(State(service): State<Arc<HealthService>>) -> Json<HealthStatus> {
    Json(service.check().await)
}

/// Builds the health router.
pub fn health_router(service: Arc<HealthService>) -> Router {
    Router::new().route("/status", get(status_handler)).with_state(service)
}

/// Serves the health listener until cancelled.
///
/// # Errors
///
/// Returns `std::io::Error` if the address cannot be bound.
pub async fn serve_health(
    service: Arc<HealthService>,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> Result<(), std::io::Error> {
    let app = health_router(service);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "health listener started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("health listener stopped");
    Ok(())
}
