//! Courier outbound messaging service.
//!
//! Wires the durable store, broker, and deduplication cache to the three
//! engine loops and the two HTTP listeners, then waits for a shutdown
//! signal. A failed initial connection to the store or the broker aborts
//! startup with a non-zero exit; nothing half-initialized is left behind.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use courier_api::{health::HealthService, AppState};
use courier_core::{
    adapters::{MongoMessageRepository, RabbitMessageQueue, RedisIdempotencyStore},
    guard::{CircuitBreaker, CircuitConfig, RateLimiter},
    masked_uri,
    policy::ProcessingPolicy,
    Config,
};
use courier_engine::{
    HttpWebhookClient, Processor, ProducerConfig, Scheduler, StaleSweeper, SweeperConfig,
    STALE_THRESHOLD,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Webhook calls per second allowed by the outbound limiter.
const OUTBOUND_RATE: f64 = 50.0;
/// Burst capacity of the outbound limiter.
const OUTBOUND_BURST: u32 = 100;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("starting courier");
    let config = Config::from_env();
    info!(
        mongodb_uri = %masked_uri(&config.mongodb_uri),
        rabbitmq_uri = %masked_uri(&config.rabbitmq_uri),
        webhook_url = %config.webhook_url,
        batch_size = config.batch_size,
        max_retries = config.max_retries,
        "configuration loaded"
    );

    // Store and broker are fatal dependencies; the cache connects lazily
    // and only degrades the health surface while unreachable.
    let repository = Arc::new(
        MongoMessageRepository::connect(&config.mongodb_uri, &config.mongodb_database)
            .await
            .context("failed to connect to MongoDB")?,
    );
    let queue = Arc::new(
        RabbitMessageQueue::connect(&config.rabbitmq_uri, config.retry_interval)
            .await
            .context("failed to connect to RabbitMQ")?,
    );
    let idempotency = Arc::new(
        RedisIdempotencyStore::new(&config.redis_uri, &config.redis_password, config.redis_db)
            .context("invalid Redis configuration")?,
    );
    info!("store and broker connections established");

    // One limiter per protected resource; the ingress shares the webhook
    // limiter in try mode.
    let limiter = Arc::new(RateLimiter::new(OUTBOUND_RATE, OUTBOUND_BURST));
    let webhook = Arc::new(
        HttpWebhookClient::new(
            config.webhook_url.clone(),
            config.webhook_timeout,
            limiter.clone(),
            Arc::new(CircuitBreaker::new("webhook-client", CircuitConfig::default())),
        )
        .context("failed to build webhook client")?,
    );

    let policy = ProcessingPolicy::new(config.max_retries, STALE_THRESHOLD);
    let processor = Arc::new(Processor::new(
        repository.clone(),
        queue.clone(),
        idempotency.clone(),
        webhook,
        policy,
    ));
    let sweeper = Arc::new(StaleSweeper::new(
        repository.clone(),
        queue.clone(),
        SweeperConfig {
            dlq_alert_threshold: config.dlq_alert_threshold,
            ..SweeperConfig::default()
        },
    ));
    let scheduler = Arc::new(Scheduler::new(
        repository.clone(),
        queue.clone(),
        ProducerConfig { batch_size: config.batch_size, poll_interval: config.poll_interval },
    ));
    let health = Arc::new(HealthService::new(
        repository.clone(),
        queue.clone(),
        idempotency.clone(),
    ));

    let shutdown = CancellationToken::new();
    let mut tasks = Vec::new();

    tasks.push(tokio::spawn({
        let processor = processor.clone();
        let token = shutdown.clone();
        async move { processor.run(token).await }
    }));
    tasks.push(tokio::spawn({
        let sweeper = sweeper.clone();
        let token = shutdown.clone();
        async move { sweeper.run(token).await }
    }));
    tasks.push(tokio::spawn({
        let state = AppState::new(repository.clone(), scheduler.clone(), health.clone(), limiter);
        let addr = config.api_addr;
        let token = shutdown.clone();
        async move {
            if let Err(err) = courier_api::server::serve(state, addr, token).await {
                error!(error = %err, "ingress API failed");
            }
        }
    }));
    tasks.push(tokio::spawn({
        let health = health.clone();
        let addr = config.health_addr;
        let token = shutdown.clone();
        async move {
            if let Err(err) = courier_api::health::serve_health(health, addr, token).await {
                error!(error = %err, "health listener failed");
            }
        }
    }));

    info!("courier is ready; start the producer via POST /api/v1/scheduler/start");

    shutdown_signal().await;
    info!("shutdown signal received, stopping loops");

    scheduler.stop().await;
    shutdown.cancel();

    let drain = async {
        for task in tasks {
            let _ = task.await;
        }
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        warn!("shutdown grace period expired with tasks still running");
    }

    info!("courier shutdown complete");
    Ok(())
}

/// Initializes tracing with environment-based filtering.
fn init_tracing() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,courier=debug"));

    let fmt_layer = fmt::layer().with_target(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Waits for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received SIGINT"),
        () = terminate => info!("received SIGTERM"),
    }
}
