//! Producer scheduler.
//!
//! Periodically scans the durable store for `unsent` messages, publishes
//! them onto the main queue, and promotes them to `processing`. The
//! promotion happens only after a successful publish, so a crash in
//! between leaves a `processing` row the sweeper can reconcile while the
//! broker already holds the delivery.
//!
//! Publish and status update are not atomic across store and broker;
//! duplicate deliveries are expected and the consumer's idempotency check
//! absorbs them.

use std::{sync::Arc, time::Duration};

use courier_core::{
    error::Result,
    models::{Message, MessageStatus},
    ports::{MessageQueue, MessageRepository},
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Producer tuning parameters.
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// Messages fetched per tick.
    pub batch_size: usize,
    /// Tick interval.
    pub poll_interval: Duration,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self { batch_size: 2, poll_interval: Duration::from_secs(120) }
    }
}

struct ProducerWorker {
    repository: Arc<dyn MessageRepository>,
    queue: Arc<dyn MessageQueue>,
    config: ProducerConfig,
}

impl ProducerWorker {
    async fn run(&self, shutdown: CancellationToken) {
        info!(
            batch_size = self.config.batch_size,
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "producer scheduler started"
        );

        let start = tokio::time::Instant::now() + self.config.poll_interval;
        let mut ticker = tokio::time::interval_at(start, self.config.poll_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(error) = self.dispatch_batch().await {
                        warn!(error = %error, "unsent scan failed, will retry next tick");
                    }
                }
                () = shutdown.cancelled() => break,
            }
        }

        info!("producer scheduler stopped");
    }

    async fn dispatch_batch(&self) -> Result<usize> {
        debug!("scanning for unsent messages");
        let messages = self.repository.find_unsent(self.config.batch_size).await?;
        debug!(count = messages.len(), "found unsent messages");

        let mut published = 0;
        for message in &messages {
            match self.publish_one(message).await {
                Ok(()) => published += 1,
                Err(error) => {
                    // The message stays unsent and is picked up again on
                    // the next tick.
                    warn!(
                        message_id = %message.id,
                        error = %error,
                        "failed to hand message to the broker, skipping"
                    );
                },
            }
        }

        Ok(published)
    }

    async fn publish_one(&self, message: &Message) -> Result<()> {
        self.queue.publish(&message.to_queue_message()).await?;
        self.repository.update_status(message.id, MessageStatus::Processing).await?;
        debug!(message_id = %message.id, "message published and marked processing");
        Ok(())
    }
}

struct RunningLoop {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Start/stop controller around the producer loop.
///
/// `start` is idempotent: a second call while the loop runs is a no-op.
/// `stop` cancels at the next tick boundary and waits for the in-flight
/// iteration to finish.
pub struct Scheduler {
    worker: Arc<ProducerWorker>,
    running: tokio::sync::Mutex<Option<RunningLoop>>,
}

impl Scheduler {
    /// Creates a scheduler over the given store and broker.
    pub fn new(
        repository: Arc<dyn MessageRepository>,
        queue: Arc<dyn MessageQueue>,
        config: ProducerConfig,
    ) -> Self {
        Self {
            worker: Arc::new(ProducerWorker { repository, queue, config }),
            running: tokio::sync::Mutex::new(None),
        }
    }

    /// Starts the producer loop if it is not already running.
    pub async fn start(&self) {
        let mut running = self.running.lock().await;
        if running.is_some() {
            debug!("scheduler already running, start is a no-op");
            return;
        }

        let token = CancellationToken::new();
        let worker = self.worker.clone();
        let loop_token = token.clone();
        let handle = tokio::spawn(async move { worker.run(loop_token).await });
        *running = Some(RunningLoop { token, handle });
    }

    /// Stops the producer loop if it is running.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            debug!("scheduler not running, stop is a no-op");
            return;
        };
        running.token.cancel();
        if running.handle.await.is_err() {
            warn!("producer loop terminated abnormally");
        }
    }

    /// Whether the producer loop is currently running.
    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Runs a single producer tick immediately. Returns the number of
    /// messages published.
    ///
    /// # Errors
    ///
    /// Returns the error of the unsent scan; per-message publish failures
    /// are skipped, not propagated.
    pub async fn dispatch_once(&self) -> Result<usize> {
        self.worker.dispatch_batch().await
    }
}
