//! Stale-record sweeper.
//!
//! The early-ack consumer and the non-atomic publish/status seam can
//! orphan messages in `processing`. The sweeper is the backstop that
//! guarantees every message still reaches a terminal state: any
//! `processing` record untouched past the stale threshold is re-emitted
//! into the dead-letter queue and marked `failed`.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use courier_core::{
    error::Result,
    models::{Delivery, Message, MessageStatus},
    ports::{MessageQueue, MessageRepository},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default threshold after which a `processing` record counts as stale.
pub const STALE_THRESHOLD: Duration = Duration::from_secs(4 * 60);

/// Default interval between sweeps.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Sweeper tuning parameters.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Interval between sweeps.
    pub sweep_interval: Duration,
    /// Age past which a `processing` record is stale.
    pub stale_after: Duration,
    /// Dead-letter depth that triggers an alert log.
    pub dlq_alert_threshold: u32,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            sweep_interval: SWEEP_INTERVAL,
            stale_after: STALE_THRESHOLD,
            dlq_alert_threshold: 10,
        }
    }
}

/// Periodic reconciler for stale `processing` records.
pub struct StaleSweeper {
    repository: Arc<dyn MessageRepository>,
    queue: Arc<dyn MessageQueue>,
    config: SweeperConfig,
}

impl StaleSweeper {
    /// Creates a sweeper over the given store and broker.
    pub fn new(
        repository: Arc<dyn MessageRepository>,
        queue: Arc<dyn MessageQueue>,
        config: SweeperConfig,
    ) -> Self {
        Self { repository, queue, config }
    }

    /// Sweeps on the configured interval until cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            sweep_interval_secs = self.config.sweep_interval.as_secs(),
            stale_after_secs = self.config.stale_after.as_secs(),
            "stale sweeper started"
        );

        let start = tokio::time::Instant::now() + self.config.sweep_interval;
        let mut ticker = tokio::time::interval_at(start, self.config.sweep_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(error) = self.sweep_once().await {
                        warn!(error = %error, "stale scan failed, will retry next tick");
                    }
                }
                () = shutdown.cancelled() => break,
            }
        }

        info!("stale sweeper stopped");
    }

    /// Runs a single sweep. Returns the number of records recovered.
    ///
    /// A failure to route one record does not abort the sweep; the record
    /// stays `processing` and is retried on the next tick.
    ///
    /// # Errors
    ///
    /// Returns the error of the stale scan itself.
    pub async fn sweep_once(&self) -> Result<usize> {
        let cutoff = Utc::now()
            - chrono::TimeDelta::from_std(self.config.stale_after)
                .unwrap_or(chrono::TimeDelta::MAX);
        let stale = self.repository.find_stale_processing(cutoff).await?;

        let mut recovered = 0;
        for message in &stale {
            match self.recover(message).await {
                Ok(()) => recovered += 1,
                Err(error) => {
                    warn!(
                        message_id = %message.id,
                        error = %error,
                        "failed to recover stale message, leaving for next sweep"
                    );
                },
            }
        }

        if recovered > 0 {
            info!(recovered, "stale messages routed to dead-letter queue");
        }

        self.check_dead_letter_depth().await;
        Ok(recovered)
    }

    async fn recover(&self, message: &Message) -> Result<()> {
        warn!(
            message_id = %message.id,
            updated_at = %message.updated_at,
            "found stale message in processing state"
        );

        let body = message.to_queue_message().to_bytes()?;
        let delivery = Delivery::new(body, "application/json", 0);
        self.queue.send_to_dead_letter(&delivery).await?;
        self.repository.update_status(message.id, MessageStatus::Failed).await?;
        Ok(())
    }

    async fn check_dead_letter_depth(&self) {
        match self.queue.dead_letter_count().await {
            Ok(count) if count >= self.config.dlq_alert_threshold => {
                warn!(
                    count,
                    threshold = self.config.dlq_alert_threshold,
                    "dead-letter queue depth above alert threshold"
                );
            },
            Ok(count) => debug!(count, "dead-letter queue depth"),
            Err(error) => debug!(error = %error, "could not inspect dead-letter queue"),
        }
    }
}
