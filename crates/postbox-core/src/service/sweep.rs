//! Periodic reconciliation of pending emails.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use super::processor::{BatchReport, EmailProcessor};
use crate::Result;

/// Default time between sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Default number of pending emails per sweep.
pub const DEFAULT_SWEEP_BATCH: u32 = 50;

/// Replays pending emails from the store, bypassing the queue.
///
/// Recovers emails whose message was never published, was lost, or was
/// acked after a retryable failure.
pub struct Sweeper {
    processor: EmailProcessor,
    interval: Duration,
    batch_size: u32,
}

impl Sweeper {
    /// Create a sweeper with the default interval and batch size.
    #[must_use]
    pub const fn new(processor: EmailProcessor) -> Self {
        Self {
            processor,
            interval: DEFAULT_SWEEP_INTERVAL,
            batch_size: DEFAULT_SWEEP_BATCH,
        }
    }

    /// Override the interval. Zero is raised to one millisecond.
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Override the batch size.
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Run one sweep.
    ///
    /// # Errors
    ///
    /// Returns an error if the pending batch cannot be loaded.
    pub async fn tick(&self) -> Result<BatchReport> {
        let report = self.processor.process_pending_batch(self.batch_size).await?;

        if report.fetched == 0 {
            debug!("no pending emails");
        } else {
            info!(
                fetched = report.fetched,
                sent = report.sent,
                retry_later = report.retry_later,
                failed = report.failed,
                "processed pending emails"
            );
        }
        Ok(report)
    }

    /// Sweep every interval until `shutdown` turns true.
    ///
    /// The first sweep happens one interval after start.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Skip the immediate first tick
        ticker.tick().await;

        info!(interval = ?self.interval, batch_size = self.batch_size, "sweeper started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "failed to process pending emails");
                    }
                }
            }
        }

        info!("sweeper stopped");
    }
}
