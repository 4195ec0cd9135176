//! Queue consumer.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::processor::EmailProcessor;
use crate::Disposition;
use crate::queue::{BrokerChannel, Delivery, QueueError, QueueMessage};

/// Default cap on transport-level redeliveries before dead-lettering.
pub const DEFAULT_MAX_REDELIVERIES: u32 = 3;

/// Default bound on processing one delivery.
pub const DEFAULT_PROCESSING_TIMEOUT: Duration = Duration::from_secs(60);

/// Headroom over the send timeout for store reads and writes.
const STORE_IO_MARGIN: Duration = Duration::from_secs(30);

const RECEIVE_BACKOFF: Duration = Duration::from_secs(1);

/// Pulls envelopes from a broker channel and runs them through the processor.
///
/// Holds at most one unacked delivery at a time. Business outcomes
/// (sent, retry later, permanently failed, unknown email) are acked; only
/// infrastructure failures are requeued, and only up to
/// `max_redeliveries` times.
pub struct Consumer {
    channel: Arc<dyn BrokerChannel>,
    processor: EmailProcessor,
    max_redeliveries: u32,
    processing_timeout: Duration,
}

impl Consumer {
    /// Create a consumer over a channel dedicated to consuming.
    ///
    /// The processing timeout starts at [`DEFAULT_PROCESSING_TIMEOUT`], raised
    /// if needed so a send timeout always fires first and is recorded as a
    /// failed attempt.
    #[must_use]
    pub fn new(channel: Arc<dyn BrokerChannel>, processor: EmailProcessor) -> Self {
        let processing_timeout = DEFAULT_PROCESSING_TIMEOUT
            .max(processor.send_timeout().saturating_add(STORE_IO_MARGIN));
        Self {
            channel,
            processor,
            max_redeliveries: DEFAULT_MAX_REDELIVERIES,
            processing_timeout,
        }
    }

    /// Override the redelivery cap.
    #[must_use]
    pub const fn with_max_redeliveries(mut self, max_redeliveries: u32) -> Self {
        self.max_redeliveries = max_redeliveries;
        self
    }

    /// Override the processing timeout.
    ///
    /// Values not longer than the processor's send timeout are ignored: the
    /// send must time out inside processing so the attempt is recorded.
    #[must_use]
    pub fn with_processing_timeout(mut self, processing_timeout: Duration) -> Self {
        if processing_timeout > self.processor.send_timeout() {
            self.processing_timeout = processing_timeout;
        } else {
            warn!(
                requested = ?processing_timeout,
                send_timeout = ?self.processor.send_timeout(),
                kept = ?self.processing_timeout,
                "processing timeout must exceed the send timeout"
            );
        }
        self
    }

    /// Bound applied to processing one delivery.
    #[must_use]
    pub const fn processing_timeout(&self) -> Duration {
        self.processing_timeout
    }

    /// Process one delivery and settle it on the channel.
    ///
    /// Returns the disposition that was applied.
    ///
    /// # Errors
    ///
    /// Returns an error if the ack, requeue or reject itself fails.
    pub async fn handle_delivery(&self, delivery: &Delivery) -> Result<Disposition, QueueError> {
        let (disposition, reason) = self.decide(delivery).await;

        match disposition {
            Disposition::Ack => self.channel.ack(delivery.tag).await?,
            Disposition::Requeue => {
                warn!(
                    redelivery_count = delivery.redelivery_count,
                    max_redeliveries = self.max_redeliveries,
                    reason = %reason,
                    "requeueing message"
                );
                self.channel.nack_requeue(delivery.tag).await?;
            }
            Disposition::Reject => {
                warn!(reason = %reason, "rejecting message");
                self.channel.reject(delivery.tag, &reason).await?;
            }
        }

        Ok(disposition)
    }

    async fn decide(&self, delivery: &Delivery) -> (Disposition, String) {
        let message = match QueueMessage::from_json(&delivery.body) {
            Ok(message) => message,
            Err(e) => return (Disposition::Reject, format!("failed to decode message: {e}")),
        };

        if let Err(e) = message.validate() {
            return (Disposition::Reject, format!("invalid message: {e}"));
        }

        let result =
            tokio::time::timeout(self.processing_timeout, self.processor.process_message(&message))
                .await;

        match result {
            Ok(Ok(outcome)) => {
                debug!(email_id = %message.email_id, ?outcome, "message processed");
                (Disposition::Ack, String::new())
            }
            Ok(Err(e)) => {
                let kind = e.kind();
                match kind.disposition() {
                    Disposition::Ack => {
                        warn!(email_id = %message.email_id, ?kind, error = %e, "message discarded");
                        (Disposition::Ack, e.to_string())
                    }
                    Disposition::Reject => (Disposition::Reject, e.to_string()),
                    Disposition::Requeue => self.retry_or_reject(delivery, e.to_string()),
                }
            }
            Err(_) => self.retry_or_reject(
                delivery,
                format!("processing timed out after {:?}", self.processing_timeout),
            ),
        }
    }

    fn retry_or_reject(&self, delivery: &Delivery, reason: String) -> (Disposition, String) {
        if delivery.redelivery_count < self.max_redeliveries {
            (Disposition::Requeue, reason)
        } else {
            (Disposition::Reject, reason)
        }
    }

    /// Consume until `shutdown` turns true or the channel closes.
    ///
    /// No new delivery is pulled after the signal. A delivery already being
    /// processed is finished and settled first.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("consumer started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let received = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                received = self.channel.receive() => received,
            };

            match received {
                Ok(delivery) => {
                    let span = info_span!(
                        "delivery",
                        message_id = %delivery.message_id,
                        tag = %delivery.tag,
                    );
                    if let Err(e) = self.handle_delivery(&delivery).instrument(span).await {
                        error!(tag = %delivery.tag, error = %e, "failed to settle delivery");
                    }
                }
                Err(QueueError::NotConnected) => {
                    warn!("broker channel closed");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "failed to receive message");
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        () = tokio::time::sleep(RECEIVE_BACKOFF) => {}
                    }
                }
            }
        }

        info!("consumer stopped");
    }
}
