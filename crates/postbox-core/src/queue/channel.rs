//! Broker channel abstraction.

use std::time::Duration;

use async_trait::async_trait;

use super::message::{Delivery, DeliveryTag, Publishing};

/// Name of the queue carrying email envelopes.
pub const EMAIL_QUEUE: &str = "email_notifications";

/// Errors raised by a broker channel.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The channel is closed or was never connected.
    #[error("broker channel not connected")]
    NotConnected,

    /// Ack/nack/reject for a tag this channel does not hold.
    #[error("unknown delivery tag: {0}")]
    UnknownDeliveryTag(DeliveryTag),

    /// A stored message could not be decoded.
    #[error("corrupt queue row {id}: {reason}")]
    CorruptRow {
        /// Row identifier.
        id: i64,
        /// What could not be decoded.
        reason: String,
    },

    /// Backing storage failed.
    #[error("broker storage error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Queue declaration shared by all channel implementations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueOptions {
    /// Queue name.
    pub name: String,
    /// Messages older than this are dropped unconsumed.
    pub message_ttl: Option<Duration>,
    /// How often a polling channel checks for new messages.
    pub poll_interval: Duration,
    /// How long an unacked delivery stays invisible before redelivery.
    pub visibility_timeout: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            name: EMAIL_QUEUE.to_string(),
            message_ttl: Some(Duration::from_secs(3600)),
            poll_interval: Duration::from_millis(500),
            visibility_timeout: Duration::from_secs(300),
        }
    }
}

impl QueueOptions {
    /// Options for a named queue with default timings.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// One logical channel on a durable queue.
///
/// A channel is used either for publishing or for consuming. Each consumer
/// holds at most one unacked delivery at a time (prefetch of one).
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Enqueue a message.
    async fn publish(&self, publishing: Publishing) -> Result<(), QueueError>;

    /// Wait for the next delivery.
    ///
    /// Dropping the returned future before it completes does not lose a message.
    async fn receive(&self) -> Result<Delivery, QueueError>;

    /// Take the next delivery if one is ready.
    async fn try_receive(&self) -> Result<Option<Delivery>, QueueError>;

    /// Remove a delivered message from the queue.
    async fn ack(&self, tag: DeliveryTag) -> Result<(), QueueError>;

    /// Return a delivered message to the queue and bump its redelivery count.
    async fn nack_requeue(&self, tag: DeliveryTag) -> Result<(), QueueError>;

    /// Remove a delivered message and record it as dead-lettered.
    async fn reject(&self, tag: DeliveryTag, reason: &str) -> Result<(), QueueError>;

    /// Returns true while the channel can publish and receive.
    fn is_connected(&self) -> bool;

    /// Close the channel. Unacked deliveries become available again.
    async fn close(&self);
}
