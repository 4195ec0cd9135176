//! Enqueue envelopes for the delivery workers.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::email::{EmailId, WelcomeEmailData};
use crate::queue::{BrokerChannel, Publishing, QueueError, QueueMessage};
use crate::{Error, Result};

/// Hands emails to the delivery workers.
#[async_trait]
pub trait EmailPublisher: Send + Sync {
    /// Enqueue a welcome email that is already persisted under `email_id`.
    async fn publish_welcome_email(&self, email_id: EmailId, data: &WelcomeEmailData) -> Result<()>;
}

/// [`EmailPublisher`] writing JSON envelopes to a broker channel.
#[derive(Clone)]
pub struct Publisher {
    channel: Arc<dyn BrokerChannel>,
}

impl Publisher {
    /// Create a publisher over a channel dedicated to publishing.
    #[must_use]
    pub fn new(channel: Arc<dyn BrokerChannel>) -> Self {
        Self { channel }
    }

    /// Serialize and durably enqueue an envelope.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Queue`] when the channel is not connected or the
    /// broker refuses the message.
    pub async fn publish(&self, message: &QueueMessage) -> Result<()> {
        if !self.channel.is_connected() {
            return Err(Error::Queue(QueueError::NotConnected));
        }

        let publishing = Publishing::json(message)?;
        let message_id = publishing.message_id;
        self.channel.publish(publishing).await?;

        info!(
            email_id = %message.email_id,
            email_type = %message.email_type,
            %message_id,
            "email message published"
        );
        Ok(())
    }
}

#[async_trait]
impl EmailPublisher for Publisher {
    async fn publish_welcome_email(&self, email_id: EmailId, data: &WelcomeEmailData) -> Result<()> {
        self.publish(&QueueMessage::welcome(email_id, data.clone()))
            .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use crate::queue::{MemoryBroker, QueueOptions};

    #[tokio::test]
    async fn test_publish_welcome_email() {
        let broker = Arc::new(MemoryBroker::new(QueueOptions::default()));
        let publisher = Publisher::new(broker.clone());
        let id = EmailId::new();
        let data = WelcomeEmailData::new("42", "Ana", "ana@example.com");

        publisher.publish_welcome_email(id, &data).await.unwrap();

        let delivery = broker.try_receive().await.unwrap().unwrap();
        let message = QueueMessage::from_json(&delivery.body).unwrap();
        assert_eq!(message.email_id, id);
        assert_eq!(message.data, data);
    }

    #[tokio::test]
    async fn test_disconnected_channel_is_broker_unavailable() {
        let broker = Arc::new(MemoryBroker::new(QueueOptions::default()));
        broker.close().await;
        let publisher = Publisher::new(broker);

        let err = publisher
            .publish_welcome_email(EmailId::new(), &WelcomeEmailData::new("1", "Bo", "bo@example.com"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BrokerUnavailable);
    }
}
