//! Queue envelope and broker message types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::email::{EmailId, EmailType, WelcomeEmailData};
use crate::{Error, Result};

/// Content type of every envelope on the email queue.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Reference to an email, carried by the broker.
///
/// Consumers reload the email from the store by `email_id`; the payload is
/// only used for routing and type-specific validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMessage {
    /// Email to deliver.
    pub email_id: EmailId,
    /// Email kind.
    #[serde(rename = "type")]
    pub email_type: EmailType,
    /// Welcome data the email was rendered from.
    #[serde(default)]
    pub data: WelcomeEmailData,
}

impl QueueMessage {
    /// Envelope for a welcome email.
    #[must_use]
    pub fn welcome(email_id: EmailId, data: WelcomeEmailData) -> Self {
        Self {
            email_id,
            email_type: EmailType::Welcome,
            data,
        }
    }

    /// Decode an envelope from a JSON body.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serde`] if the body is not a valid envelope.
    pub fn from_json(body: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(body)?)
    }

    /// Encode this envelope as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serde`] if serialization fails.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Check the envelope before processing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidMessage`] for a nil ID or missing welcome data.
    pub fn validate(&self) -> Result<()> {
        if self.email_id.is_nil() {
            return Err(Error::InvalidMessage("invalid email ID".into()));
        }

        match self.email_type {
            EmailType::Welcome => {
                let checks = [
                    (&self.data.user_id, "user ID"),
                    (&self.data.user_email, "user email"),
                    (&self.data.user_name, "user name"),
                ];
                for (value, what) in checks {
                    if value.trim().is_empty() {
                        return Err(Error::InvalidMessage(format!(
                            "{what} is required for welcome email"
                        )));
                    }
                }
            }
        }

        Ok(())
    }
}

/// A message handed to the broker for publishing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publishing {
    /// Broker-level message ID, fresh per publish.
    pub message_id: Uuid,
    /// MIME type of `body`.
    pub content_type: String,
    /// Serialized envelope.
    pub body: Vec<u8>,
    /// Ask the broker to persist the message.
    pub persistent: bool,
    /// Publish time.
    pub published_at: DateTime<Utc>,
}

impl Publishing {
    /// Persistent JSON publishing for an envelope.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serde`] if the envelope cannot be serialized.
    pub fn json(message: &QueueMessage) -> Result<Self> {
        Ok(Self {
            message_id: Uuid::new_v4(),
            content_type: JSON_CONTENT_TYPE.to_string(),
            body: message.to_json()?,
            persistent: true,
            published_at: Utc::now(),
        })
    }
}

/// Broker-assigned handle used to ack, requeue or reject a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryTag(pub u64);

impl std::fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message received from the broker, awaiting a disposition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Handle for ack/nack/reject.
    pub tag: DeliveryTag,
    /// Broker-level message ID.
    pub message_id: Uuid,
    /// MIME type of `body`.
    pub content_type: String,
    /// Serialized envelope.
    pub body: Vec<u8>,
    /// Times this message was requeued after a processing error.
    pub redelivery_count: u32,
    /// Original publish time.
    pub published_at: DateTime<Utc>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn message() -> QueueMessage {
        QueueMessage::welcome(
            EmailId::new(),
            WelcomeEmailData::new("u-7", "Ana", "ana@example.com"),
        )
    }

    #[test]
    fn test_wire_format() {
        let msg = message();
        let value: serde_json::Value = serde_json::from_slice(&msg.to_json().unwrap()).unwrap();

        assert_eq!(value["email_id"], msg.email_id.to_string());
        assert_eq!(value["type"], "welcome");
        assert_eq!(value["data"]["user_id"], "u-7");
        assert_eq!(value["data"]["user_name"], "Ana");
        assert_eq!(value["data"]["user_email"], "ana@example.com");
    }

    #[test]
    fn test_decode_external_body() {
        let body = br#"{"email_id":"123e4567-e89b-12d3-a456-426614174000","type":"welcome",
            "data":{"user_id":"1","user_name":"Bo","user_email":"bo@example.com"}}"#;
        let msg = QueueMessage::from_json(body).unwrap();
        assert_eq!(msg.email_id.to_string(), "123e4567-e89b-12d3-a456-426614174000");
        assert!(msg.validate().is_ok());
    }

    #[test]
    fn test_unknown_type_is_malformed() {
        let body = br#"{"email_id":"123e4567-e89b-12d3-a456-426614174000","type":"digest"}"#;
        assert!(matches!(QueueMessage::from_json(body), Err(Error::Serde(_))));
        assert!(matches!(QueueMessage::from_json(b"not json"), Err(Error::Serde(_))));
    }

    #[test]
    fn test_validate_welcome_data() {
        let mut msg = message();
        msg.data.user_email.clear();
        let err = msg.validate().unwrap_err();
        assert!(err.to_string().contains("user email is required"));

        let mut msg = message();
        msg.email_id = EmailId(Uuid::nil());
        assert!(matches!(msg.validate(), Err(Error::InvalidMessage(_))));
    }

    #[test]
    fn test_publishing_is_persistent_json() {
        let msg = message();
        let publishing = Publishing::json(&msg).unwrap();
        assert!(publishing.persistent);
        assert_eq!(publishing.content_type, JSON_CONTENT_TYPE);
        assert_eq!(QueueMessage::from_json(&publishing.body).unwrap(), msg);
    }
}
