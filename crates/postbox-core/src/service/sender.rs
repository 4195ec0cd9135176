//! Outbound delivery seam.

use async_trait::async_trait;

use crate::email::Email;

/// Errors raised while handing an email to the mail server.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// An address could not be parsed into a mailbox.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// The message could not be assembled.
    #[error("failed to build message: {0}")]
    Build(String),

    /// The server refused the message or the connection failed.
    #[error("smtp error: {0}")]
    Smtp(String),

    /// The send did not complete in time.
    #[error("send timed out")]
    Timeout,
}

/// Delivers a fully rendered email.
///
/// Implementations must not mutate delivery state; the processor records
/// the outcome on the entity.
#[async_trait]
pub trait EmailSender: Send + Sync {
    /// Send `email` to its recipient.
    async fn send(&self, email: &Email) -> Result<(), SendError>;
}
