//! Error types for the core library.

use thiserror::Error;

use crate::email::{EmailId, ValidationError};
use crate::queue::QueueError;

/// Errors that can occur in core operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Welcome email input or entity failed validation.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Broker channel operation failed.
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// A stored row could not be mapped back to an email.
    #[error("Corrupt email record {id}: {reason}")]
    CorruptRecord {
        /// Raw identifier of the offending row.
        id: String,
        /// What could not be decoded.
        reason: String,
    },

    /// Email referenced by a message does not exist in the store.
    #[error("Email not found: {0}")]
    NotFound(EmailId),

    /// Queue message is structurally valid JSON but unusable.
    #[error("Invalid queue message: {0}")]
    InvalidMessage(String),

    /// Email is not pending or has exhausted its attempts.
    #[error("Email {id} cannot be retried (attempts: {attempts}/{max_attempts})")]
    CannotRetry {
        /// Email identifier.
        id: EmailId,
        /// Attempts recorded so far.
        attempts: u32,
        /// Attempt ceiling.
        max_attempts: u32,
    },

    /// The last allowed attempt failed and the email is now `failed`.
    #[error("Email {id} permanently failed after {attempts} attempts: {reason}")]
    PermanentlyFailed {
        /// Email identifier.
        id: EmailId,
        /// Attempts recorded.
        attempts: u32,
        /// Last sender error.
        reason: String,
    },

    /// Sending failed and persisting the failure failed too.
    #[error("Email {id}: send failed ({send_error}) and update failed ({update_error})")]
    SendAndUpdateFailed {
        /// Email identifier.
        id: EmailId,
        /// Sender error.
        send_error: String,
        /// Store error raised while recording the send failure.
        update_error: Box<Error>,
    },
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`], used to pick a broker disposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad welcome-email input.
    Validation,
    /// Broker channel not connected at publish time.
    BrokerUnavailable,
    /// Referenced email does not exist.
    NotFound,
    /// Email already failed or out of attempts before sending.
    CannotRetry,
    /// Final attempt failed.
    PermanentlyFailed,
    /// Store could not be read or written.
    StoreUnavailable,
    /// Envelope could not be decoded or validated.
    MalformedMessage,
}

/// What the consumer does with a delivery after processing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Remove the message from the queue.
    Ack,
    /// Put the message back for redelivery.
    Requeue,
    /// Remove the message and record it as dead-lettered.
    Reject,
}

impl ErrorKind {
    /// Broker disposition for a processing error of this kind.
    ///
    /// Business-level outcomes are acknowledged; only infrastructure
    /// failures are eligible for redelivery.
    #[must_use]
    pub const fn disposition(self) -> Disposition {
        match self {
            Self::NotFound | Self::CannotRetry | Self::PermanentlyFailed | Self::Validation => {
                Disposition::Ack
            }
            Self::StoreUnavailable | Self::BrokerUnavailable => Disposition::Requeue,
            Self::MalformedMessage => Disposition::Reject,
        }
    }
}

impl Error {
    /// Classify this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Database(_) | Self::CorruptRecord { .. } | Self::SendAndUpdateFailed { .. } => {
                ErrorKind::StoreUnavailable
            }
            Self::Queue(_) => ErrorKind::BrokerUnavailable,
            Self::Serde(_) | Self::InvalidMessage(_) => ErrorKind::MalformedMessage,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::CannotRetry { .. } => ErrorKind::CannotRetry,
            Self::PermanentlyFailed { .. } => ErrorKind::PermanentlyFailed,
        }
    }
}
