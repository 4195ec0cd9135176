//! Delivery state machine shared by the queue consumer and the sweep job.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::sender::{EmailSender, SendError};
use crate::email::{Email, EmailStatus, EmailStore};
use crate::queue::QueueMessage;
use crate::{Error, Result};

/// Default bound on a single SMTP send.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Successful result of processing one email.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Delivered on this attempt.
    Sent,
    /// Was already delivered; nothing was done.
    AlreadySent,
    /// Delivery failed but attempts remain. The email stays pending.
    RetryLater {
        /// Attempts recorded so far.
        attempts: u32,
        /// Attempt ceiling.
        max_attempts: u32,
    },
}

/// Counters for one sweep batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Pending emails loaded.
    pub fetched: usize,
    /// Delivered.
    pub sent: usize,
    /// Failed with attempts remaining.
    pub retry_later: usize,
    /// Ended in an error (permanent failure, store error, ...).
    pub failed: usize,
}

/// Loads emails, sends them and records the outcome.
#[derive(Clone)]
pub struct EmailProcessor {
    store: Arc<dyn EmailStore>,
    sender: Arc<dyn EmailSender>,
    send_timeout: Duration,
}

impl EmailProcessor {
    /// Create a processor with the default send timeout.
    #[must_use]
    pub fn new(store: Arc<dyn EmailStore>, sender: Arc<dyn EmailSender>) -> Self {
        Self {
            store,
            sender,
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }

    /// Override the send timeout.
    #[must_use]
    pub const fn with_send_timeout(mut self, send_timeout: Duration) -> Self {
        self.send_timeout = send_timeout;
        self
    }

    /// Bound applied to each send.
    #[must_use]
    pub const fn send_timeout(&self) -> Duration {
        self.send_timeout
    }

    /// Process a queued envelope.
    ///
    /// The envelope only identifies the email; its state is always reloaded
    /// from the store.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] when the email does not exist
    /// - [`Error::CannotRetry`] when it is failed or out of attempts
    /// - [`Error::PermanentlyFailed`] when the last attempt failed
    /// - [`Error::SendAndUpdateFailed`] when the failure could not be recorded
    /// - store errors
    pub async fn process_message(&self, message: &QueueMessage) -> Result<Outcome> {
        let email = match self.store.get_by_id(message.email_id).await {
            Ok(email) => email,
            Err(Error::NotFound(id)) => {
                warn!(email_id = %id, "queued email does not exist in store");
                return Err(Error::NotFound(id));
            }
            Err(e) => return Err(e),
        };

        self.process_email(email).await
    }

    /// Attempt delivery of an email loaded from the store.
    ///
    /// # Errors
    ///
    /// Same as [`EmailProcessor::process_message`], minus `NotFound`.
    pub async fn process_email(&self, mut email: Email) -> Result<Outcome> {
        if email.status == EmailStatus::Sent {
            info!(email_id = %email.id, "email already sent, skipping");
            return Ok(Outcome::AlreadySent);
        }

        if !email.can_retry() {
            return Err(Error::CannotRetry {
                id: email.id,
                attempts: email.attempts,
                max_attempts: email.max_attempts,
            });
        }

        debug!(
            email_id = %email.id,
            attempt = email.attempts + 1,
            max_attempts = email.max_attempts,
            "sending email"
        );

        match self.send(&email).await {
            Ok(()) => {
                email.mark_sent();
                if let Err(e) = self.store.update(&email).await {
                    error!(email_id = %email.id, error = %e, "email sent but status update failed");
                    return Err(e);
                }
                info!(email_id = %email.id, to = %email.to, "email sent");
                Ok(Outcome::Sent)
            }
            Err(send_error) => self.record_failure(email, &send_error).await,
        }
    }

    /// Run the delivery logic over up to `limit` pending emails, oldest first.
    ///
    /// Per-email errors are logged and counted, never returned.
    ///
    /// # Errors
    ///
    /// Returns an error only if the pending batch cannot be loaded.
    pub async fn process_pending_batch(&self, limit: u32) -> Result<BatchReport> {
        let emails = self.store.get_pending(limit).await?;
        let mut report = BatchReport {
            fetched: emails.len(),
            ..BatchReport::default()
        };

        for email in emails {
            let id = email.id;
            match self.process_email(email).await {
                Ok(Outcome::Sent) => report.sent += 1,
                Ok(Outcome::RetryLater { .. }) => report.retry_later += 1,
                Ok(Outcome::AlreadySent) => {}
                Err(e) => {
                    warn!(email_id = %id, error = %e, "pending email not delivered");
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    async fn send(&self, email: &Email) -> std::result::Result<(), SendError> {
        tokio::time::timeout(self.send_timeout, self.sender.send(email))
            .await
            .unwrap_or(Err(SendError::Timeout))
    }

    async fn record_failure(&self, mut email: Email, send_error: &SendError) -> Result<Outcome> {
        email.mark_failed(format!("email send failed: {send_error}"));

        if let Err(update_error) = self.store.update(&email).await {
            return Err(Error::SendAndUpdateFailed {
                id: email.id,
                send_error: send_error.to_string(),
                update_error: Box::new(update_error),
            });
        }

        if email.status == EmailStatus::Failed {
            error!(
                email_id = %email.id,
                attempts = email.attempts,
                error = %send_error,
                "email permanently failed"
            );
            return Err(Error::PermanentlyFailed {
                id: email.id,
                attempts: email.attempts,
                reason: send_error.to_string(),
            });
        }

        warn!(
            email_id = %email.id,
            attempts = email.attempts,
            max_attempts = email.max_attempts,
            error = %send_error,
            "email send failed, will retry"
        );
        Ok(Outcome::RetryLater {
            attempts: email.attempts,
            max_attempts: email.max_attempts,
        })
    }
}
