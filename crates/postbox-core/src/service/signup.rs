//! Producer hook for the signup flow.

use std::sync::Arc;

use tracing::{info, warn};

use super::publisher::EmailPublisher;
use crate::Result;
use crate::email::{Email, EmailStore, WelcomeEmailData};

/// Creates and enqueues the welcome email for a newly signed-up user.
///
/// The email is persisted before it is published, so a broker outage only
/// delays delivery until the next sweep.
#[derive(Clone)]
pub struct SignupMailer {
    store: Arc<dyn EmailStore>,
    publisher: Arc<dyn EmailPublisher>,
}

impl SignupMailer {
    /// Create a signup mailer.
    #[must_use]
    pub fn new(store: Arc<dyn EmailStore>, publisher: Arc<dyn EmailPublisher>) -> Self {
        Self { store, publisher }
    }

    /// Create, persist and publish a welcome email.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Validation`] for bad user data (nothing is
    /// stored) and store errors if the email cannot be persisted. Publish
    /// failures are logged, not returned.
    pub async fn welcome(&self, data: &WelcomeEmailData) -> Result<Email> {
        let email = Email::welcome(data)?;
        self.store.create(&email).await?;

        info!(email_id = %email.id, user_id = %data.user_id, "welcome email created");

        if let Err(e) = self.publisher.publish_welcome_email(email.id, data).await {
            warn!(
                email_id = %email.id,
                error = %e,
                "failed to publish welcome email, sweeper will deliver it"
            );
        }

        Ok(email)
    }
}
