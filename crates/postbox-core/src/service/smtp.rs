//! SMTP sender built on lettre.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lettre::message::{Mailbox, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::sender::{EmailSender, SendError};
use crate::email::Email;

/// How the connection to the mail server is secured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    /// Plain text. For local catch-all servers.
    #[default]
    None,
    /// Upgrade with STARTTLS.
    Starttls,
    /// Implicit TLS.
    Tls,
}

impl TlsMode {
    /// Config string for this mode.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Starttls => "starttls",
            Self::Tls => "tls",
        }
    }
}

impl fmt::Display for TlsMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TlsMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "starttls" => Ok(Self::Starttls),
            "tls" => Ok(Self::Tls),
            other => Err(format!("unknown TLS mode: {other}")),
        }
    }
}

/// Mail server connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpSettings {
    /// Server hostname.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Sender address.
    pub from: String,
    /// Login name. Authentication is used only when both credentials are set.
    pub username: Option<String>,
    /// Login password.
    pub password: Option<String>,
    /// Connection security.
    pub tls: TlsMode,
    /// Connection and command timeout.
    pub timeout: Duration,
}

impl Default for SmtpSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1025,
            from: "noreply@example.com".to_string(),
            username: None,
            password: None,
            tls: TlsMode::None,
            timeout: Duration::from_secs(30),
        }
    }
}

impl SmtpSettings {
    /// Credentials, when both username and password are non-empty.
    #[must_use]
    pub fn credentials(&self) -> Option<Credentials> {
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(user), Some(pass)) if !user.is_empty() && !pass.is_empty() => {
                Some(Credentials::new(user.to_string(), pass.to_string()))
            }
            _ => None,
        }
    }
}

/// [`EmailSender`] delivering over SMTP.
///
/// Runs authenticated when credentials are configured, and unauthenticated
/// otherwise (development servers such as `MailCatcher`).
#[derive(Clone)]
pub struct SmtpSender {
    transport: Arc<AsyncSmtpTransport<Tokio1Executor>>,
    from: Mailbox,
    authenticated: bool,
}

impl SmtpSender {
    /// Build a sender. Does not connect.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::InvalidAddress`] for a bad sender address and
    /// [`SendError::Smtp`] if the TLS transport cannot be set up.
    pub fn new(settings: &SmtpSettings) -> Result<Self, SendError> {
        let from: Mailbox = settings
            .from
            .parse()
            .map_err(|_| SendError::InvalidAddress(settings.from.clone()))?;

        let mut builder = match settings.tls {
            TlsMode::None => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&settings.host),
            TlsMode::Tls => AsyncSmtpTransport::<Tokio1Executor>::relay(&settings.host)
                .map_err(|e| SendError::Smtp(e.to_string()))?,
            TlsMode::Starttls => AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.host)
                .map_err(|e| SendError::Smtp(e.to_string()))?,
        };

        builder = builder
            .port(settings.port)
            .timeout(Some(settings.timeout));

        let credentials = settings.credentials();
        let authenticated = credentials.is_some();
        if let Some(credentials) = credentials {
            builder = builder.credentials(credentials);
        }

        info!(
            host = %settings.host,
            port = settings.port,
            tls = %settings.tls,
            authenticated,
            "smtp sender configured"
        );

        Ok(Self {
            transport: Arc::new(builder.build()),
            from,
            authenticated,
        })
    }

    /// Returns true when the sender logs in to the server.
    #[must_use]
    pub const fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    fn build_message(&self, email: &Email) -> Result<Message, SendError> {
        let to: Mailbox = email
            .to
            .parse()
            .map_err(|_| SendError::InvalidAddress(email.to.clone()))?;

        Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(&email.subject)
            .singlepart(SinglePart::html(email.body.clone()))
            .map_err(|e| SendError::Build(e.to_string()))
    }
}

#[async_trait]
impl EmailSender for SmtpSender {
    async fn send(&self, email: &Email) -> Result<(), SendError> {
        let message = self.build_message(email)?;

        self.transport
            .send(message)
            .await
            .map_err(|e| SendError::Smtp(e.to_string()))?;

        debug!(email_id = %email.id, to = %email.to, "email handed to smtp server");
        Ok(())
    }
}
