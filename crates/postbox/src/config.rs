//! Worker configuration.
//!
//! Loaded from an optional TOML file, then overridden from the environment.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, bail};
use postbox_core::queue::EMAIL_QUEUE;
use postbox_core::{QueueOptions, SmtpSettings, TlsMode};
use serde::Deserialize;

mod defaults {
    use super::EMAIL_QUEUE;

    pub fn database_path() -> String {
        "postbox.db".to_string()
    }

    pub fn broker_path() -> String {
        "postbox-queue.db".to_string()
    }

    pub fn queue() -> String {
        EMAIL_QUEUE.to_string()
    }

    pub const fn message_ttl_secs() -> u64 {
        3600
    }

    pub const fn poll_interval_ms() -> u64 {
        500
    }

    pub const fn visibility_timeout_secs() -> u64 {
        300
    }

    pub const fn connect_attempts() -> u32 {
        5
    }

    pub const fn max_redeliveries() -> u32 {
        3
    }

    pub fn smtp_host() -> String {
        "localhost".to_string()
    }

    pub const fn smtp_port() -> u16 {
        1025
    }

    pub fn smtp_from() -> String {
        "noreply@example.com".to_string()
    }

    pub const fn timeout_secs() -> u64 {
        30
    }

    pub const fn processing_timeout_secs() -> u64 {
        60
    }

    pub const fn consumers() -> usize {
        1
    }

    pub const fn sweep_interval_secs() -> u64 {
        60
    }

    pub const fn sweep_batch_size() -> u32 {
        50
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Config {
    /// Email store.
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Message queue.
    #[serde(default)]
    pub broker: BrokerConfig,
    /// Outbound mail server.
    #[serde(default)]
    pub smtp: SmtpConfig,
    /// Queue consumers.
    #[serde(default)]
    pub worker: WorkerConfig,
    /// Periodic reconciliation.
    #[serde(default)]
    pub sweep: SweepConfig,
}

/// Email store settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DatabaseConfig {
    /// `SQLite` database file.
    #[serde(default = "defaults::database_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: defaults::database_path(),
        }
    }
}

/// Which broker channel implementation to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    /// Durable queue in a `SQLite` file.
    #[default]
    Sqlite,
    /// In-process queue, lost on restart.
    Memory,
}

/// Message queue settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BrokerConfig {
    /// Channel implementation.
    #[serde(default)]
    pub kind: BrokerKind,
    /// Queue database file (`sqlite` kind only).
    #[serde(default = "defaults::broker_path")]
    pub path: String,
    /// Queue name.
    #[serde(default = "defaults::queue")]
    pub queue: String,
    /// Message time-to-live in seconds. `0` disables expiry.
    #[serde(default = "defaults::message_ttl_secs")]
    pub message_ttl_secs: u64,
    /// Poll interval while the queue is empty, in milliseconds.
    #[serde(default = "defaults::poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Lease on an unacked delivery, in seconds.
    #[serde(default = "defaults::visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,
    /// Connection attempts at startup.
    #[serde(default = "defaults::connect_attempts")]
    pub connect_attempts: u32,
    /// Requeues allowed for a message before it is dead-lettered.
    #[serde(default = "defaults::max_redeliveries")]
    pub max_redeliveries: u32,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            kind: BrokerKind::default(),
            path: defaults::broker_path(),
            queue: defaults::queue(),
            message_ttl_secs: defaults::message_ttl_secs(),
            poll_interval_ms: defaults::poll_interval_ms(),
            visibility_timeout_secs: defaults::visibility_timeout_secs(),
            connect_attempts: defaults::connect_attempts(),
            max_redeliveries: defaults::max_redeliveries(),
        }
    }
}

/// Mail server settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SmtpConfig {
    /// Server hostname.
    #[serde(default = "defaults::smtp_host")]
    pub host: String,
    /// Server port.
    #[serde(default = "defaults::smtp_port")]
    pub port: u16,
    /// Sender address.
    #[serde(default = "defaults::smtp_from")]
    pub from: String,
    /// Login name.
    #[serde(default)]
    pub username: Option<String>,
    /// Login password.
    #[serde(default)]
    pub password: Option<String>,
    /// Connection security.
    #[serde(default)]
    pub tls: TlsMode,
    /// Connection and command timeout in seconds.
    #[serde(default = "defaults::timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: defaults::smtp_host(),
            port: defaults::smtp_port(),
            from: defaults::smtp_from(),
            username: None,
            password: None,
            tls: TlsMode::default(),
            timeout_secs: defaults::timeout_secs(),
        }
    }
}

/// Queue consumer settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WorkerConfig {
    /// Concurrent consumers.
    #[serde(default = "defaults::consumers")]
    pub consumers: usize,
    /// Bound on processing one delivery, in seconds. Must exceed
    /// `send_timeout_secs`.
    #[serde(default = "defaults::processing_timeout_secs")]
    pub processing_timeout_secs: u64,
    /// Bound on one SMTP send, in seconds.
    #[serde(default = "defaults::timeout_secs")]
    pub send_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            consumers: defaults::consumers(),
            processing_timeout_secs: defaults::processing_timeout_secs(),
            send_timeout_secs: defaults::timeout_secs(),
        }
    }
}

/// Sweep settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SweepConfig {
    /// Seconds between sweeps.
    #[serde(default = "defaults::sweep_interval_secs")]
    pub interval_secs: u64,
    /// Pending emails per sweep.
    #[serde(default = "defaults::sweep_batch_size")]
    pub batch_size: u32,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval_secs: defaults::sweep_interval_secs(),
            batch_size: defaults::sweep_batch_size(),
        }
    }
}

impl Config {
    /// Load from an optional file and apply environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, an override is
    /// malformed, or the result is invalid.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read config file {}", path.display()))?;
                Self::from_toml(&raw)
                    .with_context(|| format!("failed to parse config file {}", path.display()))?
            }
            None => Self::default(),
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not valid configuration.
    pub fn from_toml(raw: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Apply overrides from environment-style variables.
    ///
    /// # Errors
    ///
    /// Returns an error if `SMTP_PORT` is not a port number.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        if let Some(path) = var("POSTBOX_DATABASE") {
            self.database.path = path;
        }
        if let Some(path) = var("POSTBOX_BROKER_DATABASE") {
            self.broker.path = path;
        }
        if let Some(host) = var("SMTP_HOST") {
            self.smtp.host = host;
        }
        if let Some(port) = var("SMTP_PORT") {
            self.smtp.port = port
                .parse()
                .with_context(|| format!("invalid SMTP_PORT: {port}"))?;
        }
        if let Some(from) = var("SMTP_FROM") {
            self.smtp.from = from;
        }
        if let Some(username) = var("SMTP_USERNAME") {
            self.smtp.username = Some(username);
        }
        if let Some(password) = var("SMTP_PASSWORD") {
            self.smtp.password = Some(password);
        }
        Ok(())
    }

    /// Reject settings the worker cannot run with.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first invalid setting.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.worker.consumers == 0 {
            bail!("worker.consumers must be at least 1");
        }
        if self.worker.send_timeout_secs == 0 {
            bail!("worker.send_timeout_secs must be positive");
        }
        if self.worker.processing_timeout_secs <= self.worker.send_timeout_secs {
            bail!(
                "worker.processing_timeout_secs ({}) must exceed worker.send_timeout_secs ({})",
                self.worker.processing_timeout_secs,
                self.worker.send_timeout_secs
            );
        }
        if self.smtp.timeout_secs == 0 {
            bail!("smtp.timeout_secs must be positive");
        }
        if self.sweep.interval_secs == 0 {
            bail!("sweep.interval_secs must be positive");
        }
        if self.sweep.batch_size == 0 {
            bail!("sweep.batch_size must be positive");
        }
        if self.broker.queue.trim().is_empty() {
            bail!("broker.queue must not be empty");
        }
        if self.smtp.host.trim().is_empty() {
            bail!("smtp.host must not be empty");
        }
        Ok(())
    }

    /// Broker queue declaration.
    #[must_use]
    pub fn queue_options(&self) -> QueueOptions {
        QueueOptions {
            name: self.broker.queue.clone(),
            message_ttl: (self.broker.message_ttl_secs > 0)
                .then(|| Duration::from_secs(self.broker.message_ttl_secs)),
            poll_interval: Duration::from_millis(self.broker.poll_interval_ms),
            visibility_timeout: Duration::from_secs(self.broker.visibility_timeout_secs),
        }
    }

    /// SMTP sender settings.
    #[must_use]
    pub fn smtp_settings(&self) -> SmtpSettings {
        SmtpSettings {
            host: self.smtp.host.clone(),
            port: self.smtp.port,
            from: self.smtp.from.clone(),
            username: self.smtp.username.clone(),
            password: self.smtp.password.clone(),
            tls: self.smtp.tls,
            timeout: Duration::from_secs(self.smtp.timeout_secs),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.broker.queue, "email_notifications");
        assert_eq!(config.broker.message_ttl_secs, 3600);
        assert_eq!(config.broker.connect_attempts, 5);
        assert_eq!(config.broker.max_redeliveries, 3);
        assert_eq!(config.worker.consumers, 1);
        assert_eq!(config.sweep.interval_secs, 60);
        assert_eq!(config.sweep.batch_size, 50);
        assert_eq!(config.smtp.timeout_secs, 30);
        assert_eq!(config.worker.send_timeout_secs, 30);
        assert_eq!(config.worker.processing_timeout_secs, 60);
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_sections() {
        let config = Config::from_toml(
            r#"
            [broker]
            kind = "memory"
            message_ttl_secs = 0

            [smtp]
            host = "smtp.example.com"
            port = 587
            tls = "starttls"
            username = "mailer"
            password = "secret"

            [worker]
            consumers = 4
            "#,
        )
        .unwrap();

        assert_eq!(config.broker.kind, BrokerKind::Memory);
        assert!(config.queue_options().message_ttl.is_none());
        assert_eq!(config.broker.path, "postbox-queue.db");
        assert_eq!(config.worker.consumers, 4);
        assert_eq!(config.worker.send_timeout_secs, 30);

        let smtp = config.smtp_settings();
        assert_eq!(smtp.tls, TlsMode::Starttls);
        assert!(smtp.credentials().is_some());
    }

    #[test]
    fn test_unknown_tls_mode_is_rejected() {
        assert!(Config::from_toml("[smtp]\ntls = \"ssl\"").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("POSTBOX_DATABASE", "/var/lib/postbox/emails.db"),
            ("SMTP_HOST", "mailcatcher"),
            ("SMTP_PORT", "2525"),
            ("SMTP_USERNAME", "worker"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config
            .apply_env(|key| env.get(key).map(ToString::to_string))
            .unwrap();

        assert_eq!(config.database.path, "/var/lib/postbox/emails.db");
        assert_eq!(config.smtp.host, "mailcatcher");
        assert_eq!(config.smtp.port, 2525);
        assert_eq!(config.smtp.username.as_deref(), Some("worker"));
        // Password missing, so the sender stays unauthenticated.
        assert!(config.smtp_settings().credentials().is_none());
    }

    #[test]
    fn test_bad_port_override() {
        let mut config = Config::default();
        let err = config
            .apply_env(|key| (key == "SMTP_PORT").then(|| "smtp".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("invalid SMTP_PORT"));
    }

    #[test]
    fn test_validate() {
        let mut config = Config::default();
        config.worker.consumers = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.sweep.interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_processing_timeout_must_exceed_send_timeout() {
        let mut config = Config::default();
        config.worker.processing_timeout_secs = config.worker.send_timeout_secs;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("processing_timeout_secs"));

        let mut config = Config::default();
        config.worker.send_timeout_secs = 0;
        assert!(config.validate().is_err());

        let config = Config::from_toml(
            "[worker]\nsend_timeout_secs = 90\nprocessing_timeout_secs = 120",
        )
        .unwrap();
        config.validate().unwrap();
    }
}
