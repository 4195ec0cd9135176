//! Email entity and delivery state machine.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::template;
use super::validation::{ValidationError, validate_email_entity, validate_welcome_data};

/// Default attempt ceiling for new emails.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Subject line of the welcome email.
pub const WELCOME_SUBJECT: &str = "Welcome to Backend Challenge!";

/// Unique identifier for an email.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EmailId(pub Uuid);

impl EmailId {
    /// Generate a new random email ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns true for the all-zero UUID.
    #[must_use]
    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl Default for EmailId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EmailId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EmailId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Kind of email. Only welcome emails exist today.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmailType {
    /// Sent once after signup.
    Welcome,
}

impl EmailType {
    /// Wire/storage name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Welcome => "welcome",
        }
    }
}

impl fmt::Display for EmailType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EmailType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "welcome" => Ok(Self::Welcome),
            other => Err(format!("unknown email type: {other}")),
        }
    }
}

/// Delivery status of an email.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmailStatus {
    /// Not yet delivered and attempts remain.
    #[default]
    Pending,
    /// Delivered (terminal).
    Sent,
    /// Attempts exhausted (terminal).
    Failed,
}

impl EmailStatus {
    /// Wire/storage name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }

    /// Returns true for `sent` and `failed`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Sent | Self::Failed)
    }
}

impl fmt::Display for EmailStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EmailStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown email status: {other}")),
        }
    }
}

/// Input for a welcome email, as produced by the signup flow.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WelcomeEmailData {
    /// ID of the user that signed up.
    pub user_id: String,
    /// Display name of the user.
    pub user_name: String,
    /// Address the welcome email goes to.
    pub user_email: String,
}

impl WelcomeEmailData {
    /// Creates welcome data for a user.
    #[must_use]
    pub fn new(
        user_id: impl Into<String>,
        user_name: impl Into<String>,
        user_email: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            user_name: user_name.into(),
            user_email: user_email.into(),
        }
    }
}

/// One outbound email and its retry bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Email {
    /// Unique identifier, immutable.
    pub id: EmailId,
    /// Recipient address.
    pub to: String,
    /// Rendered subject.
    pub subject: String,
    /// Rendered HTML body.
    pub body: String,
    /// Email kind.
    #[serde(rename = "type")]
    pub email_type: EmailType,
    /// Delivery status.
    pub status: EmailStatus,
    /// Failed delivery attempts so far.
    pub attempts: u32,
    /// Attempt ceiling.
    pub max_attempts: u32,
    /// Last failure reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
    /// Creation time, immutable.
    pub created_at: DateTime<Utc>,
    /// Delivery time, set on transition to `sent`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
}

impl Email {
    /// Build a pending welcome email for a newly signed up user.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] if the user ID or name is missing, the
    /// address is empty or malformed, or the rendered email is invalid.
    pub fn welcome(data: &WelcomeEmailData) -> Result<Self, ValidationError> {
        validate_welcome_data(data)?;

        let email = Self {
            id: EmailId::new(),
            to: data.user_email.trim().to_string(),
            subject: WELCOME_SUBJECT.to_string(),
            body: template::welcome_body(&data.user_name),
            email_type: EmailType::Welcome,
            status: EmailStatus::Pending,
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            error_msg: None,
            created_at: Utc::now(),
            sent_at: None,
        };

        validate_email_entity(&email)?;
        Ok(email)
    }

    /// Record a successful delivery.
    ///
    /// Calling this twice only advances `sent_at`; callers gate on
    /// [`Email::can_retry`] before sending.
    pub fn mark_sent(&mut self) {
        self.status = EmailStatus::Sent;
        self.sent_at = Some(Utc::now());
    }

    /// Record a failed delivery attempt.
    ///
    /// Once `attempts` reaches `max_attempts` the email becomes `failed`.
    /// The counter saturates at the ceiling.
    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        if self.attempts < self.max_attempts {
            self.attempts += 1;
        }
        self.error_msg = Some(reason.into());

        self.status = if self.attempts >= self.max_attempts {
            EmailStatus::Failed
        } else {
            EmailStatus::Pending
        };
    }

    /// Returns true if a delivery attempt may be made.
    #[must_use]
    pub fn can_retry(&self) -> bool {
        self.status == EmailStatus::Pending && self.attempts < self.max_attempts
    }

    /// Returns true once the email is `sent` or `failed`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn john() -> WelcomeEmailData {
        WelcomeEmailData::new(Uuid::new_v4().to_string(), "John Doe", "john@example.com")
    }

    #[test]
    fn test_welcome_email_defaults() {
        let email = Email::welcome(&john()).unwrap();

        assert!(!email.id.is_nil());
        assert_eq!(email.to, "john@example.com");
        assert_eq!(email.subject, WELCOME_SUBJECT);
        assert!(email.body.contains("John Doe"));
        assert_eq!(email.email_type, EmailType::Welcome);
        assert_eq!(email.status, EmailStatus::Pending);
        assert_eq!(email.attempts, 0);
        assert_eq!(email.max_attempts, 3);
        assert!(email.sent_at.is_none());
        assert!(email.error_msg.is_none());
        assert!(email.can_retry());
    }

    #[test]
    fn test_welcome_email_rejects_missing_fields() {
        let mut data = john();
        data.user_email = String::new();
        assert_eq!(Email::welcome(&data), Err(ValidationError::EmptyEmail));

        let mut data = john();
        data.user_email = "invalid-email".into();
        assert_eq!(Email::welcome(&data), Err(ValidationError::InvalidEmail));

        let mut data = john();
        data.user_name = String::new();
        assert_eq!(Email::welcome(&data), Err(ValidationError::EmptyUserName));

        let mut data = john();
        data.user_id = String::new();
        assert_eq!(Email::welcome(&data), Err(ValidationError::EmptyUserId));
    }

    #[test]
    fn test_unique_ids() {
        let a = Email::welcome(&john()).unwrap();
        let b = Email::welcome(&john()).unwrap();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_mark_sent() {
        let mut email = Email::welcome(&john()).unwrap();
        let before = Utc::now();
        email.mark_sent();

        assert_eq!(email.status, EmailStatus::Sent);
        assert!(email.sent_at.unwrap() >= before);
        assert_eq!(email.attempts, 0);
        assert!(!email.can_retry());
        assert!(email.is_terminal());
    }

    #[test]
    fn test_failures_until_exhausted() {
        let mut email = Email::welcome(&john()).unwrap();

        email.mark_failed("first");
        assert_eq!((email.status, email.attempts), (EmailStatus::Pending, 1));
        assert!(email.can_retry());

        email.mark_failed("second");
        assert_eq!((email.status, email.attempts), (EmailStatus::Pending, 2));
        assert!(email.can_retry());

        email.mark_failed("final");
        assert_eq!((email.status, email.attempts), (EmailStatus::Failed, 3));
        assert_eq!(email.error_msg.as_deref(), Some("final"));
        assert!(!email.can_retry());
    }

    #[test]
    fn test_sent_after_failure() {
        let mut email = Email::welcome(&john()).unwrap();
        email.mark_failed("temporary");
        email.mark_sent();

        assert_eq!(email.status, EmailStatus::Sent);
        assert_eq!(email.attempts, 1);
        assert!(!email.can_retry());
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [EmailStatus::Pending, EmailStatus::Sent, EmailStatus::Failed] {
            assert_eq!(status.as_str().parse::<EmailStatus>().unwrap(), status);
        }
        assert!("queued".parse::<EmailStatus>().is_err());
        assert_eq!("welcome".parse::<EmailType>().unwrap(), EmailType::Welcome);
    }

    proptest! {
        #[test]
        fn attempts_never_exceed_ceiling(max in 1u32..=10, failures in 0usize..30) {
            let mut email = Email::welcome(&john()).unwrap();
            email.max_attempts = max;
            for n in 0..failures {
                email.mark_failed(format!("failure {n}"));
                prop_assert!(email.attempts <= email.max_attempts);
            }
            if failures as u32 >= max {
                prop_assert_eq!(email.status, EmailStatus::Failed);
                prop_assert_eq!(email.attempts, max);
            }
        }

        #[test]
        fn one_short_of_ceiling_stays_pending(max in 1u32..=10) {
            let mut email = Email::welcome(&john()).unwrap();
            email.max_attempts = max;
            for _ in 1..max {
                email.mark_failed("soft");
            }
            prop_assert_eq!(email.status, EmailStatus::Pending);
            prop_assert!(email.can_retry());
        }

        #[test]
        fn sent_implies_sent_at(failures in 0u32..2) {
            let mut email = Email::welcome(&john()).unwrap();
            for _ in 0..failures {
                email.mark_failed("soft");
            }
            email.mark_sent();
            prop_assert!(email.sent_at.is_some());
            prop_assert!(!email.can_retry());
        }
    }
}
