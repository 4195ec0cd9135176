//! Email validation.

use super::model::{Email, WelcomeEmailData};

/// Longest subject accepted, in bytes.
pub const MAX_SUBJECT_LEN: usize = 255;

/// Largest body accepted, in bytes.
pub const MAX_BODY_LEN: usize = 65_535;

/// Highest `max_attempts` an email may carry.
pub const MAX_ATTEMPTS_CEILING: u32 = 10;

/// Validation error for welcome input or a rendered email.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// User ID is empty.
    EmptyUserId,
    /// User name is empty.
    EmptyUserName,
    /// Email address is empty.
    EmptyEmail,
    /// Email address format is invalid.
    InvalidEmail,
    /// Subject is empty.
    EmptySubject,
    /// Subject exceeds [`MAX_SUBJECT_LEN`].
    SubjectTooLong,
    /// Body is empty.
    EmptyBody,
    /// Body exceeds [`MAX_BODY_LEN`].
    BodyTooLarge,
    /// `max_attempts` outside `1..=10`.
    InvalidMaxAttempts,
}

impl ValidationError {
    /// Get human-readable error message.
    #[must_use]
    pub const fn message(&self) -> &'static str {
        match self {
            Self::EmptyUserId => "user ID is required",
            Self::EmptyUserName => "user name is required",
            Self::EmptyEmail => "email is required",
            Self::InvalidEmail => "invalid email format",
            Self::EmptySubject => "email subject is required",
            Self::SubjectTooLong => "email subject must be less than 255 characters",
            Self::EmptyBody => "email body is required",
            Self::BodyTooLarge => "email body is too large",
            Self::InvalidMaxAttempts => "max attempts must be between 1 and 10",
        }
    }

    /// Get the field name this error relates to.
    #[must_use]
    pub const fn field(&self) -> &'static str {
        match self {
            Self::EmptyUserId => "user_id",
            Self::EmptyUserName => "user_name",
            Self::EmptyEmail | Self::InvalidEmail => "email",
            Self::EmptySubject | Self::SubjectTooLong => "subject",
            Self::EmptyBody | Self::BodyTooLarge => "body",
            Self::InvalidMaxAttempts => "max_attempts",
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field(), self.message())
    }
}

impl std::error::Error for ValidationError {}

/// Validate an email address.
///
/// # Errors
///
/// Returns [`ValidationError::EmptyEmail`] or [`ValidationError::InvalidEmail`].
pub fn validate_address(address: &str) -> Result<(), ValidationError> {
    if address.trim().is_empty() {
        return Err(ValidationError::EmptyEmail);
    }
    if !is_valid_email(address) {
        return Err(ValidationError::InvalidEmail);
    }
    Ok(())
}

/// Validate the input of a welcome email.
///
/// # Errors
///
/// Returns the first failing check: user ID, user name, then address.
pub fn validate_welcome_data(data: &WelcomeEmailData) -> Result<(), ValidationError> {
    if data.user_id.trim().is_empty() {
        return Err(ValidationError::EmptyUserId);
    }
    if data.user_name.trim().is_empty() {
        return Err(ValidationError::EmptyUserName);
    }
    validate_address(&data.user_email)
}

/// Validate a rendered email before it is persisted.
///
/// # Errors
///
/// Returns the first failing check on recipient, subject, body and attempt ceiling.
pub fn validate_email_entity(email: &Email) -> Result<(), ValidationError> {
    validate_address(&email.to)?;

    if email.subject.is_empty() {
        return Err(ValidationError::EmptySubject);
    }
    if email.subject.len() > MAX_SUBJECT_LEN {
        return Err(ValidationError::SubjectTooLong);
    }

    if email.body.is_empty() {
        return Err(ValidationError::EmptyBody);
    }
    if email.body.len() > MAX_BODY_LEN {
        return Err(ValidationError::BodyTooLarge);
    }

    if email.max_attempts == 0 || email.max_attempts > MAX_ATTEMPTS_CEILING {
        return Err(ValidationError::InvalidMaxAttempts);
    }

    Ok(())
}

/// Basic email validation: `local@domain.tld`.
fn is_valid_email(email: &str) -> bool {
    let email = email.trim();

    // Must contain exactly one @
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    if domain.contains('@') {
        return false;
    }

    if local.is_empty()
        || !local
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '%' | '+' | '-'))
    {
        return false;
    }

    if !domain
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-'))
    {
        return false;
    }

    // Domain needs a dot and an alphabetic TLD of two or more letters
    let Some((host, tld)) = domain.rsplit_once('.') else {
        return false;
    };
    if host.is_empty() || host.split('.').any(str::is_empty) {
        return false;
    }

    tld.len() >= 2 && tld.chars().all(|c| c.is_ascii_alphabetic())
}
