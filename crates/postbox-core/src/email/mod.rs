//! Outbound email domain.
//!
//! An [`Email`] is the unit of work of the delivery pipeline. It is created
//! `pending`, and moves to `sent` on success or to `failed` once its
//! attempts are exhausted. Both end states are terminal.

mod model;
mod repository;
mod template;
mod validation;

pub use model::{
    DEFAULT_MAX_ATTEMPTS, Email, EmailId, EmailStatus, EmailType, WELCOME_SUBJECT,
    WelcomeEmailData,
};
pub use repository::{DEFAULT_PENDING_LIMIT, EmailStore, SqliteEmailStore};
pub use template::welcome_body;
pub use validation::{
    MAX_ATTEMPTS_CEILING, MAX_BODY_LEN, MAX_SUBJECT_LEN, ValidationError, validate_address,
    validate_email_entity, validate_welcome_data,
};
