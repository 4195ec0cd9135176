//! # postbox-core
//!
//! Asynchronous email delivery for the postbox backend.
//!
//! This crate provides:
//! - The email entity and its delivery state machine
//! - Email storage (`SQLite`)
//! - Queue envelopes and broker channels (in-memory and durable `SQLite`)
//! - Publisher, queue consumer and periodic sweep
//! - SMTP delivery

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod email;
mod error;
pub mod queue;
pub mod service;

pub use email::{
    Email, EmailId, EmailStatus, EmailStore, EmailType, SqliteEmailStore, ValidationError,
    WelcomeEmailData,
};
pub use error::{Disposition, Error, ErrorKind, Result};
pub use queue::{BrokerChannel, MemoryBroker, QueueError, QueueMessage, QueueOptions, SqliteBroker};
pub use service::{
    BatchReport, Consumer, EmailProcessor, EmailPublisher, EmailSender, Outcome, Publisher,
    SendError, SignupMailer, SmtpSender, SmtpSettings, Sweeper, TlsMode,
};
