//! Delivery pipeline services.
//!
//! The signup flow persists an email and publishes a reference to it
//! ([`SignupMailer`], [`Publisher`]). [`Consumer`] workers pull those
//! references and [`Sweeper`] rescans the store on a timer; both drive the
//! same [`EmailProcessor`].

mod consumer;
mod processor;
mod publisher;
mod sender;
mod signup;
mod smtp;
mod sweep;

pub use consumer::{Consumer, DEFAULT_MAX_REDELIVERIES, DEFAULT_PROCESSING_TIMEOUT};
pub use processor::{BatchReport, DEFAULT_SEND_TIMEOUT, EmailProcessor, Outcome};
pub use publisher::{EmailPublisher, Publisher};
pub use sender::{EmailSender, SendError};
pub use signup::SignupMailer;
pub use smtp::{SmtpSender, SmtpSettings, TlsMode};
pub use sweep::{DEFAULT_SWEEP_BATCH, DEFAULT_SWEEP_INTERVAL, Sweeper};
