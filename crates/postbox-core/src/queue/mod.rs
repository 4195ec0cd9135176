//! Message queue between the signup path and the delivery workers.
//!
//! The queue carries [`QueueMessage`] envelopes that reference an email by
//! ID. Delivery is at-least-once: a message can be seen more than once and
//! consumers must tolerate that.

mod channel;
mod memory;
mod message;
mod sqlite;

pub use channel::{BrokerChannel, EMAIL_QUEUE, QueueError, QueueOptions};
pub use memory::{DeadLetter, MemoryBroker};
pub use message::{Delivery, DeliveryTag, JSON_CONTENT_TYPE, Publishing, QueueMessage};
pub use sqlite::SqliteBroker;
