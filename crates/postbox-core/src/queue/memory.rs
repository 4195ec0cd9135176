//! In-process broker channel.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tracing::debug;
use uuid::Uuid;

use super::channel::{BrokerChannel, QueueError, QueueOptions};
use super::message::{Delivery, DeliveryTag, Publishing};

/// A message removed from the queue by [`BrokerChannel::reject`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    /// Broker-level message ID.
    pub message_id: Uuid,
    /// Serialized envelope.
    pub body: Vec<u8>,
    /// Why it was rejected.
    pub reason: String,
    /// Redeliveries before rejection.
    pub redelivery_count: u32,
}

#[derive(Debug, Clone)]
struct Entry {
    message_id: Uuid,
    content_type: String,
    body: Vec<u8>,
    redelivery_count: u32,
    published_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct State {
    ready: VecDeque<Entry>,
    in_flight: HashMap<DeliveryTag, (u64, Entry)>,
    dead_letters: Vec<DeadLetter>,
    next_tag: u64,
}

struct Shared {
    options: QueueOptions,
    state: Mutex<State>,
    notify: Notify,
    next_channel: AtomicU64,
}

/// In-memory [`BrokerChannel`] for development and testing.
///
/// Messages live in a `VecDeque` behind a mutex. Not durable: all messages
/// are lost on restart. Handles created with [`MemoryBroker::channel`]
/// share one queue but are opened and closed independently.
pub struct MemoryBroker {
    shared: Arc<Shared>,
    channel_id: u64,
    connected: AtomicBool,
}

impl MemoryBroker {
    /// Declare a new queue and open a channel on it.
    #[must_use]
    pub fn new(options: QueueOptions) -> Self {
        let shared = Arc::new(Shared {
            options,
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            next_channel: AtomicU64::new(1),
        });

        Self {
            shared,
            channel_id: 0,
            connected: AtomicBool::new(true),
        }
    }

    /// Open another channel on the same queue.
    #[must_use]
    pub fn channel(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            channel_id: self.shared.next_channel.fetch_add(1, Ordering::Relaxed),
            connected: AtomicBool::new(true),
        }
    }

    /// Messages waiting to be delivered.
    pub async fn len(&self) -> usize {
        self.shared.state.lock().await.ready.len()
    }

    /// Returns true when no message is waiting.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Delivered but not yet acknowledged messages, across all channels.
    pub async fn in_flight(&self) -> usize {
        self.shared.state.lock().await.in_flight.len()
    }

    /// Messages rejected so far.
    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.shared.state.lock().await.dead_letters.clone()
    }

    fn ensure_connected(&self) -> Result<(), QueueError> {
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(QueueError::NotConnected)
        }
    }

    fn take_owned(&self, state: &mut State, tag: DeliveryTag) -> Result<Entry, QueueError> {
        match state.in_flight.get(&tag) {
            Some((owner, _)) if *owner == self.channel_id => state
                .in_flight
                .remove(&tag)
                .map(|(_, entry)| entry)
                .ok_or(QueueError::UnknownDeliveryTag(tag)),
            _ => Err(QueueError::UnknownDeliveryTag(tag)),
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryBroker {
    async fn publish(&self, publishing: Publishing) -> Result<(), QueueError> {
        self.ensure_connected()?;

        let expires_at = self.shared.options.message_ttl.and_then(|ttl| {
            chrono::Duration::from_std(ttl)
                .ok()
                .map(|ttl| publishing.published_at + ttl)
        });

        let entry = Entry {
            message_id: publishing.message_id,
            content_type: publishing.content_type,
            body: publishing.body,
            redelivery_count: 0,
            published_at: publishing.published_at,
            expires_at,
        };

        self.shared.state.lock().await.ready.push_back(entry);
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn receive(&self) -> Result<Delivery, QueueError> {
        loop {
            let notified = self.shared.notify.notified();
            if let Some(delivery) = self.try_receive().await? {
                return Ok(delivery);
            }
            notified.await;
        }
    }

    async fn try_receive(&self) -> Result<Option<Delivery>, QueueError> {
        self.ensure_connected()?;

        let mut state = self.shared.state.lock().await;

        let now = Utc::now();
        let before = state.ready.len();
        state
            .ready
            .retain(|entry| entry.expires_at.is_none_or(|at| at > now));
        let expired = before - state.ready.len();
        if expired > 0 {
            debug!(queue = %self.shared.options.name, expired, "dropped expired messages");
        }

        let Some(entry) = state.ready.pop_front() else {
            return Ok(None);
        };

        state.next_tag += 1;
        let tag = DeliveryTag(state.next_tag);
        let delivery = Delivery {
            tag,
            message_id: entry.message_id,
            content_type: entry.content_type.clone(),
            body: entry.body.clone(),
            redelivery_count: entry.redelivery_count,
            published_at: entry.published_at,
        };
        state.in_flight.insert(tag, (self.channel_id, entry));

        Ok(Some(delivery))
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), QueueError> {
        let mut state = self.shared.state.lock().await;
        self.take_owned(&mut state, tag)?;
        Ok(())
    }

    async fn nack_requeue(&self, tag: DeliveryTag) -> Result<(), QueueError> {
        let mut state = self.shared.state.lock().await;
        let mut entry = self.take_owned(&mut state, tag)?;
        entry.redelivery_count += 1;
        state.ready.push_front(entry);
        drop(state);

        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn reject(&self, tag: DeliveryTag, reason: &str) -> Result<(), QueueError> {
        let mut state = self.shared.state.lock().await;
        let entry = self.take_owned(&mut state, tag)?;
        state.dead_letters.push(DeadLetter {
            message_id: entry.message_id,
            body: entry.body,
            reason: reason.to_string(),
            redelivery_count: entry.redelivery_count,
        });
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn close(&self) {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return;
        }

        let mut state = self.shared.state.lock().await;
        let mut owned: Vec<DeliveryTag> = state
            .in_flight
            .iter()
            .filter(|(_, (owner, _))| *owner == self.channel_id)
            .map(|(tag, _)| *tag)
            .collect();
        owned.sort_unstable();

        // Oldest delivery ends up at the front.
        for tag in owned.into_iter().rev() {
            if let Some((_, entry)) = state.in_flight.remove(&tag) {
                state.ready.push_front(entry);
            }
        }
        drop(state);

        self.shared.notify.notify_waiters();
    }
}
