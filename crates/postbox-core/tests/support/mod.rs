//! Test doubles shared by the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use postbox_core::email::DEFAULT_PENDING_LIMIT;
use postbox_core::{
    Email, EmailId, EmailSender, EmailStatus, EmailStore, Error, Result, SendError,
    WelcomeEmailData,
};

/// Welcome data for the n-th test user.
pub fn user(n: usize) -> WelcomeEmailData {
    WelcomeEmailData::new(
        format!("user-{n}"),
        format!("User {n}"),
        format!("user{n}@example.com"),
    )
}

/// Sender that replays scripted results, then succeeds.
#[derive(Default)]
pub struct ScriptedSender {
    script: Mutex<VecDeque<std::result::Result<(), SendError>>>,
    always_fail: Option<SendError>,
    sent: Mutex<Vec<EmailId>>,
    calls: Mutex<usize>,
}

impl ScriptedSender {
    /// Sender that always succeeds.
    pub fn ok() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Sender that always fails with `error`.
    pub fn failing(error: SendError) -> Arc<Self> {
        Arc::new(Self {
            always_fail: Some(error),
            ..Self::default()
        })
    }

    /// Sender that returns `results` in order, then succeeds.
    pub fn scripted(results: Vec<std::result::Result<(), SendError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(results.into()),
            ..Self::default()
        })
    }

    /// Number of send calls, successful or not.
    pub async fn calls(&self) -> usize {
        *self.calls.lock().await
    }

    /// IDs of emails delivered successfully.
    pub async fn sent(&self) -> Vec<EmailId> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl EmailSender for ScriptedSender {
    async fn send(&self, email: &Email) -> std::result::Result<(), SendError> {
        *self.calls.lock().await += 1;

        let result = match &self.always_fail {
            Some(error) => Err(error.clone()),
            None => self.script.lock().await.pop_front().unwrap_or(Ok(())),
        };

        if result.is_ok() {
            self.sent.lock().await.push(email.id);
        }
        result
    }
}

/// Sender whose sends never complete.
#[derive(Default)]
pub struct StalledSender {
    calls: Mutex<usize>,
}

impl StalledSender {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn calls(&self) -> usize {
        *self.calls.lock().await
    }
}

#[async_trait]
impl EmailSender for StalledSender {
    async fn send(&self, _email: &Email) -> std::result::Result<(), SendError> {
        *self.calls.lock().await += 1;
        std::future::pending().await
    }
}

/// Store wrapper whose reads and writes can be switched off or stalled.
pub struct FailingStore {
    inner: Arc<dyn EmailStore>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    stall_reads: AtomicBool,
}

impl FailingStore {
    pub fn new(inner: Arc<dyn EmailStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            stall_reads: AtomicBool::new(false),
        })
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make `get_by_id` hang forever.
    pub fn stall_reads(&self, stall: bool) {
        self.stall_reads.store(stall, Ordering::SeqCst);
    }

    fn check(&self, flag: &AtomicBool) -> Result<()> {
        if flag.load(Ordering::SeqCst) {
            Err(Error::Database(sqlx::Error::PoolTimedOut))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl EmailStore for FailingStore {
    async fn create(&self, email: &Email) -> Result<()> {
        self.check(&self.fail_writes)?;
        self.inner.create(email).await
    }

    async fn get_by_id(&self, id: EmailId) -> Result<Email> {
        if self.stall_reads.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.check(&self.fail_reads)?;
        self.inner.get_by_id(id).await
    }

    async fn update(&self, email: &Email) -> Result<()> {
        self.check(&self.fail_writes)?;
        self.inner.update(email).await
    }

    async fn get_pending(&self, limit: u32) -> Result<Vec<Email>> {
        self.check(&self.fail_reads)?;
        self.inner.get_pending(limit).await
    }
}

/// Store kept entirely in process memory.
///
/// Used where tokio time is paused, since it never leaves the runtime.
#[derive(Default)]
pub struct MemoryStore {
    emails: Mutex<HashMap<EmailId, Email>>,
    order: Mutex<Vec<EmailId>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn count_with_status(&self, status: EmailStatus) -> usize {
        self.emails
            .lock()
            .await
            .values()
            .filter(|email| email.status == status)
            .count()
    }
}

#[async_trait]
impl EmailStore for MemoryStore {
    async fn create(&self, email: &Email) -> Result<()> {
        self.emails.lock().await.insert(email.id, email.clone());
        self.order.lock().await.push(email.id);
        Ok(())
    }

    async fn get_by_id(&self, id: EmailId) -> Result<Email> {
        self.emails
            .lock()
            .await
            .get(&id)
            .cloned()
            .ok_or(Error::NotFound(id))
    }

    async fn update(&self, email: &Email) -> Result<()> {
        let mut emails = self.emails.lock().await;
        let stored = emails.get_mut(&email.id).ok_or(Error::NotFound(email.id))?;
        stored.status = email.status;
        stored.attempts = email.attempts;
        stored.error_msg.clone_from(&email.error_msg);
        stored.sent_at = email.sent_at;
        Ok(())
    }

    async fn get_pending(&self, limit: u32) -> Result<Vec<Email>> {
        let limit = if limit == 0 { DEFAULT_PENDING_LIMIT } else { limit };
        let emails = self.emails.lock().await;
        let order = self.order.lock().await;

        Ok(order
            .iter()
            .filter_map(|id| emails.get(id))
            .filter(|email| email.status == EmailStatus::Pending)
            .take(limit as usize)
            .cloned()
            .collect())
    }
}
