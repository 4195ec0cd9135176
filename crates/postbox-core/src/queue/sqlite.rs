//! Durable broker channel backed by `SQLite`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::channel::{BrokerChannel, QueueError, QueueOptions};
use super::message::{Delivery, DeliveryTag, Publishing};

/// Durable [`BrokerChannel`] storing messages in a `SQLite` table.
///
/// A delivery is a lease: the row is locked by this channel until it is
/// acked, requeued or rejected. If the process dies first, the lease runs
/// out after [`QueueOptions::visibility_timeout`] and the message is
/// delivered again with its redelivery count bumped.
pub struct SqliteBroker {
    pool: SqlitePool,
    options: QueueOptions,
    consumer_tag: String,
    connected: AtomicBool,
}

impl SqliteBroker {
    /// Open (or create) a queue database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database connection fails or schema creation fails.
    pub async fn new(database_path: &str, options: QueueOptions) -> Result<Self, QueueError> {
        let url = format!("sqlite:{database_path}?mode=rwc");
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;

        Self::from_pool(pool, options).await
    }

    /// Create an in-memory queue for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database connection fails or schema creation fails.
    pub async fn in_memory(options: QueueOptions) -> Result<Self, QueueError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        Self::from_pool(pool, options).await
    }

    /// Wrap an existing pool, creating the schema if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if schema creation fails.
    pub async fn from_pool(pool: SqlitePool, options: QueueOptions) -> Result<Self, QueueError> {
        let broker = Self {
            pool,
            options,
            consumer_tag: Uuid::new_v4().to_string(),
            connected: AtomicBool::new(true),
        };
        broker.initialize().await?;
        Ok(broker)
    }

    /// Open the queue, retrying with a linear backoff (1s, 2s, ...).
    ///
    /// # Errors
    ///
    /// Returns the last connection error once `attempts` tries have failed.
    pub async fn connect_with_retry(
        database_path: &str,
        options: QueueOptions,
        attempts: u32,
    ) -> Result<Self, QueueError> {
        let attempts = attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match Self::new(database_path, options.clone()).await {
                Ok(broker) => {
                    info!(queue = %options.name, attempt, "connected to broker");
                    return Ok(broker);
                }
                Err(e) => {
                    warn!(queue = %options.name, attempt, error = %e, "failed to connect to broker");
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(Duration::from_secs(u64::from(attempt))).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or(QueueError::NotConnected))
    }

    /// Open another channel on the same database.
    #[must_use]
    pub fn channel(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            options: self.options.clone(),
            consumer_tag: Uuid::new_v4().to_string(),
            connected: AtomicBool::new(true),
        }
    }

    /// Close this channel and the connection pool it shares with its siblings.
    ///
    /// Every channel opened from this broker stops working afterwards.
    pub async fn shutdown(&self) {
        self.close().await;
        self.pool.close().await;
        debug!(queue = %self.options.name, "broker connection closed");
    }

    /// Messages in the queue, delivered or not.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn depth(&self) -> Result<u64, QueueError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queue_messages WHERE queue = ?")
            .bind(&self.options.name)
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    /// Messages rejected from this queue so far.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn dead_letter_count(&self) -> Result<u64, QueueError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dead_letters WHERE queue = ?")
            .bind(&self.options.name)
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    /// Initialize database schema.
    async fn initialize(&self) -> Result<(), QueueError> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS queue_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                queue TEXT NOT NULL,
                message_id TEXT NOT NULL,
                content_type TEXT NOT NULL,
                body BLOB NOT NULL,
                redelivery_count INTEGER NOT NULL DEFAULT 0,
                published_at INTEGER NOT NULL,
                expires_at INTEGER,
                locked_by TEXT,
                locked_until INTEGER
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_queue_messages_ready ON queue_messages(queue, locked_until)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS dead_letters (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                queue TEXT NOT NULL,
                message_id TEXT NOT NULL,
                content_type TEXT NOT NULL,
                body BLOB NOT NULL,
                redelivery_count INTEGER NOT NULL,
                published_at INTEGER NOT NULL,
                reason TEXT NOT NULL,
                rejected_at INTEGER NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn ensure_connected(&self) -> Result<(), QueueError> {
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(QueueError::NotConnected)
        }
    }

    async fn purge_expired(&self, now: i64) -> Result<(), QueueError> {
        let result = sqlx::query(
            r"
            DELETE FROM queue_messages
            WHERE queue = ? AND expires_at IS NOT NULL AND expires_at <= ?
              AND (locked_until IS NULL OR locked_until <= ?)
            ",
        )
        .bind(&self.options.name)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            debug!(queue = %self.options.name, expired = result.rows_affected(), "dropped expired messages");
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for SqliteBroker {
    async fn publish(&self, publishing: Publishing) -> Result<(), QueueError> {
        self.ensure_connected()?;

        let published_at = publishing.published_at.timestamp_millis();
        let expires_at = self
            .options
            .message_ttl
            .map(|ttl| published_at.saturating_add(millis(ttl)));

        sqlx::query(
            r"
            INSERT INTO queue_messages
                (queue, message_id, content_type, body, published_at, expires_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(&self.options.name)
        .bind(publishing.message_id.to_string())
        .bind(&publishing.content_type)
        .bind(&publishing.body)
        .bind(published_at)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        debug!(queue = %self.options.name, message_id = %publishing.message_id, "message published");
        Ok(())
    }

    async fn receive(&self) -> Result<Delivery, QueueError> {
        loop {
            if let Some(delivery) = self.try_receive().await? {
                return Ok(delivery);
            }
            tokio::time::sleep(self.options.poll_interval).await;
        }
    }

    async fn try_receive(&self) -> Result<Option<Delivery>, QueueError> {
        self.ensure_connected()?;

        let now = Utc::now().timestamp_millis();
        self.purge_expired(now).await?;

        // An expired lease counts as a redelivery.
        let row = sqlx::query(
            r"
            UPDATE queue_messages SET
                redelivery_count = redelivery_count
                    + (CASE WHEN locked_until IS NULL THEN 0 ELSE 1 END),
                locked_by = ?,
                locked_until = ?
            WHERE id = (
                SELECT id FROM queue_messages
                WHERE queue = ? AND (locked_until IS NULL OR locked_until <= ?)
                ORDER BY id
                LIMIT 1
            )
            RETURNING id, message_id, content_type, body, redelivery_count, published_at
            ",
        )
        .bind(&self.consumer_tag)
        .bind(now.saturating_add(millis(self.options.visibility_timeout)))
        .bind(&self.options.name)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_delivery).transpose()
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), QueueError> {
        let result = sqlx::query("DELETE FROM queue_messages WHERE id = ? AND locked_by = ?")
            .bind(row_id(tag)?)
            .bind(&self.consumer_tag)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::UnknownDeliveryTag(tag));
        }
        Ok(())
    }

    async fn nack_requeue(&self, tag: DeliveryTag) -> Result<(), QueueError> {
        let result = sqlx::query(
            r"
            UPDATE queue_messages SET
                redelivery_count = redelivery_count + 1,
                locked_by = NULL,
                locked_until = NULL
            WHERE id = ? AND locked_by = ?
            ",
        )
        .bind(row_id(tag)?)
        .bind(&self.consumer_tag)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::UnknownDeliveryTag(tag));
        }
        Ok(())
    }

    async fn reject(&self, tag: DeliveryTag, reason: &str) -> Result<(), QueueError> {
        let id = row_id(tag)?;
        let mut tx = self.pool.begin().await?;

        let moved = sqlx::query(
            r"
            INSERT INTO dead_letters
                (queue, message_id, content_type, body, redelivery_count, published_at,
                 reason, rejected_at)
            SELECT queue, message_id, content_type, body, redelivery_count, published_at, ?, ?
            FROM queue_messages
            WHERE id = ? AND locked_by = ?
            ",
        )
        .bind(reason)
        .bind(Utc::now().timestamp_millis())
        .bind(id)
        .bind(&self.consumer_tag)
        .execute(&mut *tx)
        .await?;

        if moved.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(QueueError::UnknownDeliveryTag(tag));
        }

        sqlx::query("DELETE FROM queue_messages WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn close(&self) {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return;
        }

        let released = sqlx::query(
            "UPDATE queue_messages SET locked_by = NULL, locked_until = NULL WHERE locked_by = ?",
        )
        .bind(&self.consumer_tag)
        .execute(&self.pool)
        .await;

        match released {
            Ok(result) if result.rows_affected() > 0 => {
                debug!(queue = %self.options.name, released = result.rows_affected(), "returned unacked deliveries");
            }
            Ok(_) => {}
            Err(e) => warn!(queue = %self.options.name, error = %e, "failed to release deliveries on close"),
        }
    }
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn row_id(tag: DeliveryTag) -> Result<i64, QueueError> {
    i64::try_from(tag.0).map_err(|_| QueueError::UnknownDeliveryTag(tag))
}

fn row_to_delivery(row: &SqliteRow) -> Result<Delivery, QueueError> {
    let id: i64 = row.try_get("id")?;
    let corrupt = |reason: String| QueueError::CorruptRow { id, reason };

    let tag = u64::try_from(id).map_err(|e| corrupt(e.to_string()))?;
    let message_id = row
        .try_get::<String, _>("message_id")?
        .parse::<Uuid>()
        .map_err(|e| corrupt(format!("message_id: {e}")))?;
    let redelivery_count = u32::try_from(row.try_get::<i64, _>("redelivery_count")?)
        .map_err(|e| corrupt(format!("redelivery_count: {e}")))?;
    let published_at = DateTime::<Utc>::from_timestamp_millis(row.try_get("published_at")?)
        .ok_or_else(|| corrupt("published_at".to_string()))?;

    Ok(Delivery {
        tag: DeliveryTag(tag),
        message_id,
        content_type: row.try_get("content_type")?,
        body: row.try_get("body")?,
        redelivery_count,
        published_at,
    })
}
