//! Email storage repository.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use tracing::{debug, warn};

use super::model::{Email, EmailId};
use crate::{Error, Result};

/// Batch size used by [`EmailStore::get_pending`] when called with `0`.
pub const DEFAULT_PENDING_LIMIT: u32 = 10;

/// Durable storage for emails.
///
/// Implementations must be safe to call from many tasks at once.
#[async_trait]
pub trait EmailStore: Send + Sync {
    /// Insert a new email.
    async fn create(&self, email: &Email) -> Result<()>;

    /// Load an email by ID. Returns [`Error::NotFound`] when it does not exist.
    async fn get_by_id(&self, id: EmailId) -> Result<Email>;

    /// Overwrite the mutable fields (status, attempts, error, sent time).
    ///
    /// Safe to repeat with the same value.
    async fn update(&self, email: &Email) -> Result<()>;

    /// Up to `limit` pending emails, oldest first.
    async fn get_pending(&self, limit: u32) -> Result<Vec<Email>>;
}

/// `SQLite`-backed [`EmailStore`].
#[derive(Clone)]
pub struct SqliteEmailStore {
    pool: SqlitePool,
}

impl SqliteEmailStore {
    /// Create a new repository with the given database path.
    ///
    /// Creates the database and tables if they don't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the database connection fails or schema creation fails.
    pub async fn new(database_path: &str) -> Result<Self> {
        let url = format!("sqlite:{database_path}?mode=rwc");
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;

        Self::from_pool(pool).await
    }

    /// Create an in-memory repository for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database connection fails or schema creation fails.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        Self::from_pool(pool).await
    }

    /// Wrap an existing pool, creating the schema if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if schema creation fails.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        let repo = Self { pool };
        repo.initialize().await?;
        Ok(repo)
    }

    /// Close the underlying pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Initialize database schema.
    async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS emails (
                id TEXT PRIMARY KEY,
                to_email TEXT NOT NULL,
                subject TEXT NOT NULL,
                body TEXT NOT NULL,
                type TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                attempts INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL DEFAULT 3,
                error_msg TEXT,
                sent_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_emails_status ON emails(status)")
            .execute(&self.pool)
            .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_emails_type ON emails(type)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[async_trait]
impl EmailStore for SqliteEmailStore {
    async fn create(&self, email: &Email) -> Result<()> {
        let now = timestamp(Utc::now());

        sqlx::query(
            r"
            INSERT INTO emails
                (id, to_email, subject, body, type, status, attempts, max_attempts,
                 error_msg, sent_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(email.id.to_string())
        .bind(&email.to)
        .bind(&email.subject)
        .bind(&email.body)
        .bind(email.email_type.as_str())
        .bind(email.status.as_str())
        .bind(i64::from(email.attempts))
        .bind(i64::from(email.max_attempts))
        .bind(email.error_msg.as_deref())
        .bind(email.sent_at.map(timestamp))
        .bind(timestamp(email.created_at))
        .bind(now)
        .execute(&self.pool)
        .await?;

        debug!(email_id = %email.id, "email created");
        Ok(())
    }

    async fn get_by_id(&self, id: EmailId) -> Result<Email> {
        let row = sqlx::query(
            r"
            SELECT id, to_email, subject, body, type, status, attempts, max_attempts,
                   error_msg, sent_at, created_at
            FROM emails
            WHERE id = ?
            ",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map_or(Err(Error::NotFound(id)), row_to_email)
    }

    async fn update(&self, email: &Email) -> Result<()> {
        let result = sqlx::query(
            r"
            UPDATE emails SET
                status = ?, attempts = ?, error_msg = ?, sent_at = ?,
                updated_at = ?
            WHERE id = ?
            ",
        )
        .bind(email.status.as_str())
        .bind(i64::from(email.attempts))
        .bind(email.error_msg.as_deref())
        .bind(email.sent_at.map(timestamp))
        .bind(timestamp(Utc::now()))
        .bind(email.id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(email.id));
        }
        Ok(())
    }

    async fn get_pending(&self, limit: u32) -> Result<Vec<Email>> {
        let limit = if limit == 0 {
            DEFAULT_PENDING_LIMIT
        } else {
            limit
        };

        let rows = sqlx::query(
            r"
            SELECT id, to_email, subject, body, type, status, attempts, max_attempts,
                   error_msg, sent_at, created_at
            FROM emails
            WHERE status = 'pending'
            ORDER BY created_at ASC, rowid ASC
            LIMIT ?
            ",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        let emails = rows
            .iter()
            .filter_map(|row| match row_to_email(row) {
                Ok(email) => Some(email),
                Err(e) => {
                    warn!(error = %e, "skipping unreadable pending email");
                    None
                }
            })
            .collect();

        Ok(emails)
    }
}

/// Fixed-width RFC 3339 so text ordering matches time ordering.
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn row_to_email(row: &SqliteRow) -> Result<Email> {
    let raw_id: String = row.try_get("id")?;
    let corrupt = |reason: String| Error::CorruptRecord {
        id: raw_id.clone(),
        reason,
    };

    let id = raw_id
        .parse::<EmailId>()
        .map_err(|e| corrupt(e.to_string()))?;
    let email_type = row
        .try_get::<String, _>("type")?
        .parse()
        .map_err(corrupt)?;
    let status = row
        .try_get::<String, _>("status")?
        .parse()
        .map_err(corrupt)?;
    let attempts = u32::try_from(row.try_get::<i64, _>("attempts")?)
        .map_err(|e| corrupt(format!("attempts: {e}")))?;
    let max_attempts = u32::try_from(row.try_get::<i64, _>("max_attempts")?)
        .map_err(|e| corrupt(format!("max_attempts: {e}")))?;

    let created_raw: String = row.try_get("created_at")?;
    let created_at =
        parse_timestamp(&created_raw).ok_or_else(|| corrupt("created_at".to_string()))?;
    let sent_at = match row.try_get::<Option<String>, _>("sent_at")? {
        Some(raw) => Some(parse_timestamp(&raw).ok_or_else(|| corrupt("sent_at".to_string()))?),
        None => None,
    };

    Ok(Email {
        id,
        to: row.try_get("to_email")?,
        subject: row.try_get("subject")?,
        body: row.try_get("body")?,
        email_type,
        status,
        attempts,
        max_attempts,
        error_msg: row.try_get("error_msg")?,
        created_at,
        sent_at,
    })
}
