// ABOUTME: Persistence for scheduled posts: the repository trait and its SQLite implementation.
// ABOUTME: The coordination-store queue only holds ids; full posts live here.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

/// A deferred or recurring outbound message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledPost {
    pub id: String,
    pub channel_id: String,
    pub target_id: String,
    pub sender_id: String,
    pub text: String,
    pub media_path: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub status: PostStatus,
    /// Comma-separated weekday indices, 0 = Sunday.
    pub recurrence_days: Option<String>,
    /// `HH:MM` in UTC.
    pub original_time: Option<String>,
    pub execution_count: u32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ScheduledPost {
    /// A one-shot post with no id yet; the scheduler assigns one.
    pub fn new(
        channel_id: impl Into<String>,
        target_id: impl Into<String>,
        sender_id: impl Into<String>,
        text: impl Into<String>,
        scheduled_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: String::new(),
            channel_id: channel_id.into(),
            target_id: target_id.into(),
            sender_id: sender_id.into(),
            text: text.into(),
            media_path: None,
            scheduled_at,
            status: PostStatus::Pending,
            recurrence_days: None,
            original_time: None,
            execution_count: 0,
            error_message: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_recurrence(mut self, days: impl Into<String>, time_of_day: impl Into<String>) -> Self {
        self.recurrence_days = Some(days.into());
        self.original_time = Some(time_of_day.into());
        self
    }

    pub fn with_media(mut self, path: impl Into<String>) -> Self {
        self.media_path = Some(path.into());
        self
    }

    pub fn is_recurring(&self) -> bool {
        self.recurrence_days
            .as_deref()
            .is_some_and(|d| !d.trim().is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PostStatus {
    Pending,
    Enqueued,
    Processing,
    Sent,
    Failed,
    Cancelled,
}

impl std::fmt::Display for PostStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PostStatus::Pending => write!(f, "pending"),
            PostStatus::Enqueued => write!(f, "enqueued"),
            PostStatus::Processing => write!(f, "processing"),
            PostStatus::Sent => write!(f, "sent"),
            PostStatus::Failed => write!(f, "failed"),
            PostStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl FromStr for PostStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(PostStatus::Pending),
            "enqueued" => Ok(PostStatus::Enqueued),
            "processing" => Ok(PostStatus::Processing),
            "sent" => Ok(PostStatus::Sent),
            "failed" => Ok(PostStatus::Failed),
            "cancelled" => Ok(PostStatus::Cancelled),
            _ => anyhow::bail!("Unknown post status: {}", s),
        }
    }
}

/// CRUD over scheduled posts, keyed by id.
pub trait PostRepository: Send + Sync {
    fn create(&self, post: &ScheduledPost) -> Result<()>;
    fn get(&self, id: &str) -> Result<Option<ScheduledPost>>;
    /// Returns false if no post has that id.
    fn update(&self, post: &ScheduledPost) -> Result<bool>;
    fn delete(&self, id: &str) -> Result<bool>;
    fn list_all(&self) -> Result<Vec<ScheduledPost>>;
    fn list_by_channel(&self, channel_id: &str) -> Result<Vec<ScheduledPost>>;
}

const SELECT_COLUMNS: &str = "SELECT id, channel_id, target_id, sender_id, text, media_path,
        scheduled_at, status, recurrence_days, original_time, execution_count,
        error_message, created_at
     FROM scheduled_posts";

fn row_to_post(row: &Row<'_>) -> rusqlite::Result<ScheduledPost> {
    Ok(ScheduledPost {
        id: row.get(0)?,
        channel_id: row.get(1)?,
        target_id: row.get(2)?,
        sender_id: row.get(3)?,
        text: row.get(4)?,
        media_path: row.get(5)?,
        scheduled_at: row.get(6)?,
        status: row.get::<_, String>(7)?.parse().map_err(|e: anyhow::Error| {
            rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, e.into())
        })?,
        recurrence_days: row.get(8)?,
        original_time: row.get(9)?,
        execution_count: row.get(10)?,
        error_message: row.get(11)?,
        created_at: row.get(12)?,
    })
}

/// SQLite-backed [`PostRepository`].
#[derive(Clone)]
pub struct SqlitePostRepository {
    db: Arc<Mutex<Connection>>,
}

impl SqlitePostRepository {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }

    /// Open (or create) the database file and make sure the schema exists.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        let repo = Self::new(Arc::new(Mutex::new(conn)));
        repo.initialize_schema()?;
        Ok(repo)
    }

    pub fn open_in_memory() -> Result<Self> {
        let repo = Self::new(Arc::new(Mutex::new(Connection::open_in_memory()?)));
        repo.initialize_schema()?;
        Ok(repo)
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|e| anyhow::anyhow!("Database mutex poisoned: {}", e))
    }

    pub fn initialize_schema(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS scheduled_posts (
                id TEXT PRIMARY KEY,
                channel_id TEXT NOT NULL,
                target_id TEXT NOT NULL,
                sender_id TEXT NOT NULL,
                text TEXT NOT NULL,
                media_path TEXT,
                scheduled_at TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                recurrence_days TEXT,
                original_time TEXT,
                execution_count INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_scheduled_posts_scheduled_at
             ON scheduled_posts(scheduled_at)",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_scheduled_posts_channel
             ON scheduled_posts(channel_id)",
            [],
        )?;

        Ok(())
    }
}

impl PostRepository for SqlitePostRepository {
    fn create(&self, post: &ScheduledPost) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO scheduled_posts (
                id, channel_id, target_id, sender_id, text, media_path,
                scheduled_at, status, recurrence_days, original_time,
                execution_count, error_message, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                post.id,
                post.channel_id,
                post.target_id,
                post.sender_id,
                post.text,
                post.media_path,
                post.scheduled_at,
                post.status.to_string(),
                post.recurrence_days,
                post.original_time,
                post.execution_count,
                post.error_message,
                post.created_at,
            ],
        )?;
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<ScheduledPost>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("{} WHERE id = ?1", SELECT_COLUMNS))?;
        let mut rows = stmt.query([id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_post(row)?)),
            None => Ok(None),
        }
    }

    fn update(&self, post: &ScheduledPost) -> Result<bool> {
        let conn = self.conn()?;
        let rows = conn.execute(
            "UPDATE scheduled_posts SET
                channel_id = ?2, target_id = ?3, sender_id = ?4, text = ?5,
                media_path = ?6, scheduled_at = ?7, status = ?8,
                recurrence_days = ?9, original_time = ?10,
                execution_count = ?11, error_message = ?12
             WHERE id = ?1",
            params![
                post.id,
                post.channel_id,
                post.target_id,
                post.sender_id,
                post.text,
                post.media_path,
                post.scheduled_at,
                post.status.to_string(),
                post.recurrence_days,
                post.original_time,
                post.execution_count,
                post.error_message,
            ],
        )?;
        Ok(rows > 0)
    }

    fn delete(&self, id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let rows = conn.execute("DELETE FROM scheduled_posts WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    fn list_all(&self) -> Result<Vec<ScheduledPost>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("{} ORDER BY scheduled_at ASC", SELECT_COLUMNS))?;
        let posts = stmt
            .query_map([], row_to_post)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(posts)
    }

    fn list_by_channel(&self, channel_id: &str) -> Result<Vec<ScheduledPost>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE channel_id = ?1 ORDER BY scheduled_at ASC",
            SELECT_COLUMNS
        ))?;
        let posts = stmt
            .query_map([channel_id], row_to_post)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(posts)
    }
}
