// ABOUTME: Conversation session state and its TTL-bound storage.
// ABOUTME: One trait, two backends: process memory or the shared coordination store.

use crate::coord::SharedCoordinator;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::RwLock;
use std::time::Duration;
use tokio::time::Instant;

const REMOTE_KEY_PREFIX: &str = "session:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Debouncing,
    Processing,
    Waiting,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Debouncing => write!(f, "debouncing"),
            SessionState::Processing => write!(f, "processing"),
            SessionState::Waiting => write!(f, "waiting"),
        }
    }
}

/// The inbound message that opened a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMessage {
    pub message_id: String,
    pub sender: String,
    pub text: String,
    #[serde(default)]
    pub media: Vec<String>,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: TurnRole,
    pub content: String,
    pub at: DateTime<Utc>,
}

/// Bounded chat history plus named resources the handler wants to keep around.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionMemory {
    pub history: VecDeque<ChatTurn>,
    pub resources: HashMap<String, String>,
}

impl SessionMemory {
    /// Append a turn, dropping the oldest ones beyond `window`.
    pub fn push_turn(&mut self, turn: ChatTurn, window: usize) {
        self.history.push_back(turn);
        while self.history.len() > window {
            self.history.pop_front();
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionPaths {
    pub workspace: Option<PathBuf>,
    pub media: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionFlags {
    pub inactivity_warning: bool,
    pub closing_message: bool,
    pub language: Option<String>,
}

impl Default for SessionFlags {
    fn default() -> Self {
        Self {
            inactivity_warning: true,
            closing_message: true,
            language: None,
        }
    }
}

/// Input drained from a session's debounce buffer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BufferedInput {
    pub text: String,
    pub message_ids: Vec<String>,
    pub media: Vec<String>,
}

impl BufferedInput {
    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.media.is_empty()
    }
}

/// Serializable state of one conversation.
///
/// `Clone` is a deep copy: every vector and map is duplicated, so a snapshot
/// handed to a handler never aliases the stored entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEntry {
    pub key: String,
    pub original: SessionMessage,
    pub buffer: String,
    pub message_ids: Vec<String>,
    pub expire_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub state: SessionState,
    pub focus_count: u32,
    pub bubble_count: u32,
    pub pending_media: Vec<String>,
    pub memory: SessionMemory,
    pub bot_id: Option<String>,
    pub paths: SessionPaths,
    pub flags: SessionFlags,
}

impl SessionEntry {
    /// Fresh session opened by `original`. The buffer starts empty; callers
    /// feed input through [`SessionEntry::append_input`].
    pub fn new(key: impl Into<String>, original: SessionMessage, now: DateTime<Utc>) -> Self {
        Self {
            key: key.into(),
            original,
            buffer: String::new(),
            message_ids: Vec::new(),
            expire_at: now,
            last_seen: now,
            state: SessionState::Debouncing,
            focus_count: 0,
            bubble_count: 0,
            pending_media: Vec::new(),
            memory: SessionMemory::default(),
            bot_id: None,
            paths: SessionPaths::default(),
            flags: SessionFlags::default(),
        }
    }

    /// Buffer more input and push the quiet-period deadline out by `debounce`.
    pub fn append_input(
        &mut self,
        message_id: &str,
        text: &str,
        media: &[String],
        now: DateTime<Utc>,
        debounce: Duration,
    ) {
        let text = text.trim();
        if !text.is_empty() {
            if !self.buffer.is_empty() {
                self.buffer.push('\n');
            }
            self.buffer.push_str(text);
            self.bubble_count += 1;
        }
        if !message_id.is_empty() {
            self.message_ids.push(message_id.to_string());
        }
        self.pending_media.extend(media.iter().cloned());
        self.last_seen = now;
        self.expire_at = now
            + chrono::Duration::from_std(debounce).unwrap_or_else(|_| chrono::Duration::zero());
        self.state = SessionState::Debouncing;
    }

    /// Drain the debounce buffer, message ids and pending media.
    pub fn take_buffer(&mut self) -> BufferedInput {
        self.bubble_count = 0;
        BufferedInput {
            text: std::mem::take(&mut self.buffer),
            message_ids: std::mem::take(&mut self.message_ids),
            media: std::mem::take(&mut self.pending_media),
        }
    }

    /// Debouncing, quiet period elapsed, and something is buffered.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.state == SessionState::Debouncing
            && now >= self.expire_at
            && (!self.buffer.is_empty() || !self.pending_media.is_empty())
    }
}

/// Set one top-level field of `entry` from a JSON value.
///
/// Works through the serde representation, so unknown fields and values of
/// the wrong shape are errors and the entry is left untouched.
pub fn apply_field_update(
    entry: &mut SessionEntry,
    field: &str,
    value: serde_json::Value,
) -> Result<()> {
    let mut encoded = serde_json::to_value(&*entry)?;
    let Some(object) = encoded.as_object_mut() else {
        anyhow::bail!("Session entry did not serialize to an object");
    };
    if !object.contains_key(field) {
        anyhow::bail!("Unknown session field: {}", field);
    }
    object.insert(field.to_string(), value);
    *entry = serde_json::from_value(encoded)
        .with_context(|| format!("Invalid value for session field '{}'", field))?;
    Ok(())
}

/// TTL-bound storage of [`SessionEntry`] values.
///
/// The store is state-agnostic: it persists whatever state the caller set
/// and only enforces expiry. Entries returned by `get` are snapshots.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn save(&self, key: &str, entry: &SessionEntry, ttl: Duration) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<SessionEntry>>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Reset the TTL of a live entry. Errors if the entry is absent.
    async fn extend(&self, key: &str, ttl: Duration) -> Result<()>;

    /// Keys of live entries matching a glob pattern.
    async fn list(&self, pattern: &str) -> Result<Vec<String>>;

    async fn exists(&self, key: &str) -> Result<bool>;

    async fn get_all(&self) -> Result<HashMap<String, SessionEntry>>;

    /// Partial update of one field, keeping the entry's TTL.
    async fn update_field(&self, key: &str, field: &str, value: serde_json::Value) -> Result<()>;
}

/// Single-process session store. Expiry is checked lazily on access and
/// swept by [`MemorySessionStore::purge_expired`].
#[derive(Default)]
pub struct MemorySessionStore {
    entries: RwLock<HashMap<String, (SessionEntry, Instant)>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, (SessionEntry, Instant)>>> {
        self.entries
            .read()
            .map_err(|e| anyhow::anyhow!("Session map mutex poisoned: {}", e))
    }

    fn write(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, (SessionEntry, Instant)>>> {
        self.entries
            .write()
            .map_err(|e| anyhow::anyhow!("Session map mutex poisoned: {}", e))
    }

    /// Drop every expired entry; returns how many were removed.
    pub fn purge_expired(&self) -> Result<usize> {
        let now = Instant::now();
        let mut entries = self.write()?;
        let before = entries.len();
        entries.retain(|_, (_, deadline)| *deadline > now);
        let removed = before - entries.len();
        if removed > 0 {
            tracing::debug!(removed, "Purged expired sessions");
        }
        Ok(removed)
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn save(&self, key: &str, entry: &SessionEntry, ttl: Duration) -> Result<()> {
        let mut entries = self.write()?;
        entries.insert(key.to_string(), (entry.clone(), Instant::now() + ttl));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<SessionEntry>> {
        let now = Instant::now();
        let entries = self.read()?;
        Ok(entries
            .get(key)
            .filter(|(_, deadline)| *deadline > now)
            .map(|(entry, _)| entry.clone()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.write()?.remove(key);
        Ok(())
    }

    async fn extend(&self, key: &str, ttl: Duration) -> Result<()> {
        let now = Instant::now();
        let mut entries = self.write()?;
        match entries.get_mut(key) {
            Some((_, deadline)) if *deadline > now => {
                *deadline = now + ttl;
                Ok(())
            }
            _ => anyhow::bail!("Session not found: {}", key),
        }
    }

    async fn list(&self, pattern: &str) -> Result<Vec<String>> {
        let matcher = glob::Pattern::new(pattern)
            .map_err(|e| anyhow::anyhow!("Invalid session pattern '{}': {}", pattern, e))?;
        let now = Instant::now();
        let entries = self.read()?;
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(key, (_, deadline))| *deadline > now && matcher.matches(key))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let now = Instant::now();
        Ok(self
            .read()?
            .get(key)
            .is_some_and(|(_, deadline)| *deadline > now))
    }

    async fn get_all(&self) -> Result<HashMap<String, SessionEntry>> {
        let now = Instant::now();
        let entries = self.read()?;
        Ok(entries
            .iter()
            .filter(|(_, (_, deadline))| *deadline > now)
            .map(|(key, (entry, _))| (key.clone(), entry.clone()))
            .collect())
    }

    async fn update_field(&self, key: &str, field: &str, value: serde_json::Value) -> Result<()> {
        let now = Instant::now();
        let mut entries = self.write()?;
        match entries.get_mut(key) {
            Some((entry, deadline)) if *deadline > now => apply_field_update(entry, field, value),
            _ => anyhow::bail!("Session not found: {}", key),
        }
    }
}

/// Cluster-wide session store: JSON entries under `session:{key}` with PX TTLs.
pub struct RemoteSessionStore {
    store: SharedCoordinator,
}

impl RemoteSessionStore {
    pub fn new(store: SharedCoordinator) -> Self {
        Self { store }
    }

    fn remote_key(key: &str) -> String {
        format!("{}{}", REMOTE_KEY_PREFIX, key)
    }
}

#[async_trait]
impl SessionStore for RemoteSessionStore {
    async fn save(&self, key: &str, entry: &SessionEntry, ttl: Duration) -> Result<()> {
        let encoded = serde_json::to_string(entry).context("Failed to encode session")?;
        self.store
            .set_px(&Self::remote_key(key), &encoded, ttl)
            .await
    }

    async fn get(&self, key: &str) -> Result<Option<SessionEntry>> {
        let Some(raw) = self.store.get(&Self::remote_key(key)).await? else {
            return Ok(None);
        };
        let entry = serde_json::from_str(&raw)
            .with_context(|| format!("Corrupt session entry for {}", key))?;
        Ok(Some(entry))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.store.del(&Self::remote_key(key)).await?;
        Ok(())
    }

    async fn extend(&self, key: &str, ttl: Duration) -> Result<()> {
        if !self.store.pexpire(&Self::remote_key(key), ttl).await? {
            anyhow::bail!("Session not found: {}", key);
        }
        Ok(())
    }

    async fn list(&self, pattern: &str) -> Result<Vec<String>> {
        let keys = self.store.keys(&Self::remote_key(pattern)).await?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(REMOTE_KEY_PREFIX).map(str::to_string))
            .collect())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.store.exists(&Self::remote_key(key)).await
    }

    async fn get_all(&self) -> Result<HashMap<String, SessionEntry>> {
        let mut all = HashMap::new();
        for key in self.list("*").await? {
            // Entries may expire between KEYS and GET
            match self.get(&key).await {
                Ok(Some(entry)) => {
                    all.insert(key, entry);
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(key = %key, error = %e, "Skipping unreadable session"),
            }
        }
        Ok(all)
    }

    async fn update_field(&self, key: &str, field: &str, value: serde_json::Value) -> Result<()> {
        let Some(mut entry) = self.get(key).await? else {
            anyhow::bail!("Session not found: {}", key);
        };
        apply_field_update(&mut entry, field, value)?;
        let encoded = serde_json::to_string(&entry).context("Failed to encode session")?;
        if !self
            .store
            .set_keep_ttl(&Self::remote_key(key), &encoded)
            .await?
        {
            anyhow::bail!("Session not found: {}", key);
        }
        Ok(())
    }
}
