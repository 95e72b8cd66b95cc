// ABOUTME: Ingest pipeline composing dedup, sharded dispatch and session buffering
// ABOUTME: Debounced sessions are flushed to a pluggable conversation handler on their own shard

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relaygate_core::monitor::{MonitorStore, STAT_DROPPED};
use relaygate_core::session::{BufferedInput, ChatTurn, SessionMessage, TurnRole};
use relaygate_core::{
    ConversationKey, DedupGuard, MessageJob, SessionEntry, SessionState, SessionStore,
    SharedCoordinator, WorkerPool,
};
use std::sync::Arc;
use std::time::Duration;

/// How long a flush claim is held before another instance may retry it
const FLUSH_CLAIM_TTL: Duration = Duration::from_secs(60);

/// Joins channel and chat id in session keys. Channel ids may not contain it;
/// chat ids may.
const KEY_SEPARATOR: char = '|';

/// A message as delivered by a channel adapter.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Messaging instance (one connected account on one platform)
    pub channel_id: String,
    pub chat_id: String,
    pub message_id: String,
    pub sender: String,
    pub text: String,
    pub media: Vec<String>,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Queued on the conversation's shard
    Accepted,
    /// Already seen under another id or address format
    Duplicate,
    /// Shard queue full or pool stopped
    Shed,
    /// Channel id contains the session key separator
    Rejected,
}

impl IngestOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestOutcome::Accepted => "accepted",
            IngestOutcome::Duplicate => "duplicate",
            IngestOutcome::Shed => "shed",
            IngestOutcome::Rejected => "rejected",
        }
    }
}

/// The conversational layer that turns buffered input into a reply.
#[async_trait]
pub trait ConversationHandler: Send + Sync {
    /// `session` is a detached snapshot taken after the buffer was drained.
    /// Returning `None` sends nothing back.
    async fn handle(&self, session: SessionEntry, input: BufferedInput) -> Result<Option<String>>;
}

#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub session_ttl: Duration,
    pub debounce: Duration,
    pub history_window: usize,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            session_ttl: Duration::from_secs(1800),
            debounce: Duration::from_millis(3000),
            history_window: 20,
        }
    }
}

pub struct Gateway {
    store: SharedCoordinator,
    dedup: Arc<DedupGuard>,
    pool: Arc<WorkerPool>,
    sessions: Arc<dyn SessionStore>,
    handler: Arc<dyn ConversationHandler>,
    monitor: Option<Arc<MonitorStore>>,
    settings: GatewaySettings,
}

impl Gateway {
    pub fn new(
        store: SharedCoordinator,
        dedup: Arc<DedupGuard>,
        pool: Arc<WorkerPool>,
        sessions: Arc<dyn SessionStore>,
        handler: Arc<dyn ConversationHandler>,
        settings: GatewaySettings,
    ) -> Self {
        Self {
            store,
            dedup,
            pool,
            sessions,
            handler,
            monitor: None,
            settings,
        }
    }

    pub fn with_monitor(mut self, monitor: Arc<MonitorStore>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Admit, shard and buffer one inbound message.
    ///
    /// Returns as soon as the job is queued; the session write happens on the
    /// conversation's worker so it is ordered with every other message of the
    /// same chat.
    pub async fn ingest(&self, msg: InboundMessage) -> IngestOutcome {
        let outcome = self.ingest_inner(msg).await;
        relaygate_core::metrics::record_ingest(outcome.as_str());
        outcome
    }

    async fn ingest_inner(&self, msg: InboundMessage) -> IngestOutcome {
        if msg.channel_id.contains(KEY_SEPARATOR) {
            tracing::warn!(
                channel_id = %msg.channel_id,
                "Rejecting message from channel id containing the key separator"
            );
            return IngestOutcome::Rejected;
        }
        if !self
            .dedup
            .admit(&msg.channel_id, &msg.message_id, &msg.sender, &msg.text)
            .await
        {
            tracing::debug!(
                channel_id = %msg.channel_id,
                message_id = %msg.message_id,
                "Ignoring duplicate message"
            );
            return IngestOutcome::Duplicate;
        }

        let key = ConversationKey::new(msg.channel_id.clone(), msg.chat_id.clone());
        let sessions = Arc::clone(&self.sessions);
        let settings = self.settings.clone();
        let job = MessageJob::new(key.clone(), async move {
            buffer_message(sessions.as_ref(), &settings, msg).await
        });

        if self.pool.try_dispatch(job) {
            IngestOutcome::Accepted
        } else {
            tracing::warn!(key = %key, "Shedding inbound message");
            if let Some(monitor) = &self.monitor {
                monitor.record_stat(STAT_DROPPED).await;
            }
            IngestOutcome::Shed
        }
    }

    /// Dispatch a flush job for every debouncing session whose quiet period
    /// has elapsed. Returns how many flush jobs were queued.
    pub async fn flush_due_sessions(&self, now: DateTime<Utc>) -> Result<usize> {
        let all = self.sessions.get_all().await?;
        let mut queued = 0;
        for (session_key, entry) in all {
            if !entry.is_due(now) {
                continue;
            }
            let Some((instance_id, chat_id)) = session_key.split_once(KEY_SEPARATOR) else {
                tracing::warn!(session_key = %session_key, "Skipping session with malformed key");
                continue;
            };
            let key = ConversationKey::new(instance_id, chat_id);
            let flush = FlushJob {
                store: Arc::clone(&self.store),
                sessions: Arc::clone(&self.sessions),
                handler: Arc::clone(&self.handler),
                settings: self.settings.clone(),
                session_key,
            };
            if self
                .pool
                .try_dispatch(MessageJob::new(key, async move { flush.run(now).await }))
            {
                queued += 1;
            } else if let Some(monitor) = &self.monitor {
                monitor.record_stat(STAT_DROPPED).await;
            }
        }
        if queued > 0 {
            tracing::debug!(queued, "Queued session flushes");
        }
        Ok(queued)
    }

    /// Periodically flush due sessions until cancelled.
    pub async fn run_flush_loop(
        &self,
        cancel: tokio_util::sync::CancellationToken,
        every: Duration,
    ) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.flush_due_sessions(Utc::now()).await {
                        tracing::warn!(error = %e, "Session flush pass failed");
                    }
                }
            }
        }
        tracing::debug!("Session flush loop stopped");
    }
}

/// Load or open the session and append the message to its debounce buffer.
async fn buffer_message(
    sessions: &dyn SessionStore,
    settings: &GatewaySettings,
    msg: InboundMessage,
) -> Result<()> {
    let key = format!("{}{}{}", msg.channel_id, KEY_SEPARATOR, msg.chat_id);
    let now = msg.received_at;
    let mut entry = match sessions.get(&key).await? {
        Some(entry) => entry,
        None => {
            tracing::info!(session_key = %key, sender = %msg.sender, "Opening session");
            let original = SessionMessage {
                message_id: msg.message_id.clone(),
                sender: msg.sender.clone(),
                text: msg.text.clone(),
                media: msg.media.clone(),
                received_at: now,
            };
            SessionEntry::new(key.clone(), original, now)
        }
    };
    entry.append_input(&msg.message_id, &msg.text, &msg.media, now, settings.debounce);
    sessions
        .save(&key, &entry, settings.session_ttl)
        .await
        .with_context(|| format!("Failed to save session {}", key))
}

struct FlushJob {
    store: SharedCoordinator,
    sessions: Arc<dyn SessionStore>,
    handler: Arc<dyn ConversationHandler>,
    settings: GatewaySettings,
    session_key: String,
}

impl FlushJob {
    async fn run(self, now: DateTime<Utc>) -> Result<()> {
        let claim = format!("gateway:flush:{}", self.session_key);
        if !self.store.set_nx_px(&claim, "1", FLUSH_CLAIM_TTL).await? {
            tracing::debug!(session_key = %self.session_key, "Flush already claimed");
            return Ok(());
        }
        let result = self.flush(now).await;
        if let Err(e) = self.store.del(&claim).await {
            tracing::warn!(session_key = %self.session_key, error = %e, "Failed to release flush claim");
        }
        result
    }

    async fn flush(&self, now: DateTime<Utc>) -> Result<()> {
        // Re-read: a newer message may have pushed the deadline out
        let Some(mut entry) = self.sessions.get(&self.session_key).await? else {
            return Ok(());
        };
        if !entry.is_due(now) {
            return Ok(());
        }

        let input = entry.take_buffer();
        entry.state = SessionState::Processing;
        entry.focus_count += 1;
        self.sessions
            .save(&self.session_key, &entry, self.settings.session_ttl)
            .await?;

        tracing::info!(
            session_key = %self.session_key,
            messages = input.message_ids.len(),
            media = input.media.len(),
            "Handing buffered input to conversation handler"
        );
        let reply = self.handler.handle(entry.clone(), input.clone()).await;

        // Input that arrived while the handler ran stays buffered
        let mut latest = self
            .sessions
            .get(&self.session_key)
            .await?
            .unwrap_or(entry);
        let window = self.settings.history_window;
        if !input.text.is_empty() {
            latest.memory.push_turn(
                ChatTurn {
                    role: TurnRole::User,
                    content: input.text,
                    at: now,
                },
                window,
            );
        }
        let result = match reply {
            Ok(Some(text)) => {
                latest.memory.push_turn(
                    ChatTurn {
                        role: TurnRole::Assistant,
                        content: text,
                        at: Utc::now(),
                    },
                    window,
                );
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => Err(e.context(format!("Handler failed for {}", self.session_key))),
        };
        if latest.state == SessionState::Processing {
            latest.state = SessionState::Waiting;
        }
        self.sessions
            .save(&self.session_key, &latest, self.settings.session_ttl)
            .await?;
        result
    }
}

/// Handler used when no conversational layer is wired in: records the input
/// and sends nothing back.
#[derive(Debug, Default)]
pub struct LoggingHandler;

#[async_trait]
impl ConversationHandler for LoggingHandler {
    async fn handle(&self, session: SessionEntry, input: BufferedInput) -> Result<Option<String>> {
        tracing::info!(
            session_key = %session.key,
            chars = input.text.len(),
            media = input.media.len(),
            "No conversation handler configured, dropping reply"
        );
        Ok(None)
    }
}
