// ABOUTME: Time-ordered execution of deferred and recurring posts across the cluster.
// ABOUTME: A shared sorted set maps post ids to due times; ZREM is the per-tick claim.

mod delivery;
mod recurrence;
mod repository;

pub use self::delivery::{AdapterRegistry, DeliveryAdapter};
pub use self::recurrence::{next_occurrence, parse_time_of_day, parse_weekdays};
pub use self::repository::{PostRepository, PostStatus, ScheduledPost, SqlitePostRepository};

use crate::coord::SharedCoordinator;
use crate::metrics;
use crate::monitor::{MonitorStore, STAT_PENDING};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Sorted set holding `post id -> due time (epoch millis)`.
pub const QUEUE_KEY: &str = "scheduler:queue";

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Longest sleep while anything is queued, so tasks added by other
    /// instances are noticed.
    pub poll_interval: Duration,
    /// Sleep when the queue is empty.
    pub max_idle: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            max_idle: Duration::from_secs(30),
        }
    }
}

fn score_of(at: DateTime<Utc>) -> f64 {
    at.timestamp_millis() as f64
}

/// Truncate to whole milliseconds, the resolution of queue scores, so the
/// stored post and its queue entry name the same instant.
fn due_time(at: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(at.timestamp_millis()).unwrap_or(at)
}

/// Executes matured posts through registered delivery adapters.
pub struct TaskScheduler {
    store: SharedCoordinator,
    repository: Arc<dyn PostRepository>,
    adapters: Arc<AdapterRegistry>,
    monitor: Option<Arc<MonitorStore>>,
    config: SchedulerConfig,
    wake: Notify,
}

impl TaskScheduler {
    pub fn new(
        store: SharedCoordinator,
        repository: Arc<dyn PostRepository>,
        adapters: Arc<AdapterRegistry>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            repository,
            adapters,
            monitor: None,
            config,
            wake: Notify::new(),
        }
    }

    pub fn with_monitor(mut self, monitor: Arc<MonitorStore>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn adapters(&self) -> &Arc<AdapterRegistry> {
        &self.adapters
    }

    /// Persist a post and queue it for its due time. Assigns an id if empty.
    pub async fn schedule(&self, mut post: ScheduledPost) -> Result<ScheduledPost> {
        if post.text.trim().is_empty() && post.media_path.is_none() {
            anyhow::bail!("Scheduled post needs text or media");
        }
        if post.is_recurring() {
            let days = post.recurrence_days.as_deref().unwrap_or_default();
            parse_weekdays(days)?;
            if let Some(time) = post.original_time.as_deref() {
                parse_time_of_day(time)?;
            }
        }
        if post.id.is_empty() {
            post.id = uuid::Uuid::new_v4().to_string();
        }
        post.scheduled_at = due_time(post.scheduled_at);
        post.status = PostStatus::Enqueued;
        post.error_message = None;

        self.repository
            .create(&post)
            .with_context(|| format!("Failed to store scheduled post {}", post.id))?;
        self.store
            .zadd(QUEUE_KEY, &post.id, score_of(post.scheduled_at))
            .await?;

        tracing::info!(
            post_id = %post.id,
            channel = %post.channel_id,
            scheduled_at = %post.scheduled_at,
            recurring = post.is_recurring(),
            "Scheduled post"
        );
        self.wake.notify_one();
        Ok(post)
    }

    /// Remove a post from the queue and the repository. Returns false if
    /// neither knew about it.
    pub async fn cancel(&self, id: &str) -> Result<bool> {
        let dequeued = self.store.zrem(QUEUE_KEY, id).await?;
        let deleted = self.repository.delete(id)?;
        if dequeued || deleted {
            tracing::info!(post_id = %id, "Cancelled scheduled post");
        }
        Ok(dequeued || deleted)
    }

    /// Move a post to a new due time and re-queue it.
    pub async fn reschedule(&self, id: &str, at: DateTime<Utc>) -> Result<ScheduledPost> {
        let Some(mut post) = self.repository.get(id)? else {
            anyhow::bail!("Scheduled post not found: {}", id);
        };
        if matches!(post.status, PostStatus::Sent | PostStatus::Cancelled) {
            anyhow::bail!("Cannot reschedule a {} post", post.status);
        }
        post.scheduled_at = due_time(at);
        post.status = PostStatus::Enqueued;
        post.error_message = None;
        self.repository.update(&post)?;
        self.store
            .zadd(QUEUE_KEY, id, score_of(post.scheduled_at))
            .await?;
        self.wake.notify_one();
        Ok(post)
    }

    pub fn list(&self) -> Result<Vec<ScheduledPost>> {
        self.repository.list_all()
    }

    /// Number of entries in the shared queue, matured or not.
    pub async fn pending_count(&self) -> Result<usize> {
        Ok(self
            .store
            .zrange_by_score(QUEUE_KEY, f64::NEG_INFINITY, f64::INFINITY, None)
            .await?
            .len())
    }

    /// Run every matured task once and return the due time of the earliest
    /// task still in the future, or `None` when nothing is.
    ///
    /// Tasks whose channel has no adapter stay queued untouched and are
    /// retried on a later tick.
    pub async fn exec_tasks(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        let now_ms = now.timestamp_millis();
        let due = self
            .store
            .zrange_by_score(QUEUE_KEY, f64::NEG_INFINITY, now_ms as f64, None)
            .await?;

        for (id, _) in due {
            let post = match self.repository.get(&id) {
                Ok(Some(post)) => post,
                Ok(None) => {
                    tracing::warn!(post_id = %id, "Removing orphaned queue entry");
                    self.store.zrem(QUEUE_KEY, &id).await?;
                    continue;
                }
                Err(e) => {
                    tracing::error!(post_id = %id, error = %e, "Failed to load scheduled post");
                    continue;
                }
            };

            let Some(adapter) = self.adapters.get(&post.channel_id) else {
                tracing::debug!(
                    post_id = %id,
                    channel = %post.channel_id,
                    "No delivery adapter, leaving post queued"
                );
                continue;
            };

            if !self.store.zrem(QUEUE_KEY, &id).await? {
                tracing::debug!(post_id = %id, "Post claimed by another instance");
                continue;
            }

            if let Err(e) = self.execute(post, adapter.as_ref()).await {
                tracing::error!(post_id = %id, error = %format!("{:#}", e), "Scheduled post execution failed");
            }
        }

        self.next_due_after(now_ms).await
    }

    async fn execute(&self, mut post: ScheduledPost, adapter: &dyn DeliveryAdapter) -> Result<()> {
        post.status = PostStatus::Processing;
        if let Err(e) = self.repository.update(&post) {
            tracing::warn!(post_id = %post.id, error = %e, "Failed to mark post processing");
        }

        tracing::info!(post_id = %post.id, channel = %post.channel_id, "Delivering scheduled post");
        let sent = adapter
            .send(&post.target_id, &post.text, post.media_path.as_deref())
            .await;

        if let Err(e) = sent {
            let message = format!("{:#}", e);
            post.status = PostStatus::Failed;
            post.error_message = Some(message.clone());
            self.repository.update(&post)?;
            metrics::record_scheduled_failed(&post.channel_id);
            self.record_stat("scheduled_failed").await;
            anyhow::bail!("Delivery to {} failed: {}", post.target_id, message);
        }

        post.execution_count += 1;
        metrics::record_scheduled_sent(&post.channel_id);
        self.record_stat("scheduled_sent").await;

        if !post.is_recurring() {
            self.repository.delete(&post.id)?;
            tracing::info!(post_id = %post.id, "One-shot post sent and removed");
            return Ok(());
        }

        let days = post.recurrence_days.clone().unwrap_or_default();
        let time = post
            .original_time
            .clone()
            .unwrap_or_else(|| post.scheduled_at.format("%H:%M").to_string());
        match next_occurrence(&days, &time, post.scheduled_at) {
            Ok(next) => {
                let next = due_time(next);
                post.scheduled_at = next;
                post.status = PostStatus::Enqueued;
                post.error_message = None;
                self.repository.update(&post)?;
                self.store.zadd(QUEUE_KEY, &post.id, score_of(next)).await?;
                tracing::info!(post_id = %post.id, next = %next, "Recurring post re-queued");
                Ok(())
            }
            Err(e) => {
                post.status = PostStatus::Failed;
                post.error_message = Some(format!("{:#}", e));
                self.repository.update(&post)?;
                Err(e)
            }
        }
    }

    async fn next_due_after(&self, now_ms: i64) -> Result<Option<DateTime<Utc>>> {
        let next = self
            .store
            .zrange_by_score(QUEUE_KEY, (now_ms + 1) as f64, f64::INFINITY, Some(1))
            .await?;
        Ok(next
            .first()
            .and_then(|(_, score)| DateTime::from_timestamp_millis(*score as i64)))
    }

    async fn record_stat(&self, key: &str) {
        if let Some(monitor) = &self.monitor {
            monitor.record_stat(key).await;
        }
    }

    fn sleep_for(&self, next: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Duration {
        match next {
            None => self.config.max_idle,
            Some(at) => (at - now)
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(self.config.poll_interval),
        }
    }

    /// Tick until cancelled. Cancellation is honoured between ticks only.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(
            poll_secs = self.config.poll_interval.as_secs(),
            max_idle_secs = self.config.max_idle.as_secs(),
            "Starting task scheduler"
        );
        loop {
            let wait = match self.exec_tasks(Utc::now()).await {
                Ok(next) => self.sleep_for(next, Utc::now()),
                Err(e) => {
                    tracing::error!(error = %e, "Scheduler tick failed");
                    self.config.poll_interval
                }
            };
            if let Some(monitor) = &self.monitor {
                match self.pending_count().await {
                    Ok(pending) => {
                        if let Err(e) = monitor.update_stat(STAT_PENDING, pending as i64).await {
                            tracing::debug!(error = %e, "Failed to publish pending count");
                        }
                    }
                    Err(e) => tracing::debug!(error = %e, "Failed to count pending posts"),
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
        tracing::info!("Task scheduler stopped");
    }
}
