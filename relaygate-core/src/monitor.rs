// ABOUTME: Cluster-wide telemetry kept in the coordination store: heartbeats, worker activity, counters.
// ABOUTME: Reads are eventually consistent; staleness cutoffs hide dead servers and idle workers.

use crate::coord::SharedCoordinator;
use crate::pool::{ConversationKey, JobOutcome, PoolHooks};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

pub const SERVERS_KEY: &str = "monitor:servers";
pub const WORKERS_KEY: &str = "monitor:workers";
pub const STATS_KEY: &str = "monitor:stats";
pub const EVENTS_CHANNEL: &str = "monitor:events";

/// A server with no heartbeat for this long is considered dead.
pub const SERVER_STALE_AFTER: Duration = Duration::from_secs(120);
/// An idle worker not updated for this long is hidden from the cluster view.
pub const WORKER_IDLE_HIDE_AFTER: Duration = Duration::from_secs(300);

pub const STAT_PROCESSED: &str = "processed";
pub const STAT_ERRORS: &str = "errors";
pub const STAT_DROPPED: &str = "dropped";
pub const STAT_PENDING: &str = "pending";

/// Telemetry writes buffered between the pool hooks and the store.
pub const HOOK_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub server_id: String,
    pub last_heartbeat: DateTime<Utc>,
    pub uptime_secs: u64,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerActivity {
    pub server_id: String,
    pub worker_id: usize,
    pub processing: bool,
    pub current_key: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub jobs_processed: u64,
}

impl WorkerActivity {
    fn field(&self) -> String {
        format!("{}:{}", self.server_id, self.worker_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalStats {
    pub processed: i64,
    pub errors: i64,
    pub dropped: i64,
    pub pending: i64,
    /// Any other counters, such as dedup and scheduler outcomes.
    pub extra: BTreeMap<String, i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorEvent {
    pub origin: String,
    pub kind: String,
    pub payload: serde_json::Value,
}

/// Receives monitor events published by other instances.
pub struct MonitorEvents {
    own_id: String,
    rx: broadcast::Receiver<String>,
}

impl MonitorEvents {
    /// Next event from another instance, or `None` once the channel closes.
    pub async fn recv(&mut self) -> Option<MonitorEvent> {
        loop {
            let raw = match self.rx.recv().await {
                Ok(raw) => raw,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Monitor event receiver lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            };
            match serde_json::from_str::<MonitorEvent>(&raw) {
                Ok(event) if event.origin == self.own_id => continue,
                Ok(event) => return Some(event),
                Err(e) => {
                    tracing::debug!(error = %e, "Ignoring malformed monitor event");
                }
            }
        }
    }
}

/// Cluster telemetry over the coordination store.
pub struct MonitorStore {
    store: SharedCoordinator,
    server_id: String,
    version: String,
    started: tokio::time::Instant,
}

impl MonitorStore {
    pub fn new(
        store: SharedCoordinator,
        server_id: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            store,
            server_id: server_id.into(),
            version: version.into(),
            started: tokio::time::Instant::now(),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub async fn report_heartbeat(
        &self,
        server_id: &str,
        uptime: Duration,
        version: &str,
    ) -> Result<()> {
        let info = ServerInfo {
            server_id: server_id.to_string(),
            last_heartbeat: Utc::now(),
            uptime_secs: uptime.as_secs(),
            version: version.to_string(),
        };
        let encoded = serde_json::to_string(&info)?;
        self.store
            .hset(SERVERS_KEY, server_id, &encoded)
            .await
            .context("Failed to record heartbeat")?;
        self.publish_event("heartbeat", serde_json::to_value(&info)?)
            .await;
        Ok(())
    }

    /// Servers that sent a heartbeat within [`SERVER_STALE_AFTER`]; stale
    /// entries are pruned as a side effect.
    pub async fn get_active_servers(&self) -> Result<Vec<ServerInfo>> {
        let raw = self.store.hget_all(SERVERS_KEY).await?;
        let cutoff = Utc::now() - chrono::Duration::from_std(SERVER_STALE_AFTER)?;

        let mut servers = Vec::new();
        for (field, value) in raw {
            match serde_json::from_str::<ServerInfo>(&value) {
                Ok(info) if info.last_heartbeat >= cutoff => servers.push(info),
                Ok(_) | Err(_) => {
                    tracing::debug!(server_id = %field, "Pruning stale server entry");
                    if let Err(e) = self.store.hdel(SERVERS_KEY, &field).await {
                        tracing::warn!(server_id = %field, error = %e, "Failed to prune server");
                    }
                }
            }
        }
        servers.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        Ok(servers)
    }

    /// Remove a server and every worker entry it owns.
    pub async fn remove_server(&self, server_id: &str) -> Result<()> {
        self.store.hdel(SERVERS_KEY, server_id).await?;
        let prefix = format!("{}:", server_id);
        let workers = self.store.hget_all(WORKERS_KEY).await?;
        for field in workers.keys().filter(|f| f.starts_with(&prefix)) {
            self.store.hdel(WORKERS_KEY, field).await?;
        }
        tracing::info!(server_id, "Removed server from cluster view");
        Ok(())
    }

    pub async fn update_worker_activity(&self, activity: &WorkerActivity) -> Result<()> {
        let encoded = serde_json::to_string(activity)?;
        self.store
            .hset(WORKERS_KEY, &activity.field(), &encoded)
            .await
            .context("Failed to record worker activity")?;
        self.publish_event("worker", serde_json::to_value(activity)?)
            .await;
        Ok(())
    }

    /// Worker activity for live servers. Idle workers not updated within
    /// [`WORKER_IDLE_HIDE_AFTER`] are omitted.
    pub async fn get_cluster_activity(&self) -> Result<Vec<WorkerActivity>> {
        let live: HashSet<String> = self
            .get_active_servers()
            .await?
            .into_iter()
            .map(|s| s.server_id)
            .collect();
        let idle_cutoff = Utc::now() - chrono::Duration::from_std(WORKER_IDLE_HIDE_AFTER)?;

        let mut workers: Vec<WorkerActivity> = self
            .store
            .hget_all(WORKERS_KEY)
            .await?
            .into_values()
            .filter_map(|raw| serde_json::from_str::<WorkerActivity>(&raw).ok())
            .filter(|w| live.contains(&w.server_id))
            .filter(|w| w.processing || w.updated_at >= idle_cutoff)
            .collect();
        workers.sort_by(|a, b| {
            a.server_id
                .cmp(&b.server_id)
                .then(a.worker_id.cmp(&b.worker_id))
        });
        Ok(workers)
    }

    pub async fn increment_stat(&self, key: &str) -> Result<i64> {
        self.increment_stat_by(key, 1).await
    }

    pub async fn increment_stat_by(&self, key: &str, delta: i64) -> Result<i64> {
        self.store.hincr_by(STATS_KEY, key, delta).await
    }

    pub async fn update_stat(&self, key: &str, value: i64) -> Result<()> {
        self.store.hset(STATS_KEY, key, &value.to_string()).await
    }

    /// Increment a counter, logging instead of returning any failure.
    pub async fn record_stat(&self, key: &str) {
        if let Err(e) = self.increment_stat(key).await {
            tracing::warn!(stat = key, error = %e, "Failed to increment global stat");
        }
    }

    pub async fn get_global_stats(&self) -> Result<GlobalStats> {
        let raw = self.store.hget_all(STATS_KEY).await?;
        let mut stats = GlobalStats::default();
        for (field, value) in raw {
            let Ok(value) = value.parse::<i64>() else {
                tracing::debug!(stat = %field, "Skipping non-numeric stat");
                continue;
            };
            match field.as_str() {
                STAT_PROCESSED => stats.processed = value,
                STAT_ERRORS => stats.errors = value,
                STAT_DROPPED => stats.dropped = value,
                STAT_PENDING => stats.pending = value,
                _ => {
                    stats.extra.insert(field, value);
                }
            }
        }
        Ok(stats)
    }

    /// Publish an event tagged with this instance. Failures are only logged.
    pub async fn publish_event(&self, kind: &str, payload: serde_json::Value) {
        let event = MonitorEvent {
            origin: self.server_id.clone(),
            kind: kind.to_string(),
            payload,
        };
        let encoded = match serde_json::to_string(&event) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::debug!(error = %e, "Failed to encode monitor event");
                return;
            }
        };
        if let Err(e) = self.store.publish(EVENTS_CHANNEL, &encoded).await {
            tracing::debug!(kind, error = %e, "Failed to publish monitor event");
        }
    }

    /// Events from every other instance; our own are filtered out.
    pub async fn subscribe_events(&self) -> Result<MonitorEvents> {
        let rx = self.store.subscribe(EVENTS_CHANNEL).await?;
        Ok(MonitorEvents {
            own_id: self.server_id.clone(),
            rx,
        })
    }

    /// Report this instance every `every` until cancelled, then remove it.
    pub async fn run_heartbeat(&self, cancel: CancellationToken, every: Duration) {
        tracing::info!(
            server_id = %self.server_id,
            interval_secs = every.as_secs(),
            "Starting heartbeat task"
        );
        let mut ticker = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let uptime = self.started.elapsed();
                    if let Err(e) = self.report_heartbeat(&self.server_id, uptime, &self.version).await {
                        tracing::error!(error = %e, "Failed to report heartbeat");
                    }
                }
            }
        }
        if let Err(e) = self.remove_server(&self.server_id).await {
            tracing::warn!(error = %e, "Failed to remove server on shutdown");
        }
    }
}

enum HookUpdate {
    Activity(WorkerActivity),
    Stat(&'static str),
}

/// Pool observer that mirrors worker activity and job counters into the
/// monitoring store.
///
/// Hooks run on the worker's hot path, so writes are queued to a single
/// background task. Ordering per worker is preserved; delivery is best-effort.
/// When the store falls behind and the queue fills, updates are dropped and
/// counted rather than held.
pub struct MonitorHooks {
    server_id: String,
    tx: mpsc::Sender<HookUpdate>,
    processed: Vec<std::sync::atomic::AtomicU64>,
    dropped: std::sync::atomic::AtomicU64,
}

impl MonitorHooks {
    /// Must be called from within a tokio runtime.
    pub fn new(monitor: Arc<MonitorStore>, workers: usize) -> Self {
        Self::with_capacity(monitor, workers, HOOK_QUEUE_CAPACITY)
    }

    pub fn with_capacity(monitor: Arc<MonitorStore>, workers: usize, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<HookUpdate>(capacity.max(1));
        let server_id = monitor.server_id().to_string();
        tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                match update {
                    HookUpdate::Activity(activity) => {
                        if let Err(e) = monitor.update_worker_activity(&activity).await {
                            tracing::debug!(worker_id = activity.worker_id, error = %e, "Worker activity write failed");
                        }
                    }
                    HookUpdate::Stat(key) => monitor.record_stat(key).await,
                }
            }
        });
        Self {
            server_id,
            tx,
            processed: (0..workers)
                .map(|_| std::sync::atomic::AtomicU64::new(0))
                .collect(),
            dropped: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Updates discarded because the writer queue was full.
    pub fn dropped_updates(&self) -> u64 {
        self.dropped.load(std::sync::atomic::Ordering::Relaxed)
    }

    fn enqueue(&self, update: HookUpdate) {
        if let Err(mpsc::error::TrySendError::Full(_)) = self.tx.try_send(update) {
            let dropped = self.dropped.fetch_add(1, std::sync::atomic::Ordering::Relaxed) + 1;
            crate::metrics::record_monitor_update_dropped();
            if dropped.is_power_of_two() {
                tracing::warn!(dropped, "Monitor writer is behind, dropping telemetry updates");
            }
        }
    }

    fn processed_by(&self, worker_id: usize) -> u64 {
        self.processed
            .get(worker_id)
            .map(|c| c.load(std::sync::atomic::Ordering::Relaxed))
            .unwrap_or(0)
    }
}

impl PoolHooks for MonitorHooks {
    fn on_job_start(&self, worker_id: usize, key: &ConversationKey) {
        let now = Utc::now();
        let activity = WorkerActivity {
            server_id: self.server_id.clone(),
            worker_id,
            processing: true,
            current_key: Some(key.to_string()),
            started_at: Some(now),
            updated_at: now,
            jobs_processed: self.processed_by(worker_id),
        };
        self.enqueue(HookUpdate::Activity(activity));
    }

    fn on_job_end(&self, worker_id: usize, _key: &ConversationKey, outcome: &JobOutcome) {
        if let Some(counter) = self.processed.get(worker_id) {
            counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
        let activity = WorkerActivity {
            server_id: self.server_id.clone(),
            worker_id,
            processing: false,
            current_key: None,
            started_at: None,
            updated_at: Utc::now(),
            jobs_processed: self.processed_by(worker_id),
        };
        self.enqueue(HookUpdate::Activity(activity));
        self.enqueue(HookUpdate::Stat(STAT_PROCESSED));
        if outcome.is_error() {
            self.enqueue(HookUpdate::Stat(STAT_ERRORS));
        }
    }
}
