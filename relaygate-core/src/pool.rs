// ABOUTME: Sharded worker pool with one bounded FIFO queue per worker.
// ABOUTME: Jobs for one conversation always land on the same shard, so they run in order.

use crate::metrics;
use anyhow::Result;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// Identifies one logical conversation: the channel instance plus the chat on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ConversationKey {
    pub instance_id: String,
    pub chat_id: String,
}

impl ConversationKey {
    pub fn new(instance_id: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            chat_id: chat_id.into(),
        }
    }
}

impl std::fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}|{}", self.instance_id, self.chat_id)
    }
}

/// A unit of work bound to a conversation. The handler does not start until a
/// worker picks the job up.
pub struct MessageJob {
    key: ConversationKey,
    handler: BoxFuture<'static, Result<()>>,
}

impl MessageJob {
    pub fn new<F>(key: ConversationKey, handler: F) -> Self
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            key,
            handler: handler.boxed(),
        }
    }

    pub fn key(&self) -> &ConversationKey {
        &self.key
    }
}

impl std::fmt::Debug for MessageJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageJob")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    /// How often stale entries are evicted from the active-conversation view.
    pub sweep_interval: Duration,
    /// How long a conversation stays in the active view after its last job started.
    pub active_ttl: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            queue_capacity: 256,
            sweep_interval: Duration::from_secs(1),
            active_ttl: Duration::from_secs(2),
        }
    }
}

/// How a job's handler finished.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed,
    Failed(String),
    Panicked(String),
}

impl JobOutcome {
    pub fn is_error(&self) -> bool {
        !matches!(self, JobOutcome::Completed)
    }
}

/// Observer notified around every job. Implementations must not block.
pub trait PoolHooks: Send + Sync {
    fn on_job_start(&self, worker_id: usize, key: &ConversationKey);
    fn on_job_end(&self, worker_id: usize, key: &ConversationKey, outcome: &JobOutcome);
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStats {
    pub id: usize,
    pub queue_depth: usize,
    pub processing: bool,
    pub processed: u64,
}

/// Point-in-time snapshot of the pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub workers: Vec<WorkerStats>,
    /// Recently active conversation keys mapped to their shard.
    pub active: HashMap<String, usize>,
    pub dispatched: u64,
    pub dropped: u64,
    pub processed: u64,
    pub errors: u64,
    pub panics: u64,
    pub running: bool,
}

impl PoolStats {
    pub fn queued(&self) -> usize {
        self.workers.iter().map(|w| w.queue_depth).sum()
    }

    pub fn processing(&self) -> usize {
        self.workers.iter().filter(|w| w.processing).count()
    }
}

/// Stable shard index for a conversation: FNV-1a over `instance|chat`, mod `num_workers`.
pub fn shard_for_chat(instance_id: &str, chat_id: &str, num_workers: usize) -> usize {
    if num_workers == 0 {
        return 0;
    }
    let mut hash = FNV_OFFSET_BASIS;
    let bytes = instance_id
        .bytes()
        .chain(std::iter::once(b'|'))
        .chain(chat_id.bytes());
    for byte in bytes {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash as usize % num_workers
}

struct WorkerSlot {
    processing: AtomicBool,
    processed: AtomicU64,
}

struct PoolShared {
    slots: Vec<WorkerSlot>,
    active: Mutex<HashMap<String, (usize, Instant)>>,
    hooks: Option<Arc<dyn PoolHooks>>,
    running: AtomicBool,
    dispatched: AtomicU64,
    dropped: AtomicU64,
    processed: AtomicU64,
    errors: AtomicU64,
    panics: AtomicU64,
}

impl PoolShared {
    fn mark_active(&self, key: &ConversationKey, worker_id: usize) {
        if let Ok(mut active) = self.active.lock() {
            active.insert(key.to_string(), (worker_id, Instant::now()));
        }
    }

    fn sweep_active(&self, ttl: Duration) {
        let Ok(mut active) = self.active.lock() else {
            return;
        };
        let now = Instant::now();
        active.retain(|_, (_, seen)| now.duration_since(*seen) < ttl);
    }

    async fn run_job(&self, worker_id: usize, job: MessageJob) {
        let MessageJob { key, handler } = job;
        let slot = &self.slots[worker_id];
        slot.processing.store(true, Ordering::SeqCst);
        self.mark_active(&key, worker_id);
        if let Some(hooks) = &self.hooks {
            hooks.on_job_start(worker_id, &key);
        }

        let started = Instant::now();
        let outcome = match AssertUnwindSafe(handler).catch_unwind().await {
            Ok(Ok(())) => JobOutcome::Completed,
            Ok(Err(e)) => {
                tracing::warn!(worker_id, key = %key, error = %format!("{:#}", e), "Job handler failed");
                self.errors.fetch_add(1, Ordering::Relaxed);
                metrics::record_job_error();
                JobOutcome::Failed(format!("{:#}", e))
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(worker_id, key = %key, panic = %message, "Job handler panicked");
                self.errors.fetch_add(1, Ordering::Relaxed);
                self.panics.fetch_add(1, Ordering::Relaxed);
                metrics::record_job_panic();
                JobOutcome::Panicked(message)
            }
        };

        slot.processing.store(false, Ordering::SeqCst);
        slot.processed.fetch_add(1, Ordering::Relaxed);
        self.processed.fetch_add(1, Ordering::Relaxed);
        metrics::record_job_finished(worker_id, started.elapsed().as_secs_f64());
        if let Some(hooks) = &self.hooks {
            hooks.on_job_end(worker_id, &key, &outcome);
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Fixed set of shard workers, each draining its own bounded queue in FIFO order.
///
/// `try_dispatch` never waits for capacity: a full queue or a stopped pool
/// drops the job and bumps the drop counter, and callers treat that as load
/// shedding. `stop` closes every queue, lets workers finish what was already
/// accepted, then waits for them to exit.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    senders: RwLock<Vec<mpsc::Sender<MessageJob>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl WorkerPool {
    /// Spawn the workers and the active-view sweeper on the current runtime.
    pub fn start(config: PoolConfig) -> Result<Self> {
        Self::build(config, None)
    }

    pub fn start_with_hooks(config: PoolConfig, hooks: Arc<dyn PoolHooks>) -> Result<Self> {
        Self::build(config, Some(hooks))
    }

    fn build(config: PoolConfig, hooks: Option<Arc<dyn PoolHooks>>) -> Result<Self> {
        if config.workers == 0 {
            anyhow::bail!("Worker pool needs at least one worker");
        }
        if config.queue_capacity == 0 {
            anyhow::bail!("Worker pool queue capacity must be at least 1");
        }

        let shared = Arc::new(PoolShared {
            slots: (0..config.workers)
                .map(|_| WorkerSlot {
                    processing: AtomicBool::new(false),
                    processed: AtomicU64::new(0),
                })
                .collect(),
            active: Mutex::new(HashMap::new()),
            hooks,
            running: AtomicBool::new(true),
            dispatched: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            panics: AtomicU64::new(0),
        });
        let cancel = CancellationToken::new();

        let mut senders = Vec::with_capacity(config.workers);
        let mut handles = Vec::with_capacity(config.workers + 1);
        for worker_id in 0..config.workers {
            let (tx, rx) = mpsc::channel(config.queue_capacity);
            senders.push(tx);
            handles.push(tokio::spawn(run_worker(
                Arc::clone(&shared),
                worker_id,
                rx,
                cancel.clone(),
            )));
        }
        handles.push(tokio::spawn(run_sweeper(
            Arc::clone(&shared),
            config.sweep_interval,
            config.active_ttl,
            cancel.clone(),
        )));

        tracing::info!(
            workers = config.workers,
            queue_capacity = config.queue_capacity,
            "Worker pool started"
        );

        Ok(Self {
            shared,
            senders: RwLock::new(senders),
            handles: Mutex::new(handles),
            cancel,
        })
    }

    pub fn num_workers(&self) -> usize {
        self.shared.slots.len()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn shard_for(&self, key: &ConversationKey) -> usize {
        shard_for_chat(&key.instance_id, &key.chat_id, self.num_workers())
    }

    /// Enqueue a job on its conversation's shard without waiting.
    ///
    /// Returns false when the job was dropped.
    pub fn try_dispatch(&self, job: MessageJob) -> bool {
        if !self.is_running() {
            self.record_drop(job.key(), "stopped");
            return false;
        }
        let worker_id = self.shard_for(job.key());
        let Ok(senders) = self.senders.read() else {
            self.record_drop(job.key(), "stopped");
            return false;
        };
        let Some(tx) = senders.get(worker_id) else {
            self.record_drop(job.key(), "stopped");
            return false;
        };

        match tx.try_send(job) {
            Ok(()) => {
                self.shared.dispatched.fetch_add(1, Ordering::Relaxed);
                metrics::record_job_dispatched(worker_id);
                metrics::set_queue_depth(worker_id, tx.max_capacity() - tx.capacity());
                true
            }
            Err(TrySendError::Full(job)) => {
                self.record_drop(job.key(), "queue_full");
                false
            }
            Err(TrySendError::Closed(job)) => {
                self.record_drop(job.key(), "stopped");
                false
            }
        }
    }

    fn record_drop(&self, key: &ConversationKey, reason: &'static str) {
        self.shared.dropped.fetch_add(1, Ordering::Relaxed);
        metrics::record_job_dropped(reason);
        tracing::warn!(key = %key, reason, "Dropped job");
    }

    pub fn stats(&self) -> PoolStats {
        let depths: Vec<usize> = match self.senders.read() {
            Ok(senders) => senders
                .iter()
                .map(|tx| tx.max_capacity() - tx.capacity())
                .collect(),
            Err(_) => Vec::new(),
        };
        let workers = self
            .shared
            .slots
            .iter()
            .enumerate()
            .map(|(id, slot)| WorkerStats {
                id,
                queue_depth: depths.get(id).copied().unwrap_or(0),
                processing: slot.processing.load(Ordering::SeqCst),
                processed: slot.processed.load(Ordering::Relaxed),
            })
            .collect();
        let active = self
            .shared
            .active
            .lock()
            .map(|active| {
                active
                    .iter()
                    .map(|(key, (worker_id, _))| (key.clone(), *worker_id))
                    .collect()
            })
            .unwrap_or_default();

        PoolStats {
            workers,
            active,
            dispatched: self.shared.dispatched.load(Ordering::Relaxed),
            dropped: self.shared.dropped.load(Ordering::Relaxed),
            processed: self.shared.processed.load(Ordering::Relaxed),
            errors: self.shared.errors.load(Ordering::Relaxed),
            panics: self.shared.panics.load(Ordering::Relaxed),
            running: self.is_running(),
        }
    }

    /// Stop accepting jobs, drain every queue and wait for all workers to exit.
    pub async fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.cancel.cancel();
        if let Ok(mut senders) = self.senders.write() {
            senders.clear();
        }

        let handles = match self.handles.lock() {
            Ok(mut handles) => std::mem::take(&mut *handles),
            Err(_) => Vec::new(),
        };
        if handles.is_empty() {
            return;
        }
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Worker task ended abnormally");
            }
        }
        tracing::info!(
            processed = self.shared.processed.load(Ordering::Relaxed),
            "Worker pool stopped"
        );
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_worker(
    shared: Arc<PoolShared>,
    worker_id: usize,
    mut rx: mpsc::Receiver<MessageJob>,
    cancel: CancellationToken,
) {
    tracing::debug!(worker_id, "Worker started");
    loop {
        let next = tokio::select! {
            biased;
            job = rx.recv() => job,
            _ = cancel.cancelled() => {
                // Refuse new work but keep draining what was accepted
                rx.close();
                rx.recv().await
            }
        };
        let Some(job) = next else {
            break;
        };
        metrics::set_queue_depth(worker_id, rx.len());
        shared.run_job(worker_id, job).await;
    }
    tracing::debug!(worker_id, "Worker exited");
}

async fn run_sweeper(
    shared: Arc<PoolShared>,
    every: Duration,
    ttl: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => shared.sweep_active(ttl),
        }
    }
}
