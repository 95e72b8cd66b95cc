// ABOUTME: Server state shared between the admin surface and background tasks
// ABOUTME: Builds the coordination store, pool, sessions, scheduler and gateway from config

use crate::config::Config;
use crate::gateway::{ConversationHandler, Gateway, GatewaySettings};
use anyhow::{Context, Result};
use relaygate_core::{
    AdapterRegistry, DedupGuard, LocalCoordinator, MemorySessionStore, MonitorHooks,
    MonitorStore, RedisCoordinator, RemoteSessionStore, SessionStore, SharedCoordinator,
    SqlitePostRepository, TaskScheduler, WorkerPool,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How often expired in-process sessions and coordination keys are swept
const LOCAL_PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// In-process backends that expire lazily and need a periodic sweep.
struct LocalBackends {
    store: Arc<LocalCoordinator>,
    sessions: Arc<MemorySessionStore>,
}

/// Everything one gateway instance owns. Components are explicit values
/// threaded through here; there is no process-wide pool or scheduler.
pub struct ServerState {
    pub config: Arc<Config>,
    pub store: SharedCoordinator,
    pub dedup: Arc<DedupGuard>,
    pub monitor: Arc<MonitorStore>,
    pub pool: Arc<WorkerPool>,
    pub sessions: Arc<dyn SessionStore>,
    /// Set when running without redis
    local: Option<LocalBackends>,
    pub scheduler: Arc<TaskScheduler>,
    pub gateway: Arc<Gateway>,
}

impl std::fmt::Debug for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerState")
            .field("config", &"...")
            .field("store", &"<CoordinationStore>")
            .field("monitor", &self.monitor.server_id())
            .field("pool", &"<WorkerPool>")
            .field("sessions", &"<SessionStore>")
            .field("scheduler", &"<TaskScheduler>")
            .field("gateway", &"<Gateway>")
            .finish()
    }
}

impl ServerState {
    /// Initialize all server components. The handler is the conversational
    /// layer that receives flushed session input.
    pub async fn initialize(
        config: Config,
        handler: Arc<dyn ConversationHandler>,
    ) -> Result<Self> {
        let instance_id = config.instance.id.clone();

        let (store, local_store): (SharedCoordinator, Option<Arc<LocalCoordinator>>) =
            match config.redis.as_ref() {
                Some(redis) => {
                    let coordinator =
                        RedisCoordinator::connect(&redis.url, Some(&redis.key_prefix))
                            .await
                            .context("Failed to connect coordination store")?;
                    tracing::info!(prefix = %redis.key_prefix, "Using redis coordination store");
                    let store: SharedCoordinator = Arc::new(coordinator);
                    (store, None)
                }
                None => {
                    tracing::info!("No redis config, using in-process coordination store");
                    let local = Arc::new(LocalCoordinator::new());
                    let store: SharedCoordinator = local.clone();
                    (store, Some(local))
                }
            };

        let monitor = Arc::new(MonitorStore::new(
            Arc::clone(&store),
            instance_id.clone(),
            config.instance.version.clone(),
        ));

        let dedup = Arc::new(
            DedupGuard::new(Arc::clone(&store), config.dedup_config())
                .with_monitor(Arc::clone(&monitor)),
        );

        let pool_config = config.pool_config();
        let hooks = Arc::new(MonitorHooks::new(Arc::clone(&monitor), pool_config.workers));
        let pool = Arc::new(WorkerPool::start_with_hooks(pool_config, hooks)?);
        tracing::info!(workers = pool.num_workers(), "Worker pool started");

        let (sessions, local): (Arc<dyn SessionStore>, Option<LocalBackends>) = match local_store {
            None => {
                let shared: Arc<dyn SessionStore> =
                    Arc::new(RemoteSessionStore::new(Arc::clone(&store)));
                (shared, None)
            }
            Some(local_store) => {
                let local_sessions = Arc::new(MemorySessionStore::new());
                let shared: Arc<dyn SessionStore> = local_sessions.clone();
                let backends = LocalBackends {
                    store: local_store,
                    sessions: local_sessions,
                };
                (shared, Some(backends))
            }
        };

        let db_path = Path::new(&config.scheduler.database_path);
        let repository = Arc::new(
            SqlitePostRepository::open(db_path)
                .with_context(|| format!("Failed to open {}", db_path.display()))?,
        );
        tracing::info!(path = %db_path.display(), "Scheduler store initialized");

        let scheduler = Arc::new(
            TaskScheduler::new(
                Arc::clone(&store),
                repository,
                Arc::new(AdapterRegistry::new()),
                config.scheduler_config(),
            )
            .with_monitor(Arc::clone(&monitor)),
        );

        let gateway = Arc::new(
            Gateway::new(
                Arc::clone(&store),
                Arc::clone(&dedup),
                Arc::clone(&pool),
                Arc::clone(&sessions),
                handler,
                GatewaySettings {
                    session_ttl: config.session_ttl(),
                    debounce: config.debounce(),
                    history_window: config.session.history_window,
                },
            )
            .with_monitor(Arc::clone(&monitor)),
        );

        Ok(Self {
            config: Arc::new(config),
            store,
            dedup,
            monitor,
            pool,
            sessions,
            local,
            scheduler,
            gateway,
        })
    }

    /// Spawn the scheduler, heartbeat and session flush loops. Each stops
    /// when `cancel` fires.
    pub fn spawn_background_tasks(&self, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let scheduler = Arc::clone(&self.scheduler);
        let token = cancel.clone();
        handles.push(tokio::spawn(async move { scheduler.run(token).await }));

        let monitor = Arc::clone(&self.monitor);
        let token = cancel.clone();
        let every = self.config.heartbeat_interval();
        handles.push(tokio::spawn(async move {
            monitor.run_heartbeat(token, every).await
        }));

        let gateway = Arc::clone(&self.gateway);
        let token = cancel.clone();
        let every = self.config.flush_interval();
        handles.push(tokio::spawn(async move {
            gateway.run_flush_loop(token, every).await
        }));

        if let Some(local) = &self.local {
            let store = Arc::clone(&local.store);
            let sessions = Arc::clone(&local.sessions);
            let token = cancel.clone();
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(LOCAL_PURGE_INTERVAL);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => {
                            if let Err(e) = sessions.purge_expired() {
                                tracing::warn!(error = %e, "Session purge failed");
                            }
                            if let Err(e) = store.purge_expired() {
                                tracing::warn!(error = %e, "Coordination key purge failed");
                            }
                        }
                    }
                }
            }));
        }

        handles
    }

    /// Drain the pool after the background tasks have been cancelled. Worker
    /// activity written while draining is cleared with the server entry.
    pub async fn shutdown(&self) {
        tracing::info!("Draining worker pool");
        self.pool.stop().await;
        if let Err(e) = self.monitor.remove_server(self.monitor.server_id()).await {
            tracing::warn!(error = %e, "Failed to deregister server");
        }
    }
}
