// ABOUTME: Concurrency and cluster-coordination core of the relaygate chat gateway
// ABOUTME: Dedup, sharded dispatch, sessions, scheduling and telemetry over a shared store

pub mod coord;
pub mod dedup;
pub mod metrics;
pub mod monitor;
pub mod pool;
pub mod scheduler;
pub mod session;

pub use coord::{CoordinationStore, LocalCoordinator, RedisCoordinator, SharedCoordinator};
pub use dedup::{DedupConfig, DedupGuard};
pub use monitor::{GlobalStats, MonitorHooks, MonitorStore, ServerInfo, WorkerActivity};
pub use pool::{ConversationKey, JobOutcome, MessageJob, PoolConfig, PoolHooks, PoolStats, WorkerPool};
pub use scheduler::{
    AdapterRegistry, DeliveryAdapter, PostRepository, PostStatus, ScheduledPost, SchedulerConfig,
    SqlitePostRepository, TaskScheduler,
};
pub use session::{
    MemorySessionStore, RemoteSessionStore, SessionEntry, SessionState, SessionStore,
};
