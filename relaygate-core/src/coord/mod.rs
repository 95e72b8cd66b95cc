// ABOUTME: Coordination store capability shared by every cluster-aware component.
// ABOUTME: Atomic KV, sorted-set, hash and pub/sub primitives under a namespaced key prefix.

mod local;
mod remote;

pub use self::local::LocalCoordinator;
pub use self::remote::RedisCoordinator;

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Default namespace prepended to every key and channel name.
pub const DEFAULT_KEY_PREFIX: &str = "relaygate:";

/// Shared handle to whichever coordination backend the process was built with.
pub type SharedCoordinator = Arc<dyn CoordinationStore>;

/// Remote coordination primitives with Redis semantics.
///
/// Callers always pass un-prefixed keys; implementations namespace them with
/// [`CoordinationStore::key_prefix`] so several deployments can share one
/// store. Every mutation used for locking (`set_nx_px`, `zrem`) is a single
/// atomic command on the backend, never a client-side read-modify-write.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Namespace prepended to every key.
    fn key_prefix(&self) -> &str;

    /// `SET key value NX PX ttl`. Returns true if the key was set by this call.
    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// `SET key value PX ttl`, overwriting any existing value.
    async fn set_px(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// `SET key value XX KEEPTTL`: overwrite a live key without touching its
    /// expiry. Returns false if the key is absent.
    async fn set_keep_ttl(&self, key: &str, value: &str) -> Result<bool>;

    /// Returns true if a key was removed.
    async fn del(&self, key: &str) -> Result<bool>;

    /// Resets the TTL of an existing key. Returns false if the key is absent.
    async fn pexpire(&self, key: &str, ttl: Duration) -> Result<bool>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Keys matching a glob pattern, returned without the namespace prefix.
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()>;

    /// Members with `min <= score <= max` in ascending score order.
    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: Option<usize>,
    ) -> Result<Vec<(String, f64)>>;

    /// Returns true only for the caller whose command actually removed the member.
    async fn zrem(&self, key: &str, member: &str) -> Result<bool>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>>;

    async fn hdel(&self, key: &str, field: &str) -> Result<bool>;

    /// Atomic increment; returns the value after the increment.
    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64>;

    /// Best-effort fan-out to every subscriber in the cluster.
    async fn publish(&self, channel: &str, message: &str) -> Result<()>;

    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<String>>;
}

/// Formats a sorted-set bound the way the Redis protocol expects it.
pub(crate) fn score_bound(value: f64) -> String {
    if value == f64::NEG_INFINITY {
        "-inf".to_string()
    } else if value == f64::INFINITY {
        "+inf".to_string()
    } else {
        value.to_string()
    }
}
