// ABOUTME: Redis-backed coordination store shared by every gateway instance in a cluster.
// ABOUTME: Uses a ConnectionManager for commands and per-channel pub/sub forwarding tasks.

use super::{score_bound, CoordinationStore, DEFAULT_KEY_PREFIX};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};

const CHANNEL_CAPACITY: usize = 256;

/// Coordination store backed by a Redis (or protocol-compatible) server.
pub struct RedisCoordinator {
    client: redis::Client,
    manager: ConnectionManager,
    prefix: String,
    subscriptions: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl std::fmt::Debug for RedisCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCoordinator")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl RedisCoordinator {
    /// Connect to `redis_url` and namespace every key with `prefix`.
    pub async fn connect(redis_url: &str, prefix: Option<&str>) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .with_context(|| "failed to open redis client".to_string())?;
        let manager = client
            .get_connection_manager()
            .await
            .context("failed to connect to redis")?;

        let prefix = prefix.unwrap_or(DEFAULT_KEY_PREFIX).to_string();
        tracing::info!(prefix = %prefix, "Connected to redis coordination store");

        Ok(Self {
            client,
            manager,
            prefix,
            subscriptions: Mutex::new(HashMap::new()),
        })
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    // PX 0 is rejected by redis
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl CoordinationStore for RedisCoordinator {
    fn key_prefix(&self) -> &str {
        &self.prefix
    }

    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn();
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.full_key(key))
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .with_context(|| format!("SET NX failed for {}", key))?;
        Ok(reply.is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn();
        let value: Option<String> = redis::cmd("GET")
            .arg(self.full_key(key))
            .query_async(&mut conn)
            .await
            .with_context(|| format!("GET failed for {}", key))?;
        Ok(value)
    }

    async fn set_px(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn();
        let _: () = redis::cmd("SET")
            .arg(self.full_key(key))
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .with_context(|| format!("SET failed for {}", key))?;
        Ok(())
    }

    async fn set_keep_ttl(&self, key: &str, value: &str) -> Result<bool> {
        let mut conn = self.conn();
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.full_key(key))
            .arg(value)
            .arg("XX")
            .arg("KEEPTTL")
            .query_async(&mut conn)
            .await
            .with_context(|| format!("SET KEEPTTL failed for {}", key))?;
        Ok(reply.is_some())
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn();
        let removed: i64 = redis::cmd("DEL")
            .arg(self.full_key(key))
            .query_async(&mut conn)
            .await
            .with_context(|| format!("DEL failed for {}", key))?;
        Ok(removed > 0)
    }

    async fn pexpire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn();
        let applied: i64 = redis::cmd("PEXPIRE")
            .arg(self.full_key(key))
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .with_context(|| format!("PEXPIRE failed for {}", key))?;
        Ok(applied == 1)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn();
        let count: i64 = redis::cmd("EXISTS")
            .arg(self.full_key(key))
            .query_async(&mut conn)
            .await
            .with_context(|| format!("EXISTS failed for {}", key))?;
        Ok(count > 0)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.conn();
        let keys: Vec<String> = redis::cmd("KEYS")
            .arg(self.full_key(pattern))
            .query_async(&mut conn)
            .await
            .with_context(|| format!("KEYS failed for {}", pattern))?;
        let mut keys: Vec<String> = keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(&self.prefix).map(str::to_string))
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let mut conn = self.conn();
        let _: i64 = redis::cmd("ZADD")
            .arg(self.full_key(key))
            .arg(score)
            .arg(member)
            .query_async(&mut conn)
            .await
            .with_context(|| format!("ZADD failed for {}", key))?;
        Ok(())
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: Option<usize>,
    ) -> Result<Vec<(String, f64)>> {
        let mut conn = self.conn();
        let mut cmd = redis::cmd("ZRANGEBYSCORE");
        cmd.arg(self.full_key(key))
            .arg(score_bound(min))
            .arg(score_bound(max))
            .arg("WITHSCORES");
        if let Some(count) = limit {
            cmd.arg("LIMIT").arg(0).arg(count);
        }
        let entries: Vec<(String, f64)> = cmd
            .query_async(&mut conn)
            .await
            .with_context(|| format!("ZRANGEBYSCORE failed for {}", key))?;
        Ok(entries)
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn();
        let removed: i64 = redis::cmd("ZREM")
            .arg(self.full_key(key))
            .arg(member)
            .query_async(&mut conn)
            .await
            .with_context(|| format!("ZREM failed for {}", key))?;
        Ok(removed == 1)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut conn = self.conn();
        let _: i64 = redis::cmd("HSET")
            .arg(self.full_key(key))
            .arg(field)
            .arg(value)
            .query_async(&mut conn)
            .await
            .with_context(|| format!("HSET failed for {}", key))?;
        Ok(())
    }

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.conn();
        let map: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.full_key(key))
            .query_async(&mut conn)
            .await
            .with_context(|| format!("HGETALL failed for {}", key))?;
        Ok(map)
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool> {
        let mut conn = self.conn();
        let removed: i64 = redis::cmd("HDEL")
            .arg(self.full_key(key))
            .arg(field)
            .query_async(&mut conn)
            .await
            .with_context(|| format!("HDEL failed for {}", key))?;
        Ok(removed > 0)
    }

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        let mut conn = self.conn();
        let value: i64 = redis::cmd("HINCRBY")
            .arg(self.full_key(key))
            .arg(field)
            .arg(delta)
            .query_async(&mut conn)
            .await
            .with_context(|| format!("HINCRBY failed for {}", key))?;
        Ok(value)
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        let mut conn = self.conn();
        let _: i64 = redis::cmd("PUBLISH")
            .arg(self.full_key(channel))
            .arg(message)
            .query_async(&mut conn)
            .await
            .with_context(|| format!("PUBLISH failed for {}", channel))?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<String>> {
        let full = self.full_key(channel);
        let mut subscriptions = self.subscriptions.lock().await;
        if let Some(sender) = subscriptions.get(&full) {
            if sender.receiver_count() > 0 {
                return Ok(sender.subscribe());
            }
        }

        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .context("failed to open redis pub/sub connection")?;
        pubsub
            .subscribe(&full)
            .await
            .with_context(|| format!("SUBSCRIBE failed for {}", channel))?;

        let (tx, rx) = broadcast::channel(CHANNEL_CAPACITY);
        let forward = tx.clone();
        let channel_name = full.clone();
        tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::warn!(channel = %channel_name, error = %e, "Dropping undecodable pub/sub payload");
                        continue;
                    }
                };
                if forward.send(payload).is_err() {
                    // Every local receiver is gone
                    break;
                }
            }
            tracing::debug!(channel = %channel_name, "Pub/sub forwarding task finished");
        });

        subscriptions.insert(full, tx);
        Ok(rx)
    }
}
