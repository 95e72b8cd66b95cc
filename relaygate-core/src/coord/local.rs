// ABOUTME: In-process coordination store used when no Redis server is configured.
// ABOUTME: Same contract as the remote store but only safe within a single instance.

use super::{CoordinationStore, DEFAULT_KEY_PREFIX};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

const CHANNEL_CAPACITY: usize = 256;
/// Minimum spacing between sweeps of expired values triggered by writes.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Default)]
struct LocalState {
    values: HashMap<String, (String, Option<Instant>)>,
    /// Each set is kept sorted by (score, member).
    zsets: HashMap<String, Vec<(f64, String)>>,
    hashes: HashMap<String, HashMap<String, String>>,
    next_sweep: Option<Instant>,
}

impl LocalState {
    fn sweep_expired(&mut self, now: Instant) -> usize {
        let before = self.values.len();
        self.values
            .retain(|_, (_, deadline)| deadline.map_or(true, |d| d > now));
        self.next_sweep = Some(now + SWEEP_INTERVAL);
        before - self.values.len()
    }

    /// Insert a value, sweeping expired keys at most once per interval.
    /// Lock keys are rarely touched twice, so lazy expiry alone would keep
    /// every one of them.
    fn insert_value(&mut self, key: String, value: String, deadline: Option<Instant>) {
        let now = Instant::now();
        if self.next_sweep.map_or(true, |at| now >= at) {
            self.sweep_expired(now);
        }
        self.values.insert(key, (value, deadline));
    }

    fn live_value(&mut self, key: &str) -> Option<&mut (String, Option<Instant>)> {
        let expired = matches!(
            self.values.get(key),
            Some((_, Some(deadline))) if *deadline <= Instant::now()
        );
        if expired {
            self.values.remove(key);
            return None;
        }
        self.values.get_mut(key)
    }
}

/// Single-process stand-in for the remote coordination store.
///
/// TTLs are enforced lazily on access using `tokio::time::Instant`, so tests
/// running with a paused clock observe expiry deterministically.
pub struct LocalCoordinator {
    prefix: String,
    state: Mutex<LocalState>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl LocalCoordinator {
    pub fn new() -> Self {
        Self::with_prefix(DEFAULT_KEY_PREFIX)
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            state: Mutex::new(LocalState::default()),
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    fn state(&self) -> Result<MutexGuard<'_, LocalState>> {
        self.state
            .lock()
            .map_err(|e| anyhow::anyhow!("Coordinator state mutex poisoned: {}", e))
    }

    /// Drop every expired value; returns how many were removed.
    pub fn purge_expired(&self) -> Result<usize> {
        let removed = self.state()?.sweep_expired(Instant::now());
        if removed > 0 {
            tracing::debug!(removed, "Purged expired coordination keys");
        }
        Ok(removed)
    }

    fn channel_sender(&self, channel: &str) -> Result<broadcast::Sender<String>> {
        let mut channels = self
            .channels
            .lock()
            .map_err(|e| anyhow::anyhow!("Coordinator channel mutex poisoned: {}", e))?;
        let sender = channels
            .entry(self.full_key(channel))
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        Ok(sender.clone())
    }
}

impl Default for LocalCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationStore for LocalCoordinator {
    fn key_prefix(&self) -> &str {
        &self.prefix
    }

    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let key = self.full_key(key);
        let mut state = self.state()?;
        if state.live_value(&key).is_some() {
            return Ok(false);
        }
        state.insert_value(key, value.to_string(), Some(Instant::now() + ttl));
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let key = self.full_key(key);
        let mut state = self.state()?;
        Ok(state.live_value(&key).map(|(value, _)| value.clone()))
    }

    async fn set_px(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let key = self.full_key(key);
        let mut state = self.state()?;
        state.insert_value(key, value.to_string(), Some(Instant::now() + ttl));
        Ok(())
    }

    async fn set_keep_ttl(&self, key: &str, value: &str) -> Result<bool> {
        let key = self.full_key(key);
        let mut state = self.state()?;
        match state.live_value(&key) {
            Some(entry) => {
                entry.0 = value.to_string();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let key = self.full_key(key);
        let mut state = self.state()?;
        let live = state.live_value(&key).is_some();
        state.values.remove(&key);
        let zset = state.zsets.remove(&key).is_some();
        let hash = state.hashes.remove(&key).is_some();
        Ok(live || zset || hash)
    }

    async fn pexpire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let key = self.full_key(key);
        let mut state = self.state()?;
        match state.live_value(&key) {
            Some(entry) => {
                entry.1 = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let key = self.full_key(key);
        let mut state = self.state()?;
        Ok(state.live_value(&key).is_some()
            || state.zsets.contains_key(&key)
            || state.hashes.contains_key(&key))
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let matcher = glob::Pattern::new(pattern)
            .map_err(|e| anyhow::anyhow!("Invalid key pattern '{}': {}", pattern, e))?;
        let mut state = self.state()?;
        state.sweep_expired(Instant::now());

        let mut keys: Vec<String> = state
            .values
            .keys()
            .chain(state.zsets.keys())
            .chain(state.hashes.keys())
            .filter_map(|k| k.strip_prefix(&self.prefix))
            .filter(|k| matcher.matches(k))
            .map(str::to_string)
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let key = self.full_key(key);
        let mut state = self.state()?;
        let set = state.zsets.entry(key).or_default();
        set.retain(|(_, m)| m != member);
        let pos = set
            .iter()
            .position(|(s, m)| (*s, m.as_str()) > (score, member))
            .unwrap_or(set.len());
        set.insert(pos, (score, member.to_string()));
        Ok(())
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: Option<usize>,
    ) -> Result<Vec<(String, f64)>> {
        let key = self.full_key(key);
        let state = self.state()?;
        let Some(set) = state.zsets.get(&key) else {
            return Ok(Vec::new());
        };
        Ok(set
            .iter()
            .filter(|(score, _)| *score >= min && *score <= max)
            .take(limit.unwrap_or(usize::MAX))
            .map(|(score, member)| (member.clone(), *score))
            .collect())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        let key = self.full_key(key);
        let mut state = self.state()?;
        let Some(set) = state.zsets.get_mut(&key) else {
            return Ok(false);
        };
        let before = set.len();
        set.retain(|(_, m)| m != member);
        let removed = set.len() < before;
        if set.is_empty() {
            state.zsets.remove(&key);
        }
        Ok(removed)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let key = self.full_key(key);
        let mut state = self.state()?;
        state
            .hashes
            .entry(key)
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let key = self.full_key(key);
        let state = self.state()?;
        Ok(state.hashes.get(&key).cloned().unwrap_or_default())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool> {
        let key = self.full_key(key);
        let mut state = self.state()?;
        let Some(hash) = state.hashes.get_mut(&key) else {
            return Ok(false);
        };
        let removed = hash.remove(field).is_some();
        if hash.is_empty() {
            state.hashes.remove(&key);
        }
        Ok(removed)
    }

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        let key = self.full_key(key);
        let mut state = self.state()?;
        let hash = state.hashes.entry(key).or_default();
        let current = match hash.get(field) {
            Some(raw) => raw
                .parse::<i64>()
                .map_err(|_| anyhow::anyhow!("Hash field '{}' is not an integer", field))?,
            None => 0,
        };
        let next = current + delta;
        hash.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        // No receivers is not an error for fan-out.
        let _ = self.channel_sender(channel)?.send(message.to_string());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<String>> {
        Ok(self.channel_sender(channel)?.subscribe())
    }
}
