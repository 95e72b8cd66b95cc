// ABOUTME: Outbound delivery capability used by the scheduler, plus the registry of live adapters.
// ABOUTME: Adapters register and unregister as channels connect and drop.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Sends messages out through one channel instance.
#[async_trait]
pub trait DeliveryAdapter: Send + Sync {
    /// Channel instance this adapter delivers for.
    fn channel_id(&self) -> &str;

    async fn send(&self, target_id: &str, text: &str, media_path: Option<&str>) -> Result<()>;
}

/// Live delivery adapters keyed by channel id.
///
/// Interior locking lets channels come and go while the scheduler holds a
/// shared reference.
pub struct AdapterRegistry {
    adapters: RwLock<HashMap<String, Arc<dyn DeliveryAdapter>>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self {
            adapters: RwLock::new(HashMap::new()),
        }
    }

    /// Register an adapter, replacing any previous one for the same channel.
    pub fn register(&self, adapter: Arc<dyn DeliveryAdapter>) -> Result<()> {
        let id = adapter.channel_id().to_string();
        let mut adapters = self
            .adapters
            .write()
            .map_err(|e| anyhow::anyhow!("Adapter registry mutex poisoned: {}", e))?;
        adapters.insert(id.clone(), adapter);
        tracing::info!(channel = %id, "Delivery adapter registered");
        Ok(())
    }

    pub fn unregister(&self, channel_id: &str) -> Option<Arc<dyn DeliveryAdapter>> {
        let removed = self.adapters.write().ok()?.remove(channel_id);
        if removed.is_some() {
            tracing::info!(channel = %channel_id, "Delivery adapter unregistered");
        }
        removed
    }

    pub fn get(&self, channel_id: &str) -> Option<Arc<dyn DeliveryAdapter>> {
        self.adapters.read().ok()?.get(channel_id).cloned()
    }

    pub fn channel_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .adapters
            .read()
            .map(|a| a.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}
