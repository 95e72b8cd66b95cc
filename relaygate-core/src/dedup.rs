// ABOUTME: Cluster-wide exactly-once admission for inbound messages.
// ABOUTME: Two SET NX locks per message: one on the message id, one on a content fingerprint.

use crate::coord::SharedCoordinator;
use crate::metrics;
use crate::monitor::MonitorStore;
use anyhow::Result;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct DedupConfig {
    /// How long a message id stays locked.
    pub message_ttl: Duration,
    /// How long identical content from the same sender stays locked.
    pub content_ttl: Duration,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            message_ttl: Duration::from_secs(600),
            content_ttl: Duration::from_secs(10),
        }
    }
}

/// Canonical form of a sender address.
///
/// `"+52 1 55-1234-5678"`, `"5215512345678@s.whatsapp.net"` and
/// `"5215512345678:12@s.whatsapp.net"` all normalize to `"5215512345678"`.
pub fn normalize_sender(sender: &str) -> String {
    let lowered = sender.trim().to_lowercase();
    let local = lowered.split('@').next().unwrap_or_default();
    let local = local.split(':').next().unwrap_or_default();
    let local = local.trim().trim_start_matches('+');

    let phone_like = local.chars().any(|c| c.is_ascii_digit())
        && local
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, ' ' | '-' | '.' | '(' | ')'));
    if phone_like {
        local.chars().filter(char::is_ascii_digit).collect()
    } else {
        local.to_string()
    }
}

/// Hex SHA-256 over channel, canonical sender and trimmed text.
pub fn content_fingerprint(channel_id: &str, canonical_sender: &str, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(channel_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical_sender.as_bytes());
    hasher.update([0u8]);
    hasher.update(text.trim().as_bytes());
    hex::encode(hasher.finalize())
}

/// Decides whether an inbound message may proceed.
///
/// A coordination-store failure counts as "lock not acquired", so the
/// message is rejected rather than risking a double reply.
pub struct DedupGuard {
    store: SharedCoordinator,
    config: DedupConfig,
    aliases: RwLock<HashMap<String, String>>,
    monitor: Option<Arc<MonitorStore>>,
}

impl DedupGuard {
    pub fn new(store: SharedCoordinator, config: DedupConfig) -> Self {
        Self {
            store,
            config,
            aliases: RwLock::new(HashMap::new()),
            monitor: None,
        }
    }

    pub fn with_monitor(mut self, monitor: Arc<MonitorStore>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Map an identity that cannot be normalized syntactically (an opaque
    /// linked-device id, say) onto the sender it belongs to.
    pub fn register_alias(&self, alias: &str, canonical: &str) -> Result<()> {
        let mut aliases = self
            .aliases
            .write()
            .map_err(|e| anyhow::anyhow!("Alias table mutex poisoned: {}", e))?;
        aliases.insert(normalize_sender(alias), normalize_sender(canonical));
        Ok(())
    }

    pub fn canonical_sender(&self, sender: &str) -> String {
        let normalized = normalize_sender(sender);
        let aliased = self
            .aliases
            .read()
            .ok()
            .and_then(|aliases| aliases.get(&normalized).cloned());
        aliased.unwrap_or(normalized)
    }

    /// True iff this message may proceed; false means it is a retry or a
    /// duplicate and must be ignored.
    pub async fn admit(&self, channel_id: &str, message_id: &str, sender: &str, text: &str) -> bool {
        let canonical = self.canonical_sender(sender);
        let admitted = match self
            .try_acquire(channel_id, message_id, &canonical, text)
            .await
        {
            Ok(admitted) => admitted,
            Err(e) => {
                tracing::warn!(
                    channel = channel_id,
                    message_id,
                    error = %e,
                    "Dedup lock failed, treating message as duplicate"
                );
                false
            }
        };

        tracing::debug!(
            channel = channel_id,
            message_id,
            sender = %canonical,
            admitted,
            "Dedup decision"
        );
        metrics::record_dedup(channel_id, admitted);
        if let Some(monitor) = &self.monitor {
            let stat = if admitted {
                "dedup_admitted"
            } else {
                "dedup_rejected"
            };
            monitor.record_stat(stat).await;
        }
        admitted
    }

    async fn try_acquire(
        &self,
        channel_id: &str,
        message_id: &str,
        canonical_sender: &str,
        text: &str,
    ) -> Result<bool> {
        if !message_id.is_empty() {
            let key = format!("dedup:msg:{}:{}", channel_id, message_id);
            if !self
                .store
                .set_nx_px(&key, "", self.config.message_ttl)
                .await?
            {
                return Ok(false);
            }
        }

        // Media-only messages are deduplicated on id alone
        if !text.trim().is_empty() {
            let fingerprint = content_fingerprint(channel_id, canonical_sender, text);
            let key = format!("dedup:content:{}", fingerprint);
            if !self
                .store
                .set_nx_px(&key, "", self.config.content_ttl)
                .await?
            {
                return Ok(false);
            }
        }

        Ok(true)
    }
}
