// ABOUTME: Configuration parsing from TOML file with environment variable overrides
// ABOUTME: Validates pool and redis settings and converts sections into core component configs
use crate::paths;
use anyhow::{Context, Result};
use relaygate_core::coord::DEFAULT_KEY_PREFIX;
use relaygate_core::{DedupConfig, PoolConfig, SchedulerConfig as CoreSchedulerConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub instance: InstanceConfig,
    /// Absent means single-process coordination
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redis: Option<RedisConfig>,
    #[serde(default)]
    pub pool: PoolSection,
    #[serde(default)]
    pub dedup: DedupSection,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

// ─── InstanceConfig ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    #[serde(default = "default_instance_id")]
    pub id: String,
    #[serde(default = "default_version")]
    pub version: String,
}

/// Hostname when the environment provides one, otherwise a short random id
fn default_instance_id() -> String {
    match std::env::var("HOSTNAME") {
        Ok(host) if !host.trim().is_empty() => host.trim().to_string(),
        _ => {
            let id = uuid::Uuid::new_v4().simple().to_string();
            format!("relaygate-{}", &id[..8])
        }
    }
}

fn default_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            id: default_instance_id(),
            version: default_version(),
        }
    }
}

// ─── RedisConfig ────────────────────────────────────────────────

#[derive(Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

/// Replace any userinfo in a redis URL so passwords never reach the logs
pub fn redact_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    match rest.rsplit_once('@') {
        Some((_, host)) => format!("{}://[REDACTED]@{}", scheme, host),
        None => url.to_string(),
    }
}

// Custom Debug impl to redact credentials embedded in the URL
impl std::fmt::Debug for RedisConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisConfig")
            .field("url", &redact_url(&self.url))
            .field("key_prefix", &self.key_prefix)
            .finish()
    }
}

// ─── PoolSection ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSection {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    #[serde(default = "default_active_ttl_ms")]
    pub active_ttl_ms: u64,
}

fn default_workers() -> usize {
    8
}

fn default_queue_capacity() -> usize {
    256
}

fn default_sweep_interval_ms() -> u64 {
    1000
}

fn default_active_ttl_ms() -> u64 {
    2000
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            sweep_interval_ms: default_sweep_interval_ms(),
            active_ttl_ms: default_active_ttl_ms(),
        }
    }
}

// ─── DedupSection ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupSection {
    #[serde(default = "default_message_ttl_secs")]
    pub message_ttl_secs: u64,
    #[serde(default = "default_content_ttl_secs")]
    pub content_ttl_secs: u64,
}

fn default_message_ttl_secs() -> u64 {
    600
}

fn default_content_ttl_secs() -> u64 {
    10
}

impl Default for DedupSection {
    fn default() -> Self {
        Self {
            message_ttl_secs: default_message_ttl_secs(),
            content_ttl_secs: default_content_ttl_secs(),
        }
    }
}

// ─── SessionConfig ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_session_ttl_secs")]
    pub ttl_secs: u64,
    /// Chat turns kept per session
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    /// Quiet period before buffered input is handed to the handler
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

fn default_session_ttl_secs() -> u64 {
    1800
}

fn default_history_window() -> usize {
    20
}

fn default_debounce_ms() -> u64 {
    3000
}

fn default_flush_interval_ms() -> u64 {
    500
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_session_ttl_secs(),
            history_window: default_history_window(),
            debounce_ms: default_debounce_ms(),
            flush_interval_ms: default_flush_interval_ms(),
        }
    }
}

// ─── SchedulerSection ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSection {
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_max_idle_secs")]
    pub max_idle_secs: u64,
}

fn default_database_path() -> String {
    paths::scheduler_db().to_string_lossy().to_string()
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_max_idle_secs() -> u64 {
    30
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            poll_interval_secs: default_poll_interval_secs(),
            max_idle_secs: default_max_idle_secs(),
        }
    }
}

// ─── MonitorConfig ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
        }
    }
}

// ─── AdminConfig ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_admin_host")]
    pub host: String,
    #[serde(default = "default_admin_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_admin_host() -> String {
    "127.0.0.1".to_string()
}

fn default_admin_port() -> u16 {
    13080
}

fn default_true() -> bool {
    true
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            host: default_admin_host(),
            port: default_admin_port(),
            enabled: true,
        }
    }
}

// ─── LoggingConfig ──────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Daily-rolling log files are written here when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,
    #[serde(default)]
    pub json: bool,
}

/// Expand tilde (~) to home directory in paths
/// Logs a warning if expansion fails and falls back to the original path
fn expand_tilde(path: &str) -> String {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(base_dirs) = directories::BaseDirs::new() {
            return base_dirs
                .home_dir()
                .join(stripped)
                .to_string_lossy()
                .to_string();
        } else {
            tracing::warn!(
                path = %path,
                "Failed to expand tilde in path: could not determine home directory"
            );
        }
    } else if path == "~" {
        if let Some(base_dirs) = directories::BaseDirs::new() {
            return base_dirs.home_dir().to_string_lossy().to_string();
        } else {
            tracing::warn!("Failed to expand tilde: could not determine home directory");
        }
    }
    path.to_string()
}

/// Parse a numeric env override, naming the variable on failure
fn parse_env<T: std::str::FromStr>(name: &str, val: &str) -> Result<T> {
    val.trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("{} must be a valid number, got: {}", name, val))
}

impl Config {
    /// Find the config file, checking multiple locations in order:
    /// 1. RELAYGATE_CONFIG_PATH env var (if set)
    /// 2. ./config.toml (current directory - for development)
    /// 3. ~/.config/relaygate/config.toml (XDG config dir)
    fn find_config_file() -> Option<PathBuf> {
        if let Ok(env_path) = std::env::var("RELAYGATE_CONFIG_PATH") {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Some(path);
            }
        }

        let local_config = PathBuf::from("config.toml");
        if local_config.exists() {
            return Some(local_config);
        }

        let xdg_config = paths::config_file();
        if xdg_config.exists() {
            return Some(xdg_config);
        }

        None
    }

    /// Load configuration with environment variable overrides.
    /// Searches: RELAYGATE_CONFIG_PATH env var, ./config.toml, then ~/.config/relaygate/config.toml
    pub fn load() -> Result<Self> {
        let config = match Self::find_config_file() {
            Some(path) => Self::parse_file(&path)?,
            None => {
                tracing::info!("No config file found, using environment variables and defaults");
                Config::default()
            }
        };
        config.finish()
    }

    /// Load an explicit config file (the `--config` flag). The file must exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        Self::parse_file(path)?.finish()
    }

    fn parse_file(path: &Path) -> Result<Self> {
        tracing::info!(path = %path.display(), "Loading configuration from file");
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str::<Config>(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))
    }

    fn finish(mut self) -> Result<Self> {
        self.apply_env_overrides()?;
        self.scheduler.database_path = expand_tilde(&self.scheduler.database_path);
        if let Some(dir) = self.logging.directory.as_mut() {
            *dir = expand_tilde(dir);
        }
        self.validate()?;
        Ok(self)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(val) = std::env::var("RELAYGATE_INSTANCE_ID") {
            self.instance.id = val;
        }
        if let Ok(val) = std::env::var("REDIS_URL") {
            match self.redis.as_mut() {
                Some(redis) => redis.url = val,
                None => {
                    self.redis = Some(RedisConfig {
                        url: val,
                        key_prefix: default_key_prefix(),
                    })
                }
            }
        }
        if let Ok(val) = std::env::var("REDIS_KEY_PREFIX") {
            // Only meaningful when a redis section exists
            if let Some(redis) = self.redis.as_mut() {
                redis.key_prefix = val;
            }
        }
        if let Ok(val) = std::env::var("POOL_WORKERS") {
            self.pool.workers = parse_env("POOL_WORKERS", &val)?;
        }
        if let Ok(val) = std::env::var("POOL_QUEUE_CAPACITY") {
            self.pool.queue_capacity = parse_env("POOL_QUEUE_CAPACITY", &val)?;
        }
        if let Ok(val) = std::env::var("SESSION_TTL_SECS") {
            self.session.ttl_secs = parse_env("SESSION_TTL_SECS", &val)?;
        }
        if let Ok(val) = std::env::var("SCHEDULER_DATABASE_PATH") {
            self.scheduler.database_path = val;
        }
        if let Ok(val) = std::env::var("ADMIN_PORT") {
            self.admin.port = val.parse().with_context(|| {
                format!("ADMIN_PORT must be a valid port number, got: {}", val)
            })?;
        }
        if let Ok(val) = std::env::var("ADMIN_HOST") {
            self.admin.host = val;
        }
        if let Ok(val) = std::env::var("LOG_DIR") {
            self.logging.directory = Some(val);
        }
        Ok(())
    }

    /// Reject settings the core components cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.instance.id.trim().is_empty() {
            anyhow::bail!("instance.id must not be empty (set in config.toml or RELAYGATE_INSTANCE_ID)");
        }
        if self.pool.workers < 1 {
            anyhow::bail!("pool.workers must be at least 1");
        }
        if self.pool.queue_capacity < 1 {
            anyhow::bail!("pool.queue_capacity must be at least 1");
        }
        if self.session.history_window < 1 {
            anyhow::bail!("session.history_window must be at least 1");
        }
        if let Some(redis) = &self.redis {
            if !redis.url.starts_with("redis://") && !redis.url.starts_with("rediss://") {
                anyhow::bail!(
                    "redis.url must start with redis:// or rediss://, got: {}",
                    redact_url(&redis.url)
                );
            }
        }
        Ok(())
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            workers: self.pool.workers,
            queue_capacity: self.pool.queue_capacity,
            sweep_interval: Duration::from_millis(self.pool.sweep_interval_ms),
            active_ttl: Duration::from_millis(self.pool.active_ttl_ms),
        }
    }

    pub fn dedup_config(&self) -> DedupConfig {
        DedupConfig {
            message_ttl: Duration::from_secs(self.dedup.message_ttl_secs),
            content_ttl: Duration::from_secs(self.dedup.content_ttl_secs),
        }
    }

    pub fn scheduler_config(&self) -> CoreSchedulerConfig {
        CoreSchedulerConfig {
            poll_interval: Duration::from_secs(self.scheduler.poll_interval_secs),
            max_idle: Duration::from_secs(self.scheduler.max_idle_secs),
        }
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session.ttl_secs)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.session.debounce_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.session.flush_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.monitor.heartbeat_interval_secs)
    }

    pub fn admin_addr(&self) -> String {
        format!("{}:{}", self.admin.host, self.admin.port)
    }
}
