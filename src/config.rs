use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::bucket;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub retention: RetentionConfig,
    pub hub: HubConfig,
    pub ingest: IngestConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    /// Newline-delimited JSON log receiver.
    pub tcp_port: u16,
    /// Query API, WebSocket subscribers and metrics.
    pub http_port: u16,
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            tcp_port: 3001,
            http_port: 3000,
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: String,
    /// One of 1, 5, 10, 15, 20, 30, 60.
    pub bucket_minutes: u32,
    pub flush_interval_secs: u64,
    /// Keep live counters when a flush transaction fails instead of
    /// dropping them. Off by default: a broken database then loses the
    /// cycle's counters rather than growing memory without bound.
    pub retain_on_flush_error: bool,
    /// Align buckets to UTC days instead of the local calendar day.
    pub utc_buckets: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: "log_stat.db".to_string(),
            bucket_minutes: 1,
            flush_interval_secs: 300,
            retain_on_flush_error: false,
            utc_buckets: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub days: u32,
    pub interval_hours: u64,
    pub vacuum: bool,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            days: 7,
            interval_hours: 3,
            vacuum: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HubConfig {
    pub max_clients: usize,
    pub broadcast_capacity: usize,
    pub session_queue_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_clients: 20,
            broadcast_capacity: 1024,
            session_queue_capacity: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Rewrite `timer` loggers with the timedObjectId from the message.
    /// Specific to one application-server family, so off by default.
    pub rewrite_timer_loggers: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            rewrite_timer_loggers: false,
        }
    }
}

/// Load configuration from an optional TOML file overlaid with
/// `LOGSTAT__`-prefixed environment variables.
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let builder = config::Config::builder()
        .add_source(config::File::from(path).required(false))
        .add_source(config::Environment::with_prefix("LOGSTAT").separator("__"));

    let cfg: Config = builder.build()?.try_deserialize()?;
    validate_config(&cfg)?;

    Ok(cfg)
}

pub fn validate_config(cfg: &Config) -> anyhow::Result<()> {
    if !bucket::is_valid_bucket_minutes(cfg.storage.bucket_minutes) {
        anyhow::bail!(
            "invalid bucket size {}m; allowed: 1, 5, 10, 15, 20, 30, 60",
            cfg.storage.bucket_minutes
        );
    }

    if cfg.storage.flush_interval_secs == 0 {
        anyhow::bail!("flush_interval_secs must be positive");
    }

    if cfg.retention.days == 0 {
        anyhow::bail!("retention.days must be at least 1");
    }

    if cfg.hub.max_clients == 0 {
        anyhow::bail!("hub.max_clients must be at least 1");
    }

    if cfg.hub.broadcast_capacity == 0 || cfg.hub.session_queue_capacity == 0 {
        anyhow::bail!("hub channel capacities must be positive");
    }

    Ok(())
}
