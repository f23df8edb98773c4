//! The `serve` command: load configuration, apply CLI overrides, run.

use anyhow::Result;
use std::path::Path;

use crate::config::{self, Config};
use crate::server;

#[derive(Debug, Default, Clone)]
pub struct ServeOverrides {
    pub host: Option<String>,
    pub tcp_port: Option<u16>,
    pub http_port: Option<u16>,
    pub db_path: Option<String>,
    pub bucket_minutes: Option<u32>,
}

pub fn load_with_overrides(config_path: &Path, overrides: &ServeOverrides) -> Result<Config> {
    let mut cfg = config::load_config(config_path)?;

    if let Some(host) = &overrides.host {
        cfg.server.host = host.clone();
    }
    if let Some(port) = overrides.tcp_port {
        cfg.server.tcp_port = port;
    }
    if let Some(port) = overrides.http_port {
        cfg.server.http_port = port;
    }
    if let Some(db_path) = &overrides.db_path {
        cfg.storage.db_path = db_path.clone();
    }
    if let Some(minutes) = overrides.bucket_minutes {
        cfg.storage.bucket_minutes = minutes;
    }

    config::validate_config(&cfg)?;
    Ok(cfg)
}

pub async fn execute(config_path: &Path, overrides: ServeOverrides) -> Result<()> {
    let cfg = load_with_overrides(config_path, &overrides)?;
    crate::init_tracing(&cfg.server.log_level);
    server::start_server(cfg).await
}
