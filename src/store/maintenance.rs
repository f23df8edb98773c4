//! Retention worker for the durable sink.
//!
//! Runs once at startup and then on a long period, deleting rows whose
//! bucket fell out of the retention window and optionally reclaiming file
//! space afterwards.

use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info};

use super::db::DurableSink;
use crate::model::format_rfc3339;

#[derive(Debug, Clone, Copy)]
pub struct RetentionConfig {
    pub days: u32,
    pub interval: Duration,
    pub vacuum: bool,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            days: 7,
            interval: Duration::from_secs(3 * 3600),
            vacuum: true,
        }
    }
}

/// Delete everything older than the retention window. Returns the number of
/// rows removed.
pub async fn run_retention(sink: &DurableSink, config: &RetentionConfig) -> Result<u64> {
    let cutoff = format_rfc3339(Utc::now() - ChronoDuration::days(i64::from(config.days)));
    let deleted = sink.delete_older_than(&cutoff).await?;

    info!(
        deleted,
        retention_days = config.days,
        %cutoff,
        "retention pass complete"
    );

    if config.vacuum && deleted > 0 {
        sink.vacuum().await?;
        info!("vacuum complete");
    }

    Ok(deleted)
}

/// Spawn the periodic retention task. The first pass runs immediately.
pub fn spawn_retention_task(
    sink: Arc<DurableSink>,
    config: RetentionConfig,
    mut shutdown: broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = interval.tick() => {
                    if let Err(e) = run_retention(&sink, &config).await {
                        error!(error = %e, "retention pass failed");
                    }
                }
            }
        }
    })
}
