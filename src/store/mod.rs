//! Bucketed aggregation store.
//!
//! Live counters sit in one keyed map behind a single readers/writer lock.
//! The hot path is one map access per ingested record, so a coarse lock with
//! a small critical section keeps up at the target throughput and makes
//! flush and snapshot atomic with respect to ingest.

pub mod db;
pub mod maintenance;
pub mod query;

use chrono::{DateTime, Duration as ChronoDuration, Local, Utc};
use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::bucket::bucket_start;
use crate::model::{format_rfc3339, BucketKey, StatRow};
use db::DurableSink;

/// Outcome of one flush cycle.
#[derive(Debug, Clone, Copy)]
pub struct FlushOutcome {
    pub rows: usize,
    pub duration_ms: u128,
}

/// Store construction parameters.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub bucket_size: ChronoDuration,
    /// Align buckets to UTC days instead of the local calendar day.
    pub utc_buckets: bool,
    /// Keep the live map when a flush transaction fails, instead of
    /// clearing it. Off by default: a broken database then drops counters
    /// (surfaced in logs) rather than growing memory without bound.
    pub retain_on_flush_error: bool,
}

pub struct StatStore {
    entries: RwLock<HashMap<BucketKey, StatRow>>,
    sink: DurableSink,
    options: StoreOptions,
    app_start: DateTime<Utc>,
}

impl StatStore {
    pub fn new(sink: DurableSink, options: StoreOptions) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            sink,
            options,
            app_start: Utc::now(),
        }
    }

    pub fn sink(&self) -> &DurableSink {
        &self.sink
    }

    pub fn bucket_size(&self) -> ChronoDuration {
        self.options.bucket_size
    }

    fn now_and_bucket(&self) -> (DateTime<Utc>, String) {
        if self.options.utc_buckets {
            let now = Utc::now();
            let start = bucket_start(now, self.options.bucket_size);
            (now, format_rfc3339(start))
        } else {
            let now = Local::now();
            let start = bucket_start(now, self.options.bucket_size);
            (
                now.with_timezone(&Utc),
                start.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            )
        }
    }

    /// Count one record against its bucket. Creates the counter on first
    /// encounter; the very first bucket after process start may be shorter
    /// than the nominal size. Returns the counter's current count.
    pub async fn ingest(&self, host: &str, level: &str, logger: &str) -> i64 {
        let (now, bucket_ts) = self.now_and_bucket();

        let key = BucketKey {
            host: host.to_string(),
            logger: logger.to_string(),
            level: level.to_string(),
            bucket_ts: bucket_ts.clone(),
        };

        let mut entries = self.entries.write().await;

        if let Some(row) = entries.get_mut(&key) {
            row.n += 1;
            return row.n;
        }

        // New counter. A bucket that began before the process did can only
        // have been observed for part of its span.
        let duration_s = match self.bucket_instant(&bucket_ts) {
            Some(start) if start < self.app_start => (now - self.app_start).num_seconds().max(0),
            _ => self.options.bucket_size.num_seconds(),
        };

        let row = StatRow {
            id: 0,
            hostname: host.to_string(),
            bucket_ts,
            bucket_duration_s: duration_s,
            level: level.to_string(),
            logger: logger.to_string(),
            n: 1,
            first_seen_ts: format_rfc3339(now),
        };
        entries.insert(key, row);

        1
    }

    fn bucket_instant(&self, bucket_ts: &str) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(bucket_ts)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }

    /// Deep copy of every live counter.
    pub async fn snapshot(&self) -> Vec<StatRow> {
        let entries = self.entries.read().await;
        entries.values().cloned().collect()
    }

    pub async fn live_count(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Move every live counter into the durable sink through one upsert
    /// transaction, then clear the map.
    ///
    /// The writer lock is held across the whole transaction, serialising
    /// flush against ingest. On database failure the map is still cleared
    /// unless `retain_on_flush_error` is set; either way the error is
    /// returned to the caller.
    pub async fn flush(&self) -> anyhow::Result<FlushOutcome> {
        let started = Instant::now();
        let mut entries = self.entries.write().await;
        let rows: Vec<StatRow> = entries.values().cloned().collect();

        info!(rows = rows.len(), db = %self.sink.path().display(), "flushing counters");

        match self.sink.upsert_rows(&rows).await {
            Ok(()) => {
                entries.clear();
                let outcome = FlushOutcome {
                    rows: rows.len(),
                    duration_ms: started.elapsed().as_millis(),
                };
                info!(
                    rows = outcome.rows,
                    duration_ms = outcome.duration_ms,
                    "flush complete"
                );
                crate::metrics::record_flush(outcome.rows, started.elapsed());
                Ok(outcome)
            }
            Err(e) => {
                if self.options.retain_on_flush_error {
                    warn!(error = %e, rows = rows.len(), "flush failed, retaining counters for next cycle");
                } else {
                    error!(error = %e, rows = rows.len(), "flush failed, dropping counters");
                    entries.clear();
                }
                Err(e)
            }
        }
    }

    /// Emit the live counters as human-readable log lines.
    pub async fn print_summary(&self) {
        let entries = self.entries.read().await;
        if entries.is_empty() {
            info!("no live log statistics");
            return;
        }

        info!(
            patterns = entries.len(),
            bucket_size_s = self.options.bucket_size.num_seconds(),
            "live log statistics"
        );
        for row in entries.values() {
            info!("{}", row.summary_line());
        }
    }
}
