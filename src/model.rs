//! Core data types shared across the collector.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// A single ingested log record, as observed by the TCP ingest side.
///
/// The timestamp is assigned on receipt, not taken from the producer.
#[derive(Debug, Clone)]
pub struct RawLogEntry {
    pub timestamp: DateTime<Utc>,
    pub host: String,
    pub logger: String,
    pub level: String,
    pub message: String,
    pub stack_trace: String,
}

/// Identity of a live counter in the aggregation store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    pub host: String,
    pub logger: String,
    pub level: String,
    pub bucket_ts: String,
}

/// One counter row. Lives in the aggregation store between flushes and in
/// the `log_stats` table afterwards; `id` is 0 for rows that have not been
/// persisted yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatRow {
    #[serde(default)]
    pub id: i64,
    pub hostname: String,
    pub bucket_ts: String,
    pub bucket_duration_s: i64,
    pub level: String,
    pub logger: String,
    pub n: i64,
    #[serde(default)]
    pub first_seen_ts: String,
}

impl StatRow {
    pub fn summary_line(&self) -> String {
        format!(
            "id:{} | host:{:<10} | bucket:{} | first_seen:{} | duration:{}s | level:{:<8} | logger:{:<30} | n:{}",
            self.id,
            self.hostname,
            self.bucket_ts,
            self.first_seen_ts,
            self.bucket_duration_s,
            self.level,
            self.logger,
            self.n
        )
    }
}

/// Aggregate of all loggers for one `(host, bucket, level)` cell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedStat {
    pub hostname: String,
    pub bucket_ts: String,
    pub level: String,
    pub total_count: i64,
    pub logger_count: i64,
    #[serde(default)]
    pub first_seen_ts: String,
}

/// A log entry shaped for delivery to a WebSocket subscriber.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogMessage {
    pub timestamp: String,
    pub host: String,
    pub logger: String,
    pub level: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<StackTraceView>,
}

/// Reduced stack-trace shapes. Serialized untagged so each variant emits its
/// own JSON object directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StackTraceView {
    Summary {
        hash: String,
        first_line: String,
        frame_count: usize,
    },
    Filtered {
        hash: String,
        frames: Vec<String>,
        omitted: usize,
    },
}

pub fn format_rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}
