//! Unified query layer over live counters and the durable sink.
//!
//! Live rows are filtered in-process with a real regex; durable rows are
//! filtered in SQL through a best-effort translation of the pattern to a
//! LIKE expression. The translation understands `^`, `$`, `.*` and `\.`
//! only; anything richer degrades to an unanchored substring match in SQL,
//! so callers depending on exact semantics should query the in-memory side.

use anyhow::Result;
use chrono::{DateTime, Utc};
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::warn;

use crate::model::{format_rfc3339, AggregatedStat, StatRow};

use super::StatStore;

/// Filter criteria shared by the row and aggregate queries.
#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    pub level: Option<String>,
    pub logger_regex: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// 0 = unlimited.
    pub max_results: usize,
    pub include_memory: bool,
    pub include_db: bool,
}

impl QueryFilter {
    pub fn both_sides() -> Self {
        Self {
            include_memory: true,
            include_db: true,
            ..Self::default()
        }
    }
}

/// A query that could not even start, as opposed to one that degraded.
#[derive(Debug)]
pub struct BadPatternError {
    pub pattern: String,
    pub reason: String,
}

impl fmt::Display for BadPatternError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid logger pattern {:?}: {}", self.pattern, self.reason)
    }
}

impl std::error::Error for BadPatternError {}

/// Query result. `degraded` is set when the durable side failed and only
/// live rows are present.
#[derive(Debug)]
pub struct QueryOutcome<T> {
    pub rows: Vec<T>,
    pub degraded: bool,
}

/// Translate a simple regex to a SQL LIKE pattern.
///
/// `^`/`$` anchor the pattern, `.*` becomes `%`, `\.` becomes a literal
/// dot. An unanchored pattern is wrapped in `%…%`.
pub fn regex_to_like(pattern: &str) -> String {
    if pattern.is_empty() {
        return "%".to_string();
    }

    let has_start = pattern.starts_with('^');
    let has_end = pattern.ends_with('$');

    let mut p = pattern.to_string();
    if has_start {
        p = p[1..].to_string();
    }
    if has_end {
        p.truncate(p.len() - 1);
    }

    p = p.replace(".*", "%").replace("\\.", ".");

    if !has_start && !has_end {
        p = format!("%{p}%");
    } else if has_start && !has_end {
        if !p.ends_with('%') {
            p.push('%');
        }
    } else if !has_start && has_end && !p.starts_with('%') {
        p = format!("%{p}");
    }

    p
}

impl StatStore {
    /// Filtered rows from the selected sides, newest bucket first, truncated
    /// to `max_results` after ordering.
    pub async fn query_stats(
        &self,
        filter: &QueryFilter,
    ) -> Result<QueryOutcome<StatRow>, BadPatternError> {
        let logger_regex = compile_logger_regex(filter.logger_regex.as_deref())?;

        let mut rows = Vec::new();
        let mut degraded = false;

        if filter.include_memory {
            let snapshot = self.snapshot().await;
            rows.extend(
                snapshot
                    .into_iter()
                    .filter(|r| matches_in_memory(r, filter, logger_regex.as_ref())),
            );
        }

        if filter.include_db {
            match self
                .sink()
                .select_rows(
                    filter.level.as_deref(),
                    filter
                        .logger_regex
                        .as_deref()
                        .map(regex_to_like)
                        .as_deref(),
                    filter.start_time.map(format_rfc3339).as_deref(),
                    filter.end_time.map(format_rfc3339).as_deref(),
                    max_results_as_limit(filter.max_results),
                )
                .await
            {
                Ok(db_rows) => rows.extend(db_rows),
                Err(e) => {
                    warn!(error = %e, "durable query failed, returning live rows only");
                    degraded = true;
                }
            }
        }

        rows.sort_by(|a, b| b.bucket_ts.cmp(&a.bucket_ts));
        if filter.max_results > 0 {
            rows.truncate(filter.max_results);
        }

        Ok(QueryOutcome { rows, degraded })
    }

    /// Group matching rows by `(host, bucket, level)`, summing counts and
    /// counting loggers. The durable side aggregates in SQL, the live side
    /// in-process; the two are merged key-wise with the same rule.
    pub async fn query_aggregated(
        &self,
        filter: &QueryFilter,
    ) -> Result<QueryOutcome<AggregatedStat>, BadPatternError> {
        let logger_regex = compile_logger_regex(filter.logger_regex.as_deref())?;

        let mut aggregates: HashMap<(String, String, String), AggregatedStat> = HashMap::new();
        let mut degraded = false;

        if filter.include_memory {
            let snapshot = self.snapshot().await;
            let mut seen_loggers: HashMap<(String, String, String), HashSet<String>> =
                HashMap::new();

            for row in snapshot
                .into_iter()
                .filter(|r| matches_in_memory(r, filter, logger_regex.as_ref()))
            {
                let key = (row.hostname.clone(), row.bucket_ts.clone(), row.level.clone());
                let loggers = seen_loggers.entry(key.clone()).or_default();
                let new_logger = loggers.insert(row.logger.clone());

                let agg = aggregates.entry(key).or_insert_with(|| AggregatedStat {
                    hostname: row.hostname.clone(),
                    bucket_ts: row.bucket_ts.clone(),
                    level: row.level.clone(),
                    total_count: 0,
                    logger_count: 0,
                    first_seen_ts: String::new(),
                });
                agg.total_count += row.n;
                if new_logger {
                    agg.logger_count += 1;
                }
                merge_first_seen(&mut agg.first_seen_ts, &row.first_seen_ts);
            }
        }

        if filter.include_db {
            match self
                .sink()
                .select_aggregated(
                    filter.level.as_deref(),
                    filter
                        .logger_regex
                        .as_deref()
                        .map(regex_to_like)
                        .as_deref(),
                    filter.start_time.map(format_rfc3339).as_deref(),
                    filter.end_time.map(format_rfc3339).as_deref(),
                )
                .await
            {
                Ok(db_aggs) => {
                    for db_agg in db_aggs {
                        let key = (
                            db_agg.hostname.clone(),
                            db_agg.bucket_ts.clone(),
                            db_agg.level.clone(),
                        );
                        match aggregates.get_mut(&key) {
                            Some(agg) => {
                                agg.total_count += db_agg.total_count;
                                agg.logger_count += db_agg.logger_count;
                                merge_first_seen(&mut agg.first_seen_ts, &db_agg.first_seen_ts);
                            }
                            None => {
                                aggregates.insert(key, db_agg);
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "durable aggregation failed, returning live aggregates only");
                    degraded = true;
                }
            }
        }

        let mut rows: Vec<AggregatedStat> = aggregates.into_values().collect();
        rows.sort_by(|a, b| b.bucket_ts.cmp(&a.bucket_ts));
        if filter.max_results > 0 {
            rows.truncate(filter.max_results);
        }

        Ok(QueryOutcome { rows, degraded })
    }
}

fn compile_logger_regex(pattern: Option<&str>) -> Result<Option<Regex>, BadPatternError> {
    match pattern {
        None | Some("") => Ok(None),
        Some(p) => Regex::new(p).map(Some).map_err(|e| BadPatternError {
            pattern: p.to_string(),
            reason: e.to_string(),
        }),
    }
}

fn matches_in_memory(row: &StatRow, filter: &QueryFilter, logger_regex: Option<&Regex>) -> bool {
    if let Some(level) = &filter.level {
        if &row.level != level {
            return false;
        }
    }

    if let Some(re) = logger_regex {
        if !re.is_match(&row.logger) {
            return false;
        }
    }

    if filter.start_time.is_some() || filter.end_time.is_some() {
        let Ok(bucket) = DateTime::parse_from_rfc3339(&row.bucket_ts) else {
            return false;
        };
        let bucket = bucket.with_timezone(&Utc);

        if let Some(start) = filter.start_time {
            if bucket < start {
                return false;
            }
        }
        if let Some(end) = filter.end_time {
            if bucket > end {
                return false;
            }
        }
    }

    true
}

/// Keep the earliest non-empty timestamp. Empty compares as missing.
fn merge_first_seen(current: &mut String, candidate: &str) {
    if candidate.is_empty() {
        return;
    }
    if current.is_empty() || candidate < current.as_str() {
        *current = candidate.to_string();
    }
}

fn max_results_as_limit(max_results: usize) -> Option<i64> {
    if max_results > 0 {
        Some(max_results as i64)
    } else {
        None
    }
}
