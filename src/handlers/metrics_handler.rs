//! Prometheus text endpoint.
//!
//! Renders the process metrics from the recorder, then appends per-bucket
//! log counters derived from the aggregation store. The bucket section uses
//! the last complete bucket: with two or more buckets visible the
//! second-most-recent, otherwise the only one.

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use chrono::DateTime;
use std::collections::BTreeSet;
use tracing::warn;

use crate::store::query::QueryFilter;
use crate::store::StatStore;

use super::AppState;

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let mut output = state.metrics_handle.render();

    match render_bucket_metrics(&state.store).await {
        Ok(section) => output.push_str(&section),
        Err(e) => {
            warn!(error = %e, "failed to render bucket metrics");
            output.push_str("# bucket metrics unavailable\n");
        }
    }

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        output,
    )
}

async fn render_bucket_metrics(store: &StatStore) -> anyhow::Result<String> {
    let filter = QueryFilter {
        start_time: Some(chrono::Utc::now() - chrono::Duration::hours(1)),
        max_results: 10_000,
        ..QueryFilter::both_sides()
    };
    let outcome = store
        .query_stats(&filter)
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;

    // Newest first thanks to RFC3339 ordering.
    let buckets: BTreeSet<&str> = outcome.rows.iter().map(|r| r.bucket_ts.as_str()).collect();
    let target = match buckets.iter().rev().nth(1).or_else(|| buckets.iter().next_back()) {
        Some(bucket) => *bucket,
        None => return Ok("# no log metrics available\n".to_string()),
    };

    let mut out = String::new();
    out.push_str("# HELP log_messages_total Log messages in the last complete bucket\n");
    out.push_str("# TYPE log_messages_total counter\n");

    for row in outcome.rows.iter().filter(|r| r.bucket_ts == target) {
        out.push_str(&format!(
            "log_messages_total{{host=\"{}\",level=\"{}\",logger=\"{}\"}} {}\n",
            escape_label(&row.hostname),
            escape_label(&row.level),
            escape_label(&row.logger),
            row.n
        ));
    }

    out.push_str("# HELP log_bucket_timestamp_seconds Timestamp of the metrics bucket\n");
    out.push_str("# TYPE log_bucket_timestamp_seconds gauge\n");
    if let Ok(bucket_time) = DateTime::parse_from_rfc3339(target) {
        out.push_str(&format!(
            "log_bucket_timestamp_seconds {}\n",
            bucket_time.timestamp()
        ));
    }

    Ok(out)
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}
