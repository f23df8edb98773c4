//! Operational Prometheus metrics for the collector itself.
//!
//! These cover the process (ingest volume, drops, flush timing); the
//! per-bucket log counters exposed on `/metrics` are rendered separately
//! from the aggregation store.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Install the Prometheus recorder. Call once at server startup.
pub fn init_metrics() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    init_metric_descriptions();

    handle
}

fn init_metric_descriptions() {
    describe_counter!(
        "ingest_records_total",
        "Log records accepted from TCP producers"
    );
    describe_counter!(
        "ingest_malformed_total",
        "Lines skipped because they were not valid log records"
    );
    describe_counter!(
        "hub_broadcast_drops_total",
        "Records dropped because the hub broadcast channel was full"
    );
    describe_counter!(
        "session_drops_total",
        "Messages dropped per session enforcement point"
    );
    describe_counter!("store_flush_rows_total", "Counter rows written by flushes");
    describe_histogram!(
        "store_flush_duration_seconds",
        "Wall time of flush transactions"
    );
    describe_gauge!("collector_info", "Collector version information");

    gauge!("collector_info", "version" => env!("CARGO_PKG_VERSION")).set(1.0);
}

pub fn record_ingest() {
    counter!("ingest_records_total").increment(1);
}

pub fn record_malformed() {
    counter!("ingest_malformed_total").increment(1);
}

pub fn record_broadcast_drop() {
    counter!("hub_broadcast_drops_total").increment(1);
}

/// `point` is the enforcement point: "rate" or "queue".
pub fn record_session_drop(point: &'static str) {
    counter!("session_drops_total", "point" => point).increment(1);
}

pub fn record_flush(rows: usize, duration: Duration) {
    counter!("store_flush_rows_total").increment(rows as u64);
    histogram!("store_flush_duration_seconds").record(duration.as_secs_f64());
}
