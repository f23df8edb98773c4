use anyhow::{Context, Result};
use axum::{routing::get, Router};
use chrono::Duration as ChronoDuration;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::{
    config::Config,
    handlers::{self, AppState},
    hub::{Hub, HubConfig},
    ingest::{self, LineHandler},
    metrics,
    signals::setup_signal_handlers,
    store::{
        db::DurableSink,
        maintenance::{spawn_retention_task, RetentionConfig},
        StatStore, StoreOptions,
    },
};

/// Start the collector.
///
/// Wires up the aggregation store, the fan-out hub, the TCP ingest
/// listener, the flush and retention timers and the HTTP/WebSocket server,
/// then runs until a termination signal arrives. Shutdown order: stop
/// accepting producers, final flush, close the hub, drain HTTP.
pub async fn start_server(config: Config) -> Result<()> {
    info!("initializing Prometheus metrics");
    let metrics_handle = Arc::new(metrics::init_metrics());

    let (shutdown_tx, signal_handle) = setup_signal_handlers();

    // Durable sink and aggregation store. A database that cannot be
    // initialized is fatal.
    let sink = DurableSink::new(&config.storage.db_path);
    sink.init().await.context("database initialization failed")?;

    let store = Arc::new(StatStore::new(
        sink.clone(),
        StoreOptions {
            bucket_size: ChronoDuration::minutes(i64::from(config.storage.bucket_minutes)),
            utc_buckets: config.storage.utc_buckets,
            retain_on_flush_error: config.storage.retain_on_flush_error,
        },
    ));

    // Fan-out hub.
    let hub = Hub::spawn(
        &HubConfig {
            max_clients: config.hub.max_clients,
            broadcast_capacity: config.hub.broadcast_capacity,
            session_queue_capacity: config.hub.session_queue_capacity,
        },
        shutdown_tx.subscribe(),
    );

    // TCP ingest listener.
    let tcp_addr = SocketAddr::from((
        config.server.host.parse::<std::net::IpAddr>()?,
        config.server.tcp_port,
    ));
    let line_handler = Arc::new(LineHandler::new(
        Arc::clone(&store),
        hub.clone(),
        config.ingest.rewrite_timer_loggers,
    ));
    let ingest_task = tokio::spawn({
        let shutdown_tx = shutdown_tx.clone();
        let shutdown_rx = shutdown_tx.subscribe();
        async move {
            // A dead listener means no more telemetry; treat it as fatal
            // and bring the whole process down cleanly.
            if let Err(e) = ingest::run_tcp_listener(tcp_addr, line_handler, shutdown_rx).await {
                error!(error = %e, "ingest listener failed, shutting down");
                let _ = shutdown_tx.send(());
            }
        }
    });

    // Periodic flush of live counters into the sink.
    let flush_task = spawn_flush_task(
        Arc::clone(&store),
        Duration::from_secs(config.storage.flush_interval_secs),
        shutdown_tx.subscribe(),
    );

    // Retention worker, first pass immediately.
    let retention_task = spawn_retention_task(
        Arc::new(sink),
        RetentionConfig {
            days: config.retention.days,
            interval: Duration::from_secs(config.retention.interval_hours * 3600),
            vacuum: config.retention.vacuum,
        },
        shutdown_tx.subscribe(),
    );

    // HTTP server: query API, WebSocket subscribers, metrics.
    let state = AppState {
        store: Arc::clone(&store),
        hub,
        metrics_handle,
    };
    let app = create_router(state);

    let http_addr = SocketAddr::from((
        config.server.host.parse::<std::net::IpAddr>()?,
        config.server.http_port,
    ));
    let listener = tokio::net::TcpListener::bind(http_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {http_addr}"))?;

    info!(tcp = %tcp_addr, http = %http_addr, bucket_minutes = config.storage.bucket_minutes, "collector started");

    let mut shutdown_rx = shutdown_tx.subscribe();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
            info!("shutdown signal received, draining connections");
        })
        .await?;

    // Producers are gone; persist whatever is still live.
    store.print_summary().await;
    if let Err(e) = store.flush().await {
        error!(error = %e, "final flush failed");
    }

    for (name, task) in [
        ("ingest", ingest_task),
        ("flush", flush_task),
        ("retention", retention_task),
    ] {
        match task.await {
            Ok(_) => {}
            Err(e) if e.is_cancelled() => {}
            Err(e) => error!(task = name, error = %e, "background task panicked"),
        }
    }
    signal_handle.await.ok();

    info!("collector stopped");
    Ok(())
}

fn spawn_flush_task(
    store: Arc<StatStore>,
    interval: Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        timer.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.recv() => return,
                _ = timer.tick() => {
                    if let Err(e) = store.flush().await {
                        error!(error = %e, "periodic flush failed");
                    }
                }
            }
        }
    })
}

/// Build the axum router with every route and middleware.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/metrics", get(handlers::metrics_handler::metrics))
        .route("/ws", get(handlers::ws::ws_handler))
        .route("/api/query/stats", get(handlers::query_api::get_stats))
        .route(
            "/api/query/aggregated",
            get(handlers::query_api::get_aggregated),
        )
        .route("/api/hub/stats", get(handlers::query_api::get_hub_stats))
        .route("/api/db/stats", get(handlers::query_api::get_db_stats))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
