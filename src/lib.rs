pub mod bucket;
pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod handlers;
pub mod hub;
pub mod ingest;
pub mod metrics;
pub mod model;
pub mod server;
pub mod signals;
pub mod store;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize tracing/logging.
///
/// `RUST_LOG` wins when set; otherwise `default_level` applies. Can only be
/// called once per process.
pub fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .init();
}
