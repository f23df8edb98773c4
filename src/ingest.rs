//! TCP ingest: newline-delimited JSON log records from producer hosts.
//!
//! Each line feeds the aggregation store and the fan-out hub. Within one
//! connection records are processed in receive order; across connections
//! the interleaving is arbitrary.

use anyhow::{Context, Result};
use chrono::Utc;
use regex::Regex;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

use crate::hub::Hub;
use crate::model::RawLogEntry;
use crate::store::StatStore;

/// Shared line-processing state for every producer connection.
pub struct LineHandler {
    store: Arc<StatStore>,
    hub: Hub,
    rewrite_timer_loggers: bool,
}

impl LineHandler {
    pub fn new(store: Arc<StatStore>, hub: Hub, rewrite_timer_loggers: bool) -> Self {
        Self {
            store,
            hub,
            rewrite_timer_loggers,
        }
    }

    /// Parse one wire line and feed the store and the hub. Malformed lines
    /// are counted and skipped; nothing here ever fails the connection.
    pub async fn handle_line(&self, line: &str) {
        if line.trim().is_empty() {
            return;
        }

        let Some(record) = parse_wire_line(line) else {
            crate::metrics::record_malformed();
            debug!(line_len = line.len(), "skipping malformed log line");
            return;
        };

        let logger = if self.rewrite_timer_loggers {
            rewrite_timer_logger(&record.logger, &record.message)
        } else {
            record.logger.clone()
        };

        let n = self
            .store
            .ingest(&record.host, &record.level, &logger)
            .await;
        trace!(
            host = %record.host,
            logger = %logger,
            level = %record.level,
            n,
            "record ingested"
        );
        crate::metrics::record_ingest();

        self.hub.try_broadcast(RawLogEntry { logger, ..record });
    }
}

/// Wire format: a JSON object with `level`, `loggerName` and `hostName`;
/// `message` and `stacktrace` are optional and unknown fields are ignored.
/// Non-string scalar values are stringified rather than rejected.
fn parse_wire_line(line: &str) -> Option<RawLogEntry> {
    let value: serde_json::Value = serde_json::from_str(line).ok()?;
    let obj = value.as_object()?;

    let level = required_field(obj, "level")?;
    let logger = required_field(obj, "loggerName")?;
    let host = required_field(obj, "hostName")?;

    Some(RawLogEntry {
        timestamp: Utc::now(),
        host,
        logger,
        level,
        message: optional_field(obj, "message"),
        stack_trace: optional_field(obj, "stacktrace"),
    })
}

fn required_field(
    obj: &serde_json::Map<String, serde_json::Value>,
    key: &str,
) -> Option<String> {
    obj.get(key).map(stringify)
}

fn optional_field(obj: &serde_json::Map<String, serde_json::Value>, key: &str) -> String {
    obj.get(key).map(stringify).unwrap_or_default()
}

fn stringify(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn timed_object_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"timedObjectId=([^\s)]+)").expect("static regex"))
}

/// EJB timer loggers log every timer under one logger name; splitting by
/// timedObjectId makes the per-timer volume visible. `peter` guards against
/// loggers that merely contain the letters t-i-m-e-r.
fn rewrite_timer_logger(logger: &str, message: &str) -> String {
    let lower = logger.to_lowercase();
    if !lower.contains("timer") || lower.contains("peter") {
        return logger.to_string();
    }

    match timed_object_regex()
        .captures(message)
        .and_then(|c| c.get(1))
    {
        Some(id) => format!("{}:{}", logger, id.as_str()),
        None => format!("{}:Unknown", logger),
    }
}

/// Bind and accept producer connections until shutdown. Bind and accept
/// failures are fatal; per-connection errors only end that connection.
pub async fn run_tcp_listener(
    addr: SocketAddr,
    handler: Arc<LineHandler>,
    shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind TCP ingest listener on {addr}"))?;
    run_with_listener(listener, handler, shutdown).await
}

/// Accept loop over an already-bound listener.
pub async fn run_with_listener(
    listener: TcpListener,
    handler: Arc<LineHandler>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "log ingest listener started");
    }

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!("ingest listener stopping");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer) = accepted.context("TCP accept failed")?;
                info!(%peer, "producer connected");
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    handle_connection(stream, peer, handler).await;
                });
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, handler: Arc<LineHandler>) {
    let mut lines = BufReader::new(stream).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => handler.handle_line(&line).await,
            Ok(None) => break,
            Err(e) => {
                warn!(%peer, error = %e, "producer connection error");
                break;
            }
        }
    }

    debug!(%peer, "producer disconnected");
}
