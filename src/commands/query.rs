//! The `query` command: inspect persisted statistics.
//!
//! With `--url` the command asks a running collector over HTTP, which
//! includes the live in-memory counters. Without it the SQLite file from
//! the configuration is read directly.

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use std::path::Path;

use crate::config;
use crate::model::{AggregatedStat, StatRow};
use crate::store::db::DurableSink;
use crate::store::query::regex_to_like;

#[derive(Debug, Clone, Parser)]
pub struct QueryArgs {
    /// Filter by log level (ERROR, WARN, INFO, ...)
    #[arg(short, long)]
    pub level: Option<String>,

    /// Regex to match logger names
    #[arg(short = 'g', long = "logger")]
    pub logger: Option<String>,

    /// Only buckets at or after this RFC3339 timestamp
    #[arg(long)]
    pub start_time: Option<String>,

    /// Only buckets at or before this RFC3339 timestamp
    #[arg(long)]
    pub end_time: Option<String>,

    /// Maximum number of results
    #[arg(long, default_value = "100")]
    pub max_results: usize,

    /// Aggregate by (host, bucket, level) instead of listing rows
    #[arg(short, long)]
    pub aggregated: bool,

    /// Base URL of a running collector (e.g. http://127.0.0.1:3000);
    /// queried over HTTP so live counters are included
    #[arg(short, long)]
    pub url: Option<String>,

    /// Output format (text, json)
    #[arg(short = 'f', long, default_value = "text")]
    pub format: String,
}

pub async fn execute(config_path: &Path, args: QueryArgs) -> Result<()> {
    if let Some(url) = &args.url {
        query_over_http(url, &args).await
    } else {
        query_database(config_path, &args).await
    }
}

async fn query_over_http(base_url: &str, args: &QueryArgs) -> Result<()> {
    let endpoint = if args.aggregated {
        "/api/query/aggregated"
    } else {
        "/api/query/stats"
    };

    let mut request = reqwest::Client::new()
        .get(format!("{}{}", base_url.trim_end_matches('/'), endpoint))
        .query(&[("max_results", args.max_results.to_string())]);
    if let Some(level) = &args.level {
        request = request.query(&[("level", level)]);
    }
    if let Some(logger) = &args.logger {
        request = request.query(&[("logger_regex", logger)]);
    }
    if let Some(start) = &args.start_time {
        request = request.query(&[("start_time", start)]);
    }
    if let Some(end) = &args.end_time {
        request = request.query(&[("end_time", end)]);
    }

    let response = request.send().await.context("query request failed")?;
    let status = response.status();
    let body: serde_json::Value = response.json().await.context("invalid query response")?;

    if !status.is_success() {
        anyhow::bail!("collector returned {}: {}", status, body);
    }

    if body["degraded"].as_bool() == Some(true) {
        eprintln!("{}", "warning: durable side unavailable, live rows only".yellow());
    }

    if args.format == "json" {
        println!("{}", serde_json::to_string_pretty(&body["stats"])?);
        return Ok(());
    }

    if args.aggregated {
        let stats: Vec<AggregatedStat> = serde_json::from_value(body["stats"].clone())?;
        display_aggregated(&stats);
    } else {
        let stats: Vec<StatRow> = serde_json::from_value(body["stats"].clone())?;
        display_rows(&stats);
    }

    Ok(())
}

async fn query_database(config_path: &Path, args: &QueryArgs) -> Result<()> {
    let cfg = config::load_config(config_path)?;
    let sink = DurableSink::new(&cfg.storage.db_path);

    let like = args.logger.as_deref().map(regex_to_like);
    let limit = if args.max_results > 0 {
        Some(args.max_results as i64)
    } else {
        None
    };

    if args.aggregated {
        let stats = sink
            .select_aggregated(
                args.level.as_deref(),
                like.as_deref(),
                args.start_time.as_deref(),
                args.end_time.as_deref(),
            )
            .await?;
        if args.format == "json" {
            println!("{}", serde_json::to_string_pretty(&stats)?);
        } else {
            display_aggregated(&stats);
        }
    } else {
        let stats = sink
            .select_rows(
                args.level.as_deref(),
                like.as_deref(),
                args.start_time.as_deref(),
                args.end_time.as_deref(),
                limit,
            )
            .await?;
        if args.format == "json" {
            println!("{}", serde_json::to_string_pretty(&stats)?);
        } else {
            display_rows(&stats);
        }
    }

    Ok(())
}

fn colorize_level(level: &str) -> colored::ColoredString {
    match level {
        "ERROR" | "FATAL" => level.red().bold(),
        "WARN" => level.yellow().bold(),
        "INFO" => level.green(),
        "DEBUG" => level.blue(),
        _ => level.normal(),
    }
}

fn display_rows(stats: &[StatRow]) {
    if stats.is_empty() {
        println!("{}", "No statistics found matching the criteria".yellow());
        return;
    }

    println!("{}", format!("Found {} counter rows", stats.len()).bold());
    println!();
    for row in stats {
        println!(
            "{} {} {:<8} {} {}",
            row.bucket_ts.dimmed(),
            row.hostname.cyan(),
            colorize_level(&row.level),
            row.logger,
            format!("n={}", row.n).bold()
        );
    }
}

fn display_aggregated(stats: &[AggregatedStat]) {
    if stats.is_empty() {
        println!("{}", "No statistics found matching the criteria".yellow());
        return;
    }

    println!("{}", format!("Found {} aggregate cells", stats.len()).bold());
    println!();
    for agg in stats {
        println!(
            "{} {} {:<8} {} {}",
            agg.bucket_ts.dimmed(),
            agg.hostname.cyan(),
            colorize_level(&agg.level),
            format!("total={}", agg.total_count).bold(),
            format!("loggers={}", agg.logger_count).dimmed()
        );
    }
}
