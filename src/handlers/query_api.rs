//! HTTP query surface over the unified query layer.

use axum::extract::{Query, State};
use axum::response::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ApiError;
use crate::model::{AggregatedStat, StatRow};
use crate::store::query::QueryFilter;

use super::AppState;

#[derive(Debug, Deserialize)]
pub struct StatsQueryParams {
    pub level: Option<String>,
    pub logger_regex: Option<String>,
    /// RFC3339 timestamps.
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    #[serde(default)]
    pub max_results: usize,
    #[serde(default = "default_true")]
    pub include_memory: bool,
    #[serde(default = "default_true")]
    pub include_db: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub total: usize,
    /// True when the durable side failed and only live rows are present.
    pub degraded: bool,
    pub stats: Vec<StatRow>,
}

#[derive(Debug, Serialize)]
pub struct AggregatedResponse {
    pub total: usize,
    pub degraded: bool,
    pub stats: Vec<AggregatedStat>,
}

fn parse_time(name: &str, value: Option<&str>) -> Result<Option<DateTime<Utc>>, ApiError> {
    match value {
        None | Some("") => Ok(None),
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|e| ApiError::BadRequest(format!("invalid {name} {raw:?}: {e}"))),
    }
}

fn build_filter(params: &StatsQueryParams) -> Result<QueryFilter, ApiError> {
    Ok(QueryFilter {
        level: params.level.clone().filter(|l| !l.is_empty()),
        logger_regex: params.logger_regex.clone().filter(|p| !p.is_empty()),
        start_time: parse_time("start_time", params.start_time.as_deref())?,
        end_time: parse_time("end_time", params.end_time.as_deref())?,
        max_results: params.max_results,
        include_memory: params.include_memory,
        include_db: params.include_db,
    })
}

/// GET /api/query/stats
pub async fn get_stats(
    State(state): State<AppState>,
    Query(params): Query<StatsQueryParams>,
) -> Result<Json<StatsResponse>, ApiError> {
    let filter = build_filter(&params)?;
    let outcome = state.store.query_stats(&filter).await?;

    info!(
        results = outcome.rows.len(),
        degraded = outcome.degraded,
        level = ?filter.level,
        logger_regex = ?filter.logger_regex,
        "stats query"
    );

    Ok(Json(StatsResponse {
        total: outcome.rows.len(),
        degraded: outcome.degraded,
        stats: outcome.rows,
    }))
}

/// GET /api/query/aggregated
pub async fn get_aggregated(
    State(state): State<AppState>,
    Query(params): Query<StatsQueryParams>,
) -> Result<Json<AggregatedResponse>, ApiError> {
    let filter = build_filter(&params)?;
    let outcome = state.store.query_aggregated(&filter).await?;

    info!(
        results = outcome.rows.len(),
        degraded = outcome.degraded,
        "aggregated query"
    );

    Ok(Json(AggregatedResponse {
        total: outcome.rows.len(),
        degraded: outcome.degraded,
        stats: outcome.rows,
    }))
}

/// GET /api/hub/stats
pub async fn get_hub_stats(State(state): State<AppState>) -> Json<crate::hub::HubStats> {
    Json(state.hub.stats())
}

/// GET /api/db/stats
pub async fn get_db_stats(
    State(state): State<AppState>,
) -> Result<Json<crate::store::db::DatabaseStats>, ApiError> {
    let stats = state.store.sink().database_stats().await?;
    Ok(Json(stats))
}
