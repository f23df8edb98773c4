//! SQLite persistence for bucket counters.
//!
//! Every operation opens its own connection, applies the pragmas and closes
//! on exit. The sink is write-heavy in bursts (one transaction per flush)
//! and read-medium-latency (dashboard queries); WAL journaling fits that
//! profile, and the `bucket_ts` index keeps range queries and retention
//! deletes fast.

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteJournalMode};
use sqlx::{ConnectOptions, Connection, Row};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::model::StatRow;

const UPSERT_SQL: &str = "\
INSERT INTO log_stats (hostname, bucket_ts, bucket_duration_s, level, logger, n, first_seen_ts)
VALUES (?, ?, ?, ?, ?, ?, ?)
ON CONFLICT(hostname, bucket_ts, level, logger)
DO UPDATE SET
    n = log_stats.n + excluded.n,
    bucket_duration_s = excluded.bucket_duration_s,
    first_seen_ts = CASE
        WHEN log_stats.first_seen_ts = '' THEN excluded.first_seen_ts
        WHEN excluded.first_seen_ts = '' THEN log_stats.first_seen_ts
        WHEN log_stats.first_seen_ts < excluded.first_seen_ts THEN log_stats.first_seen_ts
        ELSE excluded.first_seen_ts
    END";

const SELECT_COLUMNS: &str =
    "id, hostname, bucket_ts, bucket_duration_s, level, logger, n, first_seen_ts";

/// Counts and sizes reported by [`DurableSink::database_stats`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct DatabaseStats {
    pub total_rows: i64,
    pub oldest_bucket: Option<String>,
    pub newest_bucket: Option<String>,
    pub db_size_mb: f64,
    pub unique_hosts: i64,
}

/// Handle on the SQLite file. Cheap to clone; holds no open connection.
#[derive(Debug, Clone)]
pub struct DurableSink {
    path: PathBuf,
}

impl DurableSink {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn connect(&self) -> Result<SqliteConnection> {
        let options = SqliteConnectOptions::new()
            .filename(&self.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .pragma("synchronous", "NORMAL")
            .pragma("cache_size", "-64000")
            .pragma("temp_store", "memory");

        options
            .connect()
            .await
            .with_context(|| format!("failed to open database {}", self.path.display()))
    }

    /// Create the table and index if missing. Called once at startup;
    /// failure here is fatal to the process.
    pub async fn init(&self) -> Result<()> {
        let mut conn = self.connect().await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS log_stats (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                hostname TEXT NOT NULL,
                bucket_ts TEXT NOT NULL,
                bucket_duration_s INTEGER NOT NULL,
                level TEXT NOT NULL,
                logger TEXT NOT NULL,
                n INTEGER NOT NULL,
                first_seen_ts TEXT NOT NULL DEFAULT '',
                UNIQUE(hostname, bucket_ts, level, logger)
            )",
        )
        .execute(&mut conn)
        .await
        .context("failed to create log_stats table")?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_bucket_ts ON log_stats(bucket_ts)")
            .execute(&mut conn)
            .await
            .context("failed to create bucket_ts index")?;

        conn.close().await.ok();
        Ok(())
    }

    /// Upsert every row inside a single transaction. Conflicting rows sum
    /// their counts, take the freshest duration and keep the earliest
    /// non-empty first_seen.
    pub async fn upsert_rows(&self, rows: &[StatRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut conn = self.connect().await?;
        let mut tx = conn.begin().await.context("failed to begin transaction")?;

        for row in rows {
            sqlx::query(UPSERT_SQL)
                .bind(&row.hostname)
                .bind(&row.bucket_ts)
                .bind(row.bucket_duration_s)
                .bind(&row.level)
                .bind(&row.logger)
                .bind(row.n)
                .bind(&row.first_seen_ts)
                .execute(&mut *tx)
                .await
                .context("failed to upsert counter row")?;
        }

        tx.commit().await.context("failed to commit flush")?;
        conn.close().await.ok();
        Ok(())
    }

    /// Select rows matching the given SQL-level filters, newest bucket first.
    pub async fn select_rows(
        &self,
        level: Option<&str>,
        logger_like: Option<&str>,
        start_ts: Option<&str>,
        end_ts: Option<&str>,
        limit: Option<i64>,
    ) -> Result<Vec<StatRow>> {
        let mut sql = format!("SELECT {SELECT_COLUMNS} FROM log_stats WHERE 1=1");
        let mut args: Vec<String> = Vec::new();

        if let Some(level) = level {
            sql.push_str(" AND level = ?");
            args.push(level.to_string());
        }
        if let Some(pattern) = logger_like {
            sql.push_str(" AND logger LIKE ?");
            args.push(pattern.to_string());
        }
        if let Some(start) = start_ts {
            sql.push_str(" AND bucket_ts >= ?");
            args.push(start.to_string());
        }
        if let Some(end) = end_ts {
            sql.push_str(" AND bucket_ts <= ?");
            args.push(end.to_string());
        }

        sql.push_str(" ORDER BY bucket_ts DESC");
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let mut conn = self.connect().await?;
        let mut query = sqlx::query(&sql);
        for arg in &args {
            query = query.bind(arg);
        }

        let rows = query
            .fetch_all(&mut conn)
            .await
            .context("failed to query log_stats")?;
        conn.close().await.ok();

        Ok(rows
            .into_iter()
            .map(|row| StatRow {
                id: row.get("id"),
                hostname: row.get("hostname"),
                bucket_ts: row.get("bucket_ts"),
                bucket_duration_s: row.get("bucket_duration_s"),
                level: row.get("level"),
                logger: row.get("logger"),
                n: row.get("n"),
                first_seen_ts: row.get("first_seen_ts"),
            })
            .collect())
    }

    /// Aggregate by (hostname, bucket_ts, level) in SQL.
    pub async fn select_aggregated(
        &self,
        level: Option<&str>,
        logger_like: Option<&str>,
        start_ts: Option<&str>,
        end_ts: Option<&str>,
    ) -> Result<Vec<crate::model::AggregatedStat>> {
        let mut sql = String::from(
            "SELECT hostname, bucket_ts, level,
                    SUM(n) AS total_count,
                    COUNT(DISTINCT logger) AS logger_count,
                    COALESCE(MIN(NULLIF(first_seen_ts, '')), '') AS first_seen_ts
             FROM log_stats WHERE 1=1",
        );
        let mut args: Vec<String> = Vec::new();

        if let Some(level) = level {
            sql.push_str(" AND level = ?");
            args.push(level.to_string());
        }
        if let Some(pattern) = logger_like {
            sql.push_str(" AND logger LIKE ?");
            args.push(pattern.to_string());
        }
        if let Some(start) = start_ts {
            sql.push_str(" AND bucket_ts >= ?");
            args.push(start.to_string());
        }
        if let Some(end) = end_ts {
            sql.push_str(" AND bucket_ts <= ?");
            args.push(end.to_string());
        }

        sql.push_str(" GROUP BY hostname, bucket_ts, level ORDER BY bucket_ts DESC");

        let mut conn = self.connect().await?;
        let mut query = sqlx::query(&sql);
        for arg in &args {
            query = query.bind(arg);
        }

        let rows = query
            .fetch_all(&mut conn)
            .await
            .context("failed to query aggregated stats")?;
        conn.close().await.ok();

        Ok(rows
            .into_iter()
            .map(|row| crate::model::AggregatedStat {
                hostname: row.get("hostname"),
                bucket_ts: row.get("bucket_ts"),
                level: row.get("level"),
                total_count: row.get("total_count"),
                logger_count: row.get("logger_count"),
                first_seen_ts: row.get("first_seen_ts"),
            })
            .collect())
    }

    /// Delete rows with a bucket older than `cutoff_ts`. Returns the number
    /// of rows removed.
    pub async fn delete_older_than(&self, cutoff_ts: &str) -> Result<u64> {
        let mut conn = self.connect().await?;
        let result = sqlx::query("DELETE FROM log_stats WHERE bucket_ts < ?")
            .bind(cutoff_ts)
            .execute(&mut conn)
            .await
            .context("failed to delete expired rows")?;
        conn.close().await.ok();
        Ok(result.rows_affected())
    }

    /// Reclaim file space after deletes.
    pub async fn vacuum(&self) -> Result<()> {
        let mut conn = self.connect().await?;
        sqlx::query("VACUUM")
            .execute(&mut conn)
            .await
            .context("failed to vacuum database")?;
        conn.close().await.ok();
        Ok(())
    }

    pub async fn database_stats(&self) -> Result<DatabaseStats> {
        let mut conn = self.connect().await?;

        let total_rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM log_stats")
            .fetch_one(&mut conn)
            .await?;

        let range = sqlx::query("SELECT MIN(bucket_ts) AS oldest, MAX(bucket_ts) AS newest FROM log_stats")
            .fetch_one(&mut conn)
            .await?;
        let oldest_bucket: Option<String> = range.get("oldest");
        let newest_bucket: Option<String> = range.get("newest");

        let page_count: i64 = sqlx::query_scalar("PRAGMA page_count")
            .fetch_one(&mut conn)
            .await?;
        let page_size: i64 = sqlx::query_scalar("PRAGMA page_size")
            .fetch_one(&mut conn)
            .await?;

        let unique_hosts: i64 = sqlx::query_scalar("SELECT COUNT(DISTINCT hostname) FROM log_stats")
            .fetch_one(&mut conn)
            .await?;

        conn.close().await.ok();

        Ok(DatabaseStats {
            total_rows,
            oldest_bucket,
            newest_bucket,
            db_size_mb: (page_count * page_size) as f64 / (1024.0 * 1024.0),
            unique_hosts,
        })
    }
}
