// =============================================================================
// Run history store — append-only audit trail of rebalance cycles
// =============================================================================
//
// One row per cycle, keyed by a unique run id and indexed by timestamp for
// newest-first listings. Trades, errors, and projected balances are stored as
// JSON columns. Timestamps are written as RFC 3339 UTC; naive values found in
// legacy rows are re-stamped as UTC on read.
// =============================================================================

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use rust_decimal::prelude::ToPrimitive;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use crate::error::{RebalancerError, Result};
use crate::types::{ProjectedBalance, ProposedTrade, RebalanceReport, RunStatus};

/// Default page size for newest-first listings.
pub const DEFAULT_LIST_LIMIT: u32 = 100;

const CREATE_TABLE: &str = "\
CREATE TABLE IF NOT EXISTS rebalance_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL UNIQUE,
    timestamp TEXT NOT NULL,
    status TEXT NOT NULL,
    is_dry_run INTEGER NOT NULL,
    total_value_usd_before REAL,
    total_value_usd_after REAL,
    total_fees_usd REAL,
    summary_message TEXT NOT NULL,
    trades TEXT,
    errors TEXT,
    projected_balances TEXT
)";

const CREATE_TIMESTAMP_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_rebalance_runs_timestamp ON rebalance_runs (timestamp)";

/// One persisted rebalance cycle.
#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub id: i64,
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub status: RunStatus,
    pub is_dry_run: bool,
    pub total_value_usd_before: Option<f64>,
    pub total_value_usd_after: Option<f64>,
    pub total_fees_usd: Option<f64>,
    pub summary_message: String,
    pub trades: Vec<ProposedTrade>,
    pub errors: Vec<String>,
    pub projected_balances: BTreeMap<String, ProjectedBalance>,
}

/// One point of the portfolio time series.
#[derive(Debug, Clone, Serialize)]
pub struct TimeSeriesPoint {
    pub timestamp: DateTime<Utc>,
    pub total_value_usd: Option<f64>,
    pub assets: BTreeMap<String, ProjectedBalance>,
}

/// SQLite-backed history store. Cloning shares the connection pool.
#[derive(Clone)]
pub struct HistoryStore {
    pool: SqlitePool,
}

impl HistoryStore {
    /// Open (creating if missing) the history database at `db_path`.
    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                RebalancerError::Unexpected(format!(
                    "failed to create data directory {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        info!(path = %db_path.display(), "history store opened");
        Ok(store)
    }

    /// In-memory store for tests. A single connection keeps the database
    /// alive for the pool's lifetime.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(CREATE_TABLE).execute(&self.pool).await?;
        sqlx::query(CREATE_TIMESTAMP_INDEX)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Append one cycle row. `run_id` uniqueness is enforced by the schema.
    pub async fn insert(&self, report: &RebalanceReport) -> Result<()> {
        let trades = serde_json::to_string(&report.trades)
            .map_err(|e| RebalancerError::Unexpected(format!("failed to serialise trades: {e}")))?;
        let errors = serde_json::to_string(&report.errors)
            .map_err(|e| RebalancerError::Unexpected(format!("failed to serialise errors: {e}")))?;
        let projected = serde_json::to_string(&report.projected_balances).map_err(|e| {
            RebalancerError::Unexpected(format!("failed to serialise projections: {e}"))
        })?;

        sqlx::query(
            "INSERT INTO rebalance_runs (
                run_id, timestamp, status, is_dry_run,
                total_value_usd_before, total_value_usd_after, total_fees_usd,
                summary_message, trades, errors, projected_balances
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        )
        .bind(&report.run_id)
        .bind(
            report
                .timestamp
                .to_rfc3339_opts(SecondsFormat::Micros, true),
        )
        .bind(report.status.to_string())
        .bind(report.is_dry_run)
        .bind(report.total_value_usd_before.and_then(|d| d.to_f64()))
        .bind(report.total_value_usd_after.and_then(|d| d.to_f64()))
        .bind(report.total_fees_usd.to_f64())
        .bind(&report.message)
        .bind(trades)
        .bind(errors)
        .bind(projected)
        .execute(&self.pool)
        .await?;

        debug!(run_id = %report.run_id, status = %report.status, "history row written");
        Ok(())
    }

    /// The most recent cycle, if any.
    pub async fn latest(&self) -> Result<Option<RunRecord>> {
        let row = sqlx::query(
            "SELECT * FROM rebalance_runs ORDER BY timestamp DESC, id DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| record_from_row(&r)).transpose()
    }

    /// Newest-first listing. `limit` defaults to [`DEFAULT_LIST_LIMIT`].
    pub async fn list(&self, limit: Option<u32>) -> Result<Vec<RunRecord>> {
        let limit = limit.unwrap_or(DEFAULT_LIST_LIMIT);
        let rows = sqlx::query(
            "SELECT * FROM rebalance_runs ORDER BY timestamp DESC, id DESC LIMIT ?1",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    /// Oldest-first series of portfolio totals and per-asset projections,
    /// one point per cycle.
    pub async fn time_series(&self) -> Result<Vec<TimeSeriesPoint>> {
        let rows = sqlx::query(
            "SELECT timestamp, total_value_usd_before, total_value_usd_after,
                    projected_balances
             FROM rebalance_runs ORDER BY timestamp ASC, id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut points = Vec::with_capacity(rows.len());
        for row in &rows {
            let timestamp = parse_utc(&row.get::<String, _>("timestamp"))?;
            let after: Option<f64> = row.get("total_value_usd_after");
            let before: Option<f64> = row.get("total_value_usd_before");
            let assets = row
                .get::<Option<String>, _>("projected_balances")
                .and_then(|json| serde_json::from_str(&json).ok())
                .unwrap_or_default();
            points.push(TimeSeriesPoint {
                timestamp,
                total_value_usd: after.or(before),
                assets,
            });
        }
        Ok(points)
    }
}

impl std::fmt::Debug for HistoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryStore").finish()
    }
}

fn record_from_row(row: &SqliteRow) -> Result<RunRecord> {
    let status_raw: String = row.get("status");
    let status = status_raw
        .parse::<RunStatus>()
        .map_err(RebalancerError::Unexpected)?;

    let trades = row
        .get::<Option<String>, _>("trades")
        .and_then(|json| serde_json::from_str(&json).ok())
        .unwrap_or_default();
    let errors = row
        .get::<Option<String>, _>("errors")
        .and_then(|json| serde_json::from_str(&json).ok())
        .unwrap_or_default();
    let projected_balances = row
        .get::<Option<String>, _>("projected_balances")
        .and_then(|json| serde_json::from_str(&json).ok())
        .unwrap_or_default();

    Ok(RunRecord {
        id: row.get("id"),
        run_id: row.get("run_id"),
        timestamp: parse_utc(&row.get::<String, _>("timestamp"))?,
        status,
        is_dry_run: row.get("is_dry_run"),
        total_value_usd_before: row.get("total_value_usd_before"),
        total_value_usd_after: row.get("total_value_usd_after"),
        total_fees_usd: row.get("total_fees_usd"),
        summary_message: row.get("summary_message"),
        trades,
        errors,
        projected_balances,
    })
}

/// Parse a stored timestamp, re-stamping naive legacy values as UTC.
fn parse_utc(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(naive.and_utc());
        }
    }
    Err(RebalancerError::Unexpected(format!(
        "unparseable timestamp in history row: {raw:?}"
    )))
}
