//! Lineage log: one append-only record per load attempt

use crate::error::{IngestError, Result};
use crate::store::timestamp_text;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadMode {
    /// Discard every stored row, then insert the batch
    Lifetime,
    /// Replace only the rows whose grain keys appear in the batch
    Incremental,
}

impl LoadMode {
    pub fn as_str(self) -> &'static str {
        match self {
            LoadMode::Lifetime => "lifetime",
            LoadMode::Incremental => "incremental",
        }
    }
}

impl std::fmt::Display for LoadMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LoadMode {
    type Err = IngestError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "lifetime" => Ok(LoadMode::Lifetime),
            "incremental" => Ok(LoadMode::Incremental),
            other => Err(IngestError::config(format!("unknown load mode '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineageRecord {
    pub run_id: Uuid,
    pub source: String,
    pub table_name: String,
    pub mode: LoadMode,
    pub rows_in: i64,
    pub rows_before: i64,
    pub rows_after: i64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub error: Option<String>,
}

impl LineageRecord {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Clone)]
pub struct LineageLog {
    pool: SqlitePool,
}

impl LineageLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn append(&self, record: &LineageRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO _lineage (run_id, source, table_name, mode, rows_in, rows_before,
                                  rows_after, started_at, finished_at, error)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(record.run_id.to_string())
        .bind(&record.source)
        .bind(&record.table_name)
        .bind(record.mode.as_str())
        .bind(record.rows_in)
        .bind(record.rows_before)
        .bind(record.rows_after)
        .bind(timestamp_text(&record.started_at))
        .bind(timestamp_text(&record.finished_at))
        .bind(record.error.as_deref())
        .execute(&self.pool)
        .await?;

        info!(
            run_id = %record.run_id,
            table = %record.table_name,
            mode = %record.mode,
            rows_before = record.rows_before,
            rows_after = record.rows_after,
            error = record.error.as_deref().unwrap_or(""),
            "Lineage recorded"
        );
        Ok(())
    }

    /// Most recent records first
    pub async fn recent(&self, limit: i64) -> Result<Vec<LineageRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT run_id, source, table_name, mode, rows_in, rows_before, rows_after,
                   started_at, finished_at, error
            FROM _lineage
            ORDER BY id DESC
            LIMIT ?1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(decode).collect()
    }

    pub async fn for_run(&self, run_id: Uuid) -> Result<Vec<LineageRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT run_id, source, table_name, mode, rows_in, rows_before, rows_after,
                   started_at, finished_at, error
            FROM _lineage
            WHERE run_id = ?1
            ORDER BY id
            "#,
        )
        .bind(run_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(decode).collect()
    }
}

fn decode(row: &SqliteRow) -> Result<LineageRecord> {
    let run_id: String = row.get("run_id");
    let mode: String = row.get("mode");
    let started_at: String = row.get("started_at");
    let finished_at: String = row.get("finished_at");

    Ok(LineageRecord {
        run_id: Uuid::parse_str(&run_id)
            .map_err(|e| IngestError::config(format!("corrupt lineage run id: {}", e)))?,
        source: row.get("source"),
        table_name: row.get("table_name"),
        mode: mode.parse()?,
        rows_in: row.get("rows_in"),
        rows_before: row.get("rows_before"),
        rows_after: row.get("rows_after"),
        started_at: parse_ts(&started_at)?,
        finished_at: parse_ts(&finished_at)?,
        error: row.get("error"),
    })
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| IngestError::config(format!("corrupt lineage timestamp '{}': {}", s, e)))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::store::Warehouse;

    fn record(run_id: Uuid, table: &str, error: Option<&str>) -> LineageRecord {
        let now = Utc::now();
        LineageRecord {
            run_id,
            source: "gads".to_string(),
            table_name: table.to_string(),
            mode: LoadMode::Incremental,
            rows_in: 3,
            rows_before: 10,
            rows_after: 12,
            started_at: now,
            finished_at: now,
            error: error.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_append_and_read_back() {
        let warehouse = Warehouse::in_memory().await.unwrap();
        let log = LineageLog::new(warehouse.pool().clone());
        let run = Uuid::new_v4();

        log.append(&record(run, "gads_campaigns", None)).await.unwrap();
        log.append(&record(run, "gads_keywords", Some("disk full"))).await.unwrap();
        log.append(&record(Uuid::new_v4(), "meta_ads", None)).await.unwrap();

        let recent = log.recent(2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].table_name, "meta_ads");

        let run_records = log.for_run(run).await.unwrap();
        assert_eq!(run_records.len(), 2);
        assert!(run_records[0].succeeded());
        assert_eq!(run_records[1].error.as_deref(), Some("disk full"));
        assert_eq!(run_records[1].mode, LoadMode::Incremental);
    }
}
