//! Upsert engine
//!
//! Merges one typed batch into its raw table inside a single transaction:
//!
//! - lifetime: delete every row, insert the batch
//! - incremental: delete rows whose grain tuple appears in the batch, insert
//!   the batch
//!
//! Rows are never updated in place. Duplicate grain tuples inside one batch are
//! inserted as they are; the validator is what reports them.

use crate::error::{IngestError, Result};
use crate::grain::{Grain, GrainRegistry};
use crate::lineage::{LineageLog, LineageRecord, LoadMode};
use crate::normalize::Batch;
use crate::schema::{Row, TableSchema, Value};
use crate::store::{self, push_value, quote_ident, Warehouse};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteConnection;
use sqlx::{QueryBuilder, Sqlite};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// SQLite's default host-parameter ceiling is 32766; stay below it.
const MAX_BINDS_PER_STATEMENT: usize = 30_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LoadResult {
    pub rows_in: i64,
    pub rows_before: i64,
    pub rows_after: i64,
    /// Stored rows removed before the insert
    pub deleted: i64,
}

pub struct UpsertEngine {
    warehouse: Warehouse,
    registry: Arc<GrainRegistry>,
    lineage: LineageLog,
}

impl UpsertEngine {
    pub fn new(warehouse: Warehouse, registry: Arc<GrainRegistry>) -> Self {
        let lineage = LineageLog::new(warehouse.pool().clone());
        Self {
            warehouse,
            registry,
            lineage,
        }
    }

    /// Load `batch` into `batch.table`. Appends one lineage record whatever the
    /// outcome, tagged with `run_id`.
    #[instrument(skip(self, batch), fields(table = %batch.table, rows = batch.len(), mode = %mode))]
    pub async fn load(&self, run_id: Uuid, batch: &Batch, mode: LoadMode) -> Result<LoadResult> {
        let started_at = Utc::now();

        let outcome = match self.registry.lookup(&batch.table) {
            Err(e) => Err(e),
            Ok(_) if batch.is_empty() && mode == LoadMode::Incremental => {
                warn!(table = %batch.table, "Empty batch, nothing to load");
                self.count_existing(&batch.table).await.map(|n| LoadResult {
                    rows_in: 0,
                    rows_before: n,
                    rows_after: n,
                    deleted: 0,
                })
            },
            Ok(_) if batch.is_empty() => {
                warn!(table = %batch.table, "Empty lifetime batch, clearing table");
                self.clear_in_transaction(&batch.table).await
            },
            Ok(grain) => self.load_in_transaction(batch, grain, mode).await,
        };

        match &outcome {
            Ok(r) => {
                let record = self.lineage_record(run_id, &batch.source, &batch.table, mode, started_at);
                self.append_lineage(LineageRecord {
                    rows_in: batch.len() as i64,
                    rows_before: r.rows_before,
                    rows_after: r.rows_after,
                    ..record
                })
                .await;
            },
            Err(e) => {
                // The transaction rolled back, so the table still holds what it had.
                self.record_failure(run_id, &batch.source, &batch.table, mode, started_at, batch.len(), e)
                    .await;
            },
        }

        let result = outcome?;
        info!(
            table = %batch.table,
            mode = %mode,
            rows_in = result.rows_in,
            deleted = result.deleted,
            rows_before = result.rows_before,
            rows_after = result.rows_after,
            "Batch loaded"
        );
        Ok(result)
    }

    /// Append a failed lineage record for a load that never committed.
    ///
    /// Covers attempts rejected before reaching the engine (extraction or
    /// normalization) as well as rolled-back transactions. Both row counts are
    /// the table's current size.
    #[allow(clippy::too_many_arguments)]
    pub async fn record_failure(
        &self,
        run_id: Uuid,
        source: &str,
        table: &str,
        mode: LoadMode,
        started_at: DateTime<Utc>,
        rows_in: usize,
        error: &IngestError,
    ) {
        let n = self.count_existing(table).await.unwrap_or(0);
        let record = self.lineage_record(run_id, source, table, mode, started_at);
        self.append_lineage(LineageRecord {
            rows_in: rows_in as i64,
            rows_before: n,
            rows_after: n,
            error: Some(error.to_string()),
            ..record
        })
        .await;
    }

    fn lineage_record(
        &self,
        run_id: Uuid,
        source: &str,
        table: &str,
        mode: LoadMode,
        started_at: DateTime<Utc>,
    ) -> LineageRecord {
        LineageRecord {
            run_id,
            source: source.to_string(),
            table_name: table.to_string(),
            mode,
            rows_in: 0,
            rows_before: 0,
            rows_after: 0,
            started_at,
            finished_at: Utc::now(),
            error: None,
        }
    }

    async fn append_lineage(&self, record: LineageRecord) {
        if let Err(e) = self.lineage.append(&record).await {
            warn!(error = %e, table = %record.table_name, "Failed to append lineage record");
        }
    }

    /// Current row count of `table`, 0 when it does not exist yet
    pub async fn count_existing(&self, table: &str) -> Result<i64> {
        if self.warehouse.table_exists(table).await? {
            self.warehouse.row_count(table).await
        } else {
            Ok(0)
        }
    }

    /// Lifetime load of nothing: the table ends up empty. A table that was
    /// never created stays absent, since an empty batch has no schema to create.
    async fn clear_in_transaction(&self, table: &str) -> Result<LoadResult> {
        let mut tx = self.warehouse.pool().begin().await?;

        if !store::object_exists(&mut tx, "table", table).await? {
            return Ok(LoadResult {
                rows_in: 0,
                rows_before: 0,
                rows_after: 0,
                deleted: 0,
            });
        }

        let rows_before = store::row_count(&mut tx, table).await?;
        let sql = format!("DELETE FROM {}", quote_ident(table));
        let deleted = sqlx::query(&sql).execute(&mut *tx).await?.rows_affected() as i64;
        let rows_after = store::row_count(&mut tx, table).await?;
        tx.commit().await?;

        Ok(LoadResult {
            rows_in: 0,
            rows_before,
            rows_after,
            deleted,
        })
    }

    async fn load_in_transaction(
        &self,
        batch: &Batch,
        grain: &Grain,
        mode: LoadMode,
    ) -> Result<LoadResult> {
        let mut tx = self.warehouse.pool().begin().await?;

        ensure_table(&mut tx, &batch.table, &batch.schema).await?;
        let rows_before = store::row_count(&mut tx, &batch.table).await?;

        let deleted = match mode {
            LoadMode::Lifetime => {
                let sql = format!("DELETE FROM {}", quote_ident(&batch.table));
                sqlx::query(&sql).execute(&mut *tx).await?.rows_affected() as i64
            },
            LoadMode::Incremental => delete_matching(&mut tx, &batch.table, grain, &batch.rows).await?,
        };

        insert_rows(&mut tx, &batch.table, &batch.schema, &batch.rows).await?;
        let rows_after = store::row_count(&mut tx, &batch.table).await?;

        tx.commit().await?;

        Ok(LoadResult {
            rows_in: batch.len() as i64,
            rows_before,
            rows_after,
            deleted,
        })
    }
}

/// Create the table on first load; add any declared column it lacks.
async fn ensure_table(conn: &mut SqliteConnection, table: &str, schema: &TableSchema) -> Result<()> {
    let existing = store::table_columns(conn, table).await?;

    if existing.is_empty() {
        let columns: Vec<String> = schema
            .columns
            .iter()
            .map(|c| format!("{} {}", quote_ident(&c.name), c.column_type.sql_type()))
            .collect();
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            quote_ident(table),
            columns.join(", ")
        );
        sqlx::query(&sql).execute(&mut *conn).await?;
        info!(table, columns = schema.columns.len(), "Created raw table");
        return Ok(());
    }

    let present: BTreeSet<&str> = existing.iter().map(|c| c.name.as_str()).collect();
    for column in schema.columns.iter().filter(|c| !present.contains(c.name.as_str())) {
        let sql = format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            quote_ident(table),
            quote_ident(&column.name),
            column.column_type.sql_type()
        );
        sqlx::query(&sql).execute(&mut *conn).await?;
        info!(table, column = %column.name, "Added column");
    }
    Ok(())
}

async fn delete_matching(
    conn: &mut SqliteConnection,
    table: &str,
    grain: &Grain,
    rows: &[Row],
) -> Result<i64> {
    let keys = distinct_keys(table, grain, rows)?;
    let key_list = grain
        .columns()
        .iter()
        .map(String::as_str)
        .map(quote_ident)
        .collect::<Vec<_>>()
        .join(", ");
    let per_statement = (MAX_BINDS_PER_STATEMENT / grain.len()).max(1);

    let mut deleted = 0;
    for chunk in keys.chunks(per_statement) {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "DELETE FROM {} WHERE ({}) IN (",
            quote_ident(table),
            key_list
        ));
        builder.push_values(chunk, |mut b, key| {
            for value in key {
                push_value(&mut b, value);
            }
        });
        builder.push(")");
        deleted += builder.build().execute(&mut *conn).await?.rows_affected() as i64;
    }
    Ok(deleted)
}

/// Distinct grain tuples of a batch, in first-seen order
fn distinct_keys(table: &str, grain: &Grain, rows: &[Row]) -> Result<Vec<Vec<Value>>> {
    let mut seen = BTreeSet::new();
    let mut keys = Vec::new();

    for row in rows {
        let mut key = Vec::with_capacity(grain.len());
        for column in grain.columns() {
            match row.get(column) {
                Some(v) if !v.is_null() => key.push(v.clone()),
                _ => {
                    return Err(IngestError::schema_mismatch(
                        table,
                        format!("row is missing grain column '{}'", column),
                    ))
                },
            }
        }
        // Values hold floats, so tuples are compared through their Debug form.
        let fingerprint: Vec<String> = key.iter().map(|v| format!("{:?}", v)).collect();
        if seen.insert(fingerprint) {
            keys.push(key);
        }
    }
    Ok(keys)
}

async fn insert_rows(
    conn: &mut SqliteConnection,
    table: &str,
    schema: &TableSchema,
    rows: &[Row],
) -> Result<()> {
    let column_list = schema
        .names()
        .map(quote_ident)
        .collect::<Vec<_>>()
        .join(", ");
    let per_statement = (MAX_BINDS_PER_STATEMENT / schema.columns.len().max(1)).max(1);

    for chunk in rows.chunks(per_statement) {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "INSERT INTO {} ({}) ",
            quote_ident(table),
            column_list
        ));
        builder.push_values(chunk, |mut b, row| {
            for column in &schema.columns {
                push_value(&mut b, row.get(&column.name).unwrap_or(&Value::Null));
            }
        });
        builder.build().execute(&mut *conn).await?;
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::schema::{Column, ColumnType};

    fn schema() -> TableSchema {
        TableSchema::new(vec![
            Column::new("date", ColumnType::String),
            Column::new("campaign_id", ColumnType::Integer),
            Column::new("clicks", ColumnType::Integer),
        ])
    }

    fn row(date: &str, campaign: i64, clicks: i64) -> Row {
        let mut r = Row::new();
        r.insert("date".to_string(), Value::Text(date.to_string()));
        r.insert("campaign_id".to_string(), Value::Integer(campaign));
        r.insert("clicks".to_string(), Value::Integer(clicks));
        r
    }

    async fn engine() -> (UpsertEngine, Warehouse) {
        let warehouse = Warehouse::in_memory().await.unwrap();
        let registry =
            Arc::new(GrainRegistry::new([("ads_daily", vec!["date", "campaign_id"])]).unwrap());
        (UpsertEngine::new(warehouse.clone(), registry), warehouse)
    }

    #[tokio::test]
    async fn test_first_load_creates_table() {
        let (engine, warehouse) = engine().await;
        let batch = Batch::new("gads", "ads_daily", schema(), vec![row("2024-06-01", 1, 5)]);

        let result = engine.load(Uuid::new_v4(), &batch, LoadMode::Incremental).await.unwrap();
        assert_eq!(result.rows_before, 0);
        assert_eq!(result.rows_after, 1);
        assert!(warehouse.table_exists("ads_daily").await.unwrap());
    }

    #[tokio::test]
    async fn test_incremental_replaces_matching_keys_only() {
        let (engine, warehouse) = engine().await;
        let run = Uuid::new_v4();
        let first = Batch::new(
            "gads",
            "ads_daily",
            schema(),
            vec![row("2024-06-01", 1, 5), row("2024-06-01", 2, 6)],
        );
        engine.load(run, &first, LoadMode::Incremental).await.unwrap();

        let second = Batch::new("gads", "ads_daily", schema(), vec![row("2024-06-01", 2, 9)]);
        let result = engine.load(run, &second, LoadMode::Incremental).await.unwrap();
        assert_eq!(result.deleted, 1);
        assert_eq!(result.rows_after, 2);

        let rows = warehouse
            .fetch_rows("SELECT clicks FROM ads_daily WHERE campaign_id = 2")
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["clicks"], Value::Integer(9));
    }

    #[tokio::test]
    async fn test_new_columns_are_added() {
        let (engine, warehouse) = engine().await;
        let run = Uuid::new_v4();
        engine
            .load(run, &Batch::new("gads", "ads_daily", schema(), vec![row("2024-06-01", 1, 5)]), LoadMode::Incremental)
            .await
            .unwrap();

        let mut wider = schema();
        wider.columns.push(Column::new("cost", ColumnType::Float));
        let mut r = row("2024-06-02", 1, 3);
        r.insert("cost".to_string(), Value::Float(1.25));
        engine
            .load(run, &Batch::new("gads", "ads_daily", wider, vec![r]), LoadMode::Incremental)
            .await
            .unwrap();

        let columns = warehouse.table_columns("ads_daily").await.unwrap();
        assert!(columns.iter().any(|c| c.name == "cost" && c.declared_type == "REAL"));
    }

    #[tokio::test]
    async fn test_empty_incremental_batch_is_a_no_op() {
        let (engine, warehouse) = engine().await;
        let run = Uuid::new_v4();
        let result = engine
            .load(run, &Batch::new("gads", "ads_daily", schema(), vec![]), LoadMode::Incremental)
            .await
            .unwrap();
        assert_eq!(result.rows_after, 0);
        assert!(!warehouse.table_exists("ads_daily").await.unwrap());

        engine
            .load(run, &Batch::new("gads", "ads_daily", schema(), vec![row("2024-06-01", 1, 5)]), LoadMode::Incremental)
            .await
            .unwrap();
        let result = engine
            .load(run, &Batch::new("gads", "ads_daily", schema(), vec![]), LoadMode::Incremental)
            .await
            .unwrap();
        assert_eq!((result.rows_before, result.rows_after), (1, 1));

        let lineage = LineageLog::new(warehouse.pool().clone()).for_run(run).await.unwrap();
        assert_eq!(lineage.len(), 3);
    }

    #[tokio::test]
    async fn test_empty_lifetime_batch_on_missing_table() {
        let (engine, warehouse) = engine().await;
        let result = engine
            .load(Uuid::new_v4(), &Batch::new("gads", "ads_daily", schema(), vec![]), LoadMode::Lifetime)
            .await
            .unwrap();
        assert_eq!(result.rows_after, 0);
        assert!(!warehouse.table_exists("ads_daily").await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_table_is_refused() {
        let (engine, _warehouse) = engine().await;
        let batch = Batch::new("gads", "campaigns", schema(), vec![row("2024-06-01", 1, 5)]);
        let err = engine.load(Uuid::new_v4(), &batch, LoadMode::Lifetime).await.unwrap_err();
        assert!(matches!(err, IngestError::UnknownTable(_)));
    }

    #[test]
    fn test_distinct_keys_collapse_duplicates() {
        let grain = Grain::new(["date", "campaign_id"]).unwrap();
        let rows = vec![row("2024-06-01", 1, 5), row("2024-06-01", 1, 7), row("2024-06-02", 1, 1)];
        let keys = distinct_keys("ads_daily", &grain, &rows).unwrap();
        assert_eq!(keys.len(), 2);
    }
}
