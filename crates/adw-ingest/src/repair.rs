//! Explicit duplicate cleanup
//!
//! Only ever run on operator request. Keeps the most recently extracted row for
//! each grain tuple and deletes the rest, in one transaction.

use crate::error::{IngestError, Result};
use crate::grain::GrainRegistry;
use crate::schema::EXTRACTED_AT;
use crate::store::{self, quote_ident, Warehouse};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RepairResult {
    pub rows_before: i64,
    pub rows_after: i64,
    pub removed: i64,
}

pub struct GrainRepair {
    warehouse: Warehouse,
    registry: Arc<GrainRegistry>,
}

impl GrainRepair {
    pub fn new(warehouse: Warehouse, registry: Arc<GrainRegistry>) -> Self {
        Self {
            warehouse,
            registry,
        }
    }

    /// Delete all but the latest row per grain tuple. Latest means greatest
    /// `extracted_at`, then the most recently inserted row.
    #[instrument(skip(self))]
    pub async fn dedupe_keep_latest(&self, table: &str) -> Result<RepairResult> {
        let grain = self.registry.lookup(table)?;
        let mut tx = self.warehouse.pool().begin().await?;

        let columns = store::table_columns(&mut tx, table).await?;
        if columns.is_empty() {
            return Err(IngestError::config(format!("table '{}' has not been loaded", table)));
        }
        let order = if columns.iter().any(|c| c.name == EXTRACTED_AT) {
            format!("{} DESC NULLS LAST, rowid DESC", quote_ident(EXTRACTED_AT))
        } else {
            "rowid DESC".to_string()
        };

        let partition = grain
            .columns()
            .iter()
            .map(String::as_str)
            .map(quote_ident)
            .collect::<Vec<_>>()
            .join(", ");
        let quoted = quote_ident(table);

        let rows_before = store::row_count(&mut tx, table).await?;
        let sql = format!(
            "DELETE FROM {table} WHERE rowid IN (\
             SELECT rid FROM (\
             SELECT rowid AS rid, ROW_NUMBER() OVER (PARTITION BY {partition} ORDER BY {order}) AS rn \
             FROM {table}) WHERE rn > 1)",
            table = quoted,
            partition = partition,
            order = order
        );
        let removed = sqlx::query(&sql).execute(&mut *tx).await?.rows_affected() as i64;
        let rows_after = store::row_count(&mut tx, table).await?;
        tx.commit().await?;

        info!(table, removed, rows_after, "Removed duplicate rows");
        Ok(RepairResult {
            rows_before,
            rows_after,
            removed,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::schema::Value;

    #[tokio::test]
    async fn test_keeps_latest_extraction() {
        let warehouse = Warehouse::in_memory().await.unwrap();
        sqlx::query("CREATE TABLE gads_daily_summary (date TEXT, clicks INTEGER, extracted_at TEXT)")
            .execute(warehouse.pool())
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO gads_daily_summary VALUES \
             ('2024-06-01', 5, '2024-06-02T01:00:00.000000Z'), \
             ('2024-06-01', 7, '2024-06-03T01:00:00.000000Z'), \
             ('2024-06-01', 6, NULL), \
             ('2024-06-02', 2, '2024-06-03T01:00:00.000000Z')",
        )
        .execute(warehouse.pool())
        .await
        .unwrap();

        let registry = Arc::new(GrainRegistry::new([("gads_daily_summary", vec!["date"])]).unwrap());
        let repair = GrainRepair::new(warehouse.clone(), registry);
        let result = repair.dedupe_keep_latest("gads_daily_summary").await.unwrap();

        assert_eq!(result.removed, 2);
        assert_eq!(result.rows_after, 2);
        let rows = warehouse
            .fetch_rows("SELECT clicks FROM gads_daily_summary WHERE date = '2024-06-01'")
            .await
            .unwrap();
        assert_eq!(rows[0]["clicks"], Value::Integer(7));
    }

    #[tokio::test]
    async fn test_unloaded_table() {
        let warehouse = Warehouse::in_memory().await.unwrap();
        let registry = Arc::new(GrainRegistry::new([("gads_daily_summary", vec!["date"])]).unwrap());
        let repair = GrainRepair::new(warehouse, registry);
        assert!(repair.dedupe_keep_latest("gads_daily_summary").await.is_err());
    }
}
