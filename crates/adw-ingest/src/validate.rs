//! Grain validator
//!
//! Read-only duplicate detection: group a table by its declared grain and
//! report every group with more than one row. Never modifies the store.

use crate::error::Result;
use crate::grain::GrainRegistry;
use crate::schema::{Row, Value};
use crate::store::{quote_ident, Warehouse};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};

pub const DEFAULT_SAMPLE_LIMIT: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicateGroup {
    pub key: Vec<Value>,
    pub count: i64,
    pub samples: Vec<Row>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationReport {
    pub table: String,
    pub grain: Vec<String>,
    /// False when the table has never been loaded
    pub present: bool,
    pub row_count: i64,
    pub duplicate_groups: Vec<DuplicateGroup>,
    /// Number of groups with count > 1. Exceeds `duplicate_groups.len()` only
    /// when the validator was given a group limit.
    pub total_duplicate_groups: i64,
    /// Rows beyond the first in each duplicate group
    pub extra_rows: i64,
    pub null_key_counts: BTreeMap<String, i64>,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        self.total_duplicate_groups == 0
    }

    pub fn has_null_keys(&self) -> bool {
        self.null_key_counts.values().any(|n| *n > 0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditReport {
    pub tables: Vec<ValidationReport>,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.tables.iter().all(ValidationReport::is_clean)
    }

    pub fn violations(&self) -> impl Iterator<Item = &ValidationReport> {
        self.tables.iter().filter(|t| !t.is_clean())
    }

    pub fn missing(&self) -> impl Iterator<Item = &ValidationReport> {
        self.tables.iter().filter(|t| !t.present)
    }

    /// Human-readable data quality report in markdown
    pub fn to_markdown(&self) -> String {
        let mut out = String::from("# Grain validation report\n\n");
        out.push_str("| Table | Grain | Rows | Duplicate groups | Extra rows | Status |\n");
        out.push_str("|---|---|---|---|---|---|\n");
        for t in &self.tables {
            let status = if !t.present {
                "missing"
            } else if t.is_clean() {
                "ok"
            } else {
                "VIOLATION"
            };
            out.push_str(&format!(
                "| {} | {} | {} | {} | {} | {} |\n",
                t.table,
                t.grain.join(", "),
                t.row_count,
                t.total_duplicate_groups,
                t.extra_rows,
                status
            ));
        }

        for t in self.violations() {
            out.push_str(&format!("\n## {}\n\n", t.table));
            for group in &t.duplicate_groups {
                let key: Vec<String> = group.key.iter().map(Value::to_string).collect();
                out.push_str(&format!("- ({}) x{}\n", key.join(", "), group.count));
            }
        }
        out
    }
}

pub struct GrainValidator {
    warehouse: Warehouse,
    registry: Arc<GrainRegistry>,
    sample_limit: usize,
    group_limit: Option<usize>,
}

impl GrainValidator {
    pub fn new(warehouse: Warehouse, registry: Arc<GrainRegistry>) -> Self {
        Self {
            warehouse,
            registry,
            sample_limit: DEFAULT_SAMPLE_LIMIT,
            group_limit: None,
        }
    }

    pub fn with_sample_limit(mut self, limit: usize) -> Self {
        self.sample_limit = limit;
        self
    }

    /// List at most `limit` duplicate groups per table. Unlimited by default.
    pub fn with_group_limit(mut self, limit: usize) -> Self {
        self.group_limit = Some(limit);
        self
    }

    #[instrument(skip(self))]
    pub async fn validate(&self, table: &str) -> Result<ValidationReport> {
        let grain = self.registry.lookup(table)?;
        let mut report = ValidationReport {
            table: table.to_string(),
            grain: grain.columns().to_vec(),
            present: false,
            row_count: 0,
            duplicate_groups: Vec::new(),
            total_duplicate_groups: 0,
            extra_rows: 0,
            null_key_counts: BTreeMap::new(),
        };

        if !self.warehouse.table_exists(table).await? {
            return Ok(report);
        }
        report.present = true;
        report.row_count = self.warehouse.row_count(table).await?;

        let quoted = quote_ident(table);
        let keys: Vec<String> = grain.columns().iter().map(|c| quote_ident(c)).collect();
        let key_list = keys.join(", ");

        let totals = self
            .warehouse
            .fetch_rows(&format!(
                "SELECT COUNT(*) AS group_count, COALESCE(SUM(cnt - 1), 0) AS extra FROM (\
                 SELECT COUNT(*) AS cnt FROM {} GROUP BY {} HAVING COUNT(*) > 1)",
                quoted, key_list
            ))
            .await?;
        if let Some(row) = totals.first() {
            report.total_duplicate_groups = as_int(row.get("group_count"));
            report.extra_rows = as_int(row.get("extra"));
        }

        if report.total_duplicate_groups > 0 {
            let limit = self
                .group_limit
                .map(|n| format!(" LIMIT {}", n))
                .unwrap_or_default();
            let groups = self
                .warehouse
                .fetch_rows(&format!(
                    "SELECT {keys}, COUNT(*) AS _count FROM {table} GROUP BY {keys} \
                     HAVING COUNT(*) > 1 ORDER BY COUNT(*) DESC, {keys}{limit}",
                    keys = key_list,
                    table = quoted,
                    limit = limit
                ))
                .await?;

            for group in groups {
                let key: Vec<Value> = grain
                    .columns()
                    .iter()
                    .map(|c| group.get(c).cloned().unwrap_or(Value::Null))
                    .collect();
                let samples = self.samples(&quoted, grain.columns(), &key).await?;
                report.duplicate_groups.push(DuplicateGroup {
                    count: as_int(group.get("_count")),
                    key,
                    samples,
                });
            }

            warn!(
                table,
                groups = report.total_duplicate_groups,
                extra_rows = report.extra_rows,
                "Grain violation"
            );
        }

        for (column, quoted_column) in grain.columns().iter().zip(&keys) {
            let rows = self
                .warehouse
                .fetch_rows(&format!(
                    "SELECT COUNT(*) AS n FROM {} WHERE {} IS NULL",
                    quoted, quoted_column
                ))
                .await?;
            let n = rows.first().map_or(0, |r| as_int(r.get("n")));
            report.null_key_counts.insert(column.clone(), n);
        }

        Ok(report)
    }

    async fn samples(&self, table: &str, columns: &[String], key: &[Value]) -> Result<Vec<Row>> {
        let predicate: Vec<String> = columns
            .iter()
            .map(|c| format!("{} IS ?", quote_ident(c)))
            .collect();
        let sql = format!(
            "SELECT * FROM {} WHERE {} ORDER BY rowid LIMIT {}",
            table,
            predicate.join(" AND "),
            self.sample_limit
        );

        let mut query = sqlx::query(&sql);
        for value in key {
            query = crate::store::bind_value(query, value);
        }
        let rows = query.fetch_all(self.warehouse.pool()).await?;
        Ok(rows.iter().map(crate::store::decode_row).collect())
    }

    /// Validate every registered table, loaded or not
    pub async fn validate_all(&self) -> Result<AuditReport> {
        let mut tables = Vec::with_capacity(self.registry.len());
        for table in self.registry.tables() {
            tables.push(self.validate(table).await?);
        }

        let report = AuditReport { tables };
        info!(
            tables = report.tables.len(),
            missing = report.missing().count(),
            violations = report.violations().count(),
            "Grain audit finished"
        );
        Ok(report)
    }
}

fn as_int(value: Option<&Value>) -> i64 {
    match value {
        Some(Value::Integer(n)) => *n,
        Some(Value::Float(f)) => *f as i64,
        _ => 0,
    }
}
