//! Shared helpers for adw-ingest integration tests
#![allow(dead_code)]

use adw_ingest::records::CanonicalRecord;
use adw_ingest::schema::{Column, ColumnType, TableSchema};
use adw_ingest::{Batch, GrainRegistry, Normalizer, Warehouse};
use chrono::Utc;
use serde_json::Value as Json;
use std::sync::Arc;

/// Initialize tracing for tests
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,adw_ingest=debug,sqlx=warn")),
        )
        .with_test_writer()
        .try_init();
}

/// In-memory store plus a registry with the grains used across tests
pub async fn setup() -> anyhow::Result<(Warehouse, Arc<GrainRegistry>)> {
    let warehouse = Warehouse::in_memory().await?;
    let registry = Arc::new(GrainRegistry::new([
        ("ads_daily", vec!["date", "campaign_id"]),
        ("campaigns", vec!["campaign_id"]),
    ])?);
    Ok((warehouse, registry))
}

pub fn ads_daily_schema() -> TableSchema {
    TableSchema::new(vec![
        Column::new("date", ColumnType::Date),
        Column::new("campaign_id", ColumnType::Integer),
        Column::new("clicks", ColumnType::Integer),
    ])
}

pub fn campaigns_schema() -> TableSchema {
    TableSchema::new(vec![
        Column::new("campaign_id", ColumnType::Integer),
        Column::new("campaign_name", ColumnType::String),
    ])
}

pub fn record(value: Json) -> CanonicalRecord {
    match value {
        Json::Object(map) => map,
        other => panic!("expected a JSON object, got {}", other),
    }
}

/// Normalize canonical JSON records into a batch for `table`
pub fn batch(
    registry: &Arc<GrainRegistry>,
    table: &str,
    schema: &TableSchema,
    records: Vec<Json>,
) -> anyhow::Result<Batch> {
    let normalizer = Normalizer::new(registry.clone());
    let records = records.into_iter().map(record).collect();
    Ok(normalizer.normalize_canonical("test", table, schema, records, Utc::now())?)
}
