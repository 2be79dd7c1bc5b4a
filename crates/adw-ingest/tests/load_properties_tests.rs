//! Upsert and validation properties against a real SQLite store
//!
//! Covers:
//! - Incremental idempotence
//! - Lifetime replace leaving no residue
//! - Incremental partial overlap
//! - In-batch duplicates loading and being reported
//! - Rollback on a failed insert

mod common;

use adw_ingest::schema::Value;
use adw_ingest::{GrainValidator, LineageLog, LoadMode, UpsertEngine};
use anyhow::Result;
use common::{ads_daily_schema, batch, campaigns_schema, init_tracing, setup};
use serde_json::json;
use std::collections::BTreeSet;
use uuid::Uuid;

async fn campaign_ids(warehouse: &adw_ingest::Warehouse) -> Result<BTreeSet<i64>> {
    let rows = warehouse.fetch_rows("SELECT campaign_id FROM campaigns").await?;
    Ok(rows
        .iter()
        .filter_map(|r| match r.get("campaign_id") {
            Some(Value::Integer(id)) => Some(*id),
            _ => None,
        })
        .collect())
}

#[tokio::test]
async fn test_incremental_load_is_idempotent() -> Result<()> {
    init_tracing();
    let (warehouse, registry) = setup().await?;
    let engine = UpsertEngine::new(warehouse.clone(), registry.clone());

    let b = batch(
        &registry,
        "ads_daily",
        &ads_daily_schema(),
        vec![
            json!({"date": "2024-06-01", "campaign_id": 101, "clicks": 5}),
            json!({"date": "2024-06-01", "campaign_id": 102, "clicks": 3}),
            json!({"date": "2024-06-02", "campaign_id": 101, "clicks": 8}),
        ],
    )?;

    let run = Uuid::new_v4();
    let first = engine.load(run, &b, LoadMode::Incremental).await?;
    let content_once = warehouse
        .fetch_rows("SELECT date, campaign_id, clicks FROM ads_daily ORDER BY date, campaign_id")
        .await?;

    let second = engine.load(run, &b, LoadMode::Incremental).await?;
    let content_twice = warehouse
        .fetch_rows("SELECT date, campaign_id, clicks FROM ads_daily ORDER BY date, campaign_id")
        .await?;

    assert_eq!(first.rows_after, 3);
    assert_eq!(second.rows_before, 3);
    assert_eq!(second.rows_after, 3);
    assert_eq!(content_once, content_twice);

    let lineage = LineageLog::new(warehouse.pool().clone()).for_run(run).await?;
    assert_eq!(lineage.len(), 2);
    assert!(lineage.iter().all(|r| r.succeeded()));
    Ok(())
}

#[tokio::test]
async fn test_lifetime_load_replaces_everything() -> Result<()> {
    init_tracing();
    let (warehouse, registry) = setup().await?;
    let engine = UpsertEngine::new(warehouse.clone(), registry.clone());
    let schema = campaigns_schema();

    let b1 = batch(
        &registry,
        "campaigns",
        &schema,
        vec![
            json!({"campaign_id": 1, "campaign_name": "Brand"}),
            json!({"campaign_id": 2, "campaign_name": "Generic"}),
            json!({"campaign_id": 3, "campaign_name": "Competitor"}),
        ],
    )?;
    let b2 = batch(
        &registry,
        "campaigns",
        &schema,
        vec![
            json!({"campaign_id": 10, "campaign_name": "Summer"}),
            json!({"campaign_id": 11, "campaign_name": "Autumn"}),
        ],
    )?;

    engine.load(Uuid::new_v4(), &b1, LoadMode::Lifetime).await?;
    let result = engine.load(Uuid::new_v4(), &b2, LoadMode::Lifetime).await?;

    assert_eq!(result.rows_before, 3);
    assert_eq!(result.deleted, 3);
    assert_eq!(result.rows_after, 2);
    assert_eq!(campaign_ids(&warehouse).await?, BTreeSet::from([10, 11]));
    Ok(())
}

#[tokio::test]
async fn test_lifetime_load_of_nothing_empties_the_table() -> Result<()> {
    init_tracing();
    let (warehouse, registry) = setup().await?;
    let engine = UpsertEngine::new(warehouse.clone(), registry.clone());
    let schema = campaigns_schema();

    let full = batch(
        &registry,
        "campaigns",
        &schema,
        vec![
            json!({"campaign_id": 1, "campaign_name": "Brand"}),
            json!({"campaign_id": 2, "campaign_name": "Generic"}),
            json!({"campaign_id": 3, "campaign_name": "Competitor"}),
        ],
    )?;
    engine.load(Uuid::new_v4(), &full, LoadMode::Lifetime).await?;

    let empty = batch(&registry, "campaigns", &schema, vec![])?;
    let result = engine.load(Uuid::new_v4(), &empty, LoadMode::Lifetime).await?;

    assert_eq!(result.rows_before, 3);
    assert_eq!(result.deleted, 3);
    assert_eq!(result.rows_after, 0);
    assert_eq!(warehouse.row_count("campaigns").await?, 0);
    Ok(())
}

#[tokio::test]
async fn test_incremental_partial_overlap() -> Result<()> {
    init_tracing();
    let (warehouse, registry) = setup().await?;
    let engine = UpsertEngine::new(warehouse.clone(), registry.clone());
    let schema = campaigns_schema();

    let existing = batch(
        &registry,
        "campaigns",
        &schema,
        vec![
            json!({"campaign_id": 1, "campaign_name": "A"}),
            json!({"campaign_id": 2, "campaign_name": "B"}),
            json!({"campaign_id": 3, "campaign_name": "C"}),
        ],
    )?;
    let touching = batch(
        &registry,
        "campaigns",
        &schema,
        vec![
            json!({"campaign_id": 2, "campaign_name": "B v2"}),
            json!({"campaign_id": 4, "campaign_name": "D"}),
        ],
    )?;

    engine.load(Uuid::new_v4(), &existing, LoadMode::Incremental).await?;
    let result = engine.load(Uuid::new_v4(), &touching, LoadMode::Incremental).await?;

    assert_eq!(result.deleted, 1);
    assert_eq!(result.rows_after, 4);
    assert_eq!(campaign_ids(&warehouse).await?, BTreeSet::from([1, 2, 3, 4]));

    let b_rows = warehouse
        .fetch_rows("SELECT campaign_name FROM campaigns WHERE campaign_id = 2")
        .await?;
    assert_eq!(b_rows.len(), 1);
    assert_eq!(b_rows[0]["campaign_name"], Value::Text("B v2".to_string()));
    Ok(())
}

#[tokio::test]
async fn test_in_batch_duplicates_are_loaded_and_reported() -> Result<()> {
    init_tracing();
    let (warehouse, registry) = setup().await?;
    let engine = UpsertEngine::new(warehouse.clone(), registry.clone());

    let b = batch(
        &registry,
        "ads_daily",
        &ads_daily_schema(),
        vec![
            json!({"date": "2024-06-01", "campaign_id": 101, "clicks": 5}),
            json!({"date": "2024-06-01", "campaign_id": 101, "clicks": 7}),
        ],
    )?;
    let result = engine.load(Uuid::new_v4(), &b, LoadMode::Incremental).await?;
    assert_eq!(result.rows_after, 2);

    let report = GrainValidator::new(warehouse.clone(), registry.clone())
        .validate("ads_daily")
        .await?;

    assert!(!report.is_clean());
    assert_eq!(report.duplicate_groups.len(), 1);
    let group = &report.duplicate_groups[0];
    assert_eq!(
        group.key,
        vec![Value::Text("2024-06-01".to_string()), Value::Integer(101)]
    );
    assert_eq!(group.count, 2);
    assert_eq!(group.samples.len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_every_duplicate_group_is_reported() -> Result<()> {
    init_tracing();
    let (warehouse, registry) = setup().await?;
    let engine = UpsertEngine::new(warehouse.clone(), registry.clone());

    let records = (0..150)
        .flat_map(|id| {
            [
                json!({"date": "2024-06-01", "campaign_id": id, "clicks": 1}),
                json!({"date": "2024-06-01", "campaign_id": id, "clicks": 2}),
            ]
        })
        .collect();
    let b = batch(&registry, "ads_daily", &ads_daily_schema(), records)?;
    engine.load(Uuid::new_v4(), &b, LoadMode::Incremental).await?;

    let report = GrainValidator::new(warehouse.clone(), registry.clone())
        .with_sample_limit(1)
        .validate("ads_daily")
        .await?;

    assert_eq!(report.total_duplicate_groups, 150);
    assert_eq!(report.duplicate_groups.len(), 150);
    assert_eq!(report.extra_rows, 150);
    assert!(report.duplicate_groups.iter().all(|g| g.count == 2 && g.samples.len() == 1));
    Ok(())
}

#[tokio::test]
async fn test_clean_store_passes_audit() -> Result<()> {
    init_tracing();
    let (warehouse, registry) = setup().await?;
    let engine = UpsertEngine::new(warehouse.clone(), registry.clone());

    let b = batch(
        &registry,
        "campaigns",
        &campaigns_schema(),
        vec![json!({"campaign_id": 1, "campaign_name": "Brand"})],
    )?;
    engine.load(Uuid::new_v4(), &b, LoadMode::Lifetime).await?;

    let audit = GrainValidator::new(warehouse, registry).validate_all().await?;
    assert!(audit.is_clean());
    assert_eq!(audit.tables.len(), 2);
    assert!(audit.tables.iter().all(|t| t.duplicate_groups.is_empty()));
    Ok(())
}

#[tokio::test]
async fn test_failed_insert_rolls_back() -> Result<()> {
    init_tracing();
    let (warehouse, registry) = setup().await?;

    // A column the batch never fills, so every insert violates NOT NULL.
    sqlx::query("CREATE TABLE campaigns (campaign_id INTEGER, campaign_name TEXT, owner TEXT NOT NULL)")
        .execute(warehouse.pool())
        .await?;
    sqlx::query("INSERT INTO campaigns VALUES (1, 'Brand', 'ops'), (2, 'Generic', 'ops')")
        .execute(warehouse.pool())
        .await?;

    let engine = UpsertEngine::new(warehouse.clone(), registry.clone());
    let b = batch(
        &registry,
        "campaigns",
        &campaigns_schema(),
        vec![json!({"campaign_id": 9, "campaign_name": "New"})],
    )?;
    let run = Uuid::new_v4();
    assert!(engine.load(run, &b, LoadMode::Lifetime).await.is_err());

    assert_eq!(campaign_ids(&warehouse).await?, BTreeSet::from([1, 2]));
    let lineage = LineageLog::new(warehouse.pool().clone()).for_run(run).await?;
    assert_eq!(lineage.len(), 1);
    assert!(lineage[0].error.is_some());
    assert_eq!(lineage[0].rows_after, 2);
    Ok(())
}
