//! ADW ingestion engine
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Loads provider extracts into a SQLite warehouse and keeps every raw table
//! true to its declared grain.
//!
//! # Overview
//!
//! - **Catalog**: sources, raw tables with their grains, view specs ([`catalog`])
//! - **Grain registry**: the only authority on table grains ([`grain`])
//! - **Normalizer**: provider records to typed batches ([`normalize`])
//! - **Upsert engine**: lifetime and incremental loads, one transaction each ([`upsert`])
//! - **Validator**: read-only duplicate detection ([`validate`])
//! - **Views**: typed, fact and dimension views built in dependency order ([`views`])
//! - **Orchestrator**: one run across sources with failure isolation ([`orchestrator`])
//!
//! # Example
//!
//! ```no_run
//! use adw_ingest::{Catalog, IngestConfig, LoadMode, LoadOrchestrator, RunOptions, Warehouse};
//! use adw_common::{DateRange, RangeSelection};
//!
//! # async fn run() -> adw_ingest::Result<()> {
//! let config = IngestConfig::from_env()?;
//! let warehouse = Warehouse::connect(&config.database_url).await?;
//! let orchestrator = LoadOrchestrator::new(Catalog::builtin()?, warehouse, &config)?
//!     .with_jsonl_extractors(&config.input_dir);
//!
//! let today = chrono::Local::now().date_naive();
//! let range = DateRange::resolve(&RangeSelection::Lookback(7), config.lifetime_start, 30, today)?;
//! let summary = orchestrator
//!     .run(&["all".to_string()], LoadMode::Incremental, range, RunOptions::default())
//!     .await?;
//! std::process::exit(summary.exit_code());
//! # }
//! ```

pub mod catalog;
pub mod cli;
pub mod config;
pub mod error;
pub mod extract;
pub mod grain;
pub mod lineage;
pub mod normalize;
pub mod orchestrator;
pub mod records;
pub mod repair;
pub mod retry;
pub mod schema;
pub mod store;
pub mod upsert;
pub mod validate;
pub mod views;

// Re-export commonly used types
pub use catalog::Catalog;
pub use config::IngestConfig;
pub use error::{IngestError, Result};
pub use grain::{Grain, GrainRegistry};
pub use lineage::{LineageLog, LineageRecord, LoadMode};
pub use normalize::{Batch, Normalizer};
pub use orchestrator::{LoadOrchestrator, RunOptions, RunSummary};
pub use store::Warehouse;
pub use upsert::UpsertEngine;
pub use validate::{AuditReport, GrainValidator, ValidationReport};
pub use views::{ViewMaterializer, ViewPlan};
