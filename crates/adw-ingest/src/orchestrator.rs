//! Load orchestrator
//!
//! Drives one run: for each requested source, in order, every table goes
//! through extract (with retry), normalize, upsert and validate. A failing
//! table marks its source failed and the run moves on. Views are rebuilt once
//! all sources are done.

use crate::catalog::{Catalog, SourceDef, TableDef};
use crate::config::IngestConfig;
use crate::error::{IngestError, Result};
use crate::extract::{Extractor, JsonlExtractor};
use crate::grain::GrainRegistry;
use crate::lineage::LoadMode;
use crate::normalize::{Batch, Normalizer};
use crate::repair::{GrainRepair, RepairResult};
use crate::retry::RetryPolicy;
use crate::store::Warehouse;
use crate::upsert::UpsertEngine;
use crate::validate::{AuditReport, GrainValidator};
use crate::views::{MaterializeReport, ViewMaterializer, ViewPlan};
use adw_common::DateRange;
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Requests every source in the catalog
pub const ALL_SOURCES: &str = "all";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RunOptions {
    pub rebuild_views: bool,
    /// Drop every view in the store before rebuilding
    pub drop_views: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            rebuild_views: true,
            drop_views: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableOutcome {
    pub table: String,
    pub rows_in: i64,
    pub rows_before: i64,
    pub rows_after: i64,
    pub duplicate_groups: i64,
    pub extra_rows: i64,
    pub error: Option<String>,
}

impl TableOutcome {
    fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            rows_in: 0,
            rows_before: 0,
            rows_after: 0,
            duplicate_groups: 0,
            extra_rows: 0,
            error: None,
        }
    }

    pub fn failed(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceSummary {
    pub name: String,
    pub range: DateRange,
    pub failed: bool,
    pub tables: Vec<TableOutcome>,
}

impl SourceSummary {
    pub fn rows_loaded(&self) -> i64 {
        self.tables
            .iter()
            .filter(|t| !t.failed())
            .map(|t| t.rows_in)
            .sum()
    }

    pub fn duplicate_groups(&self) -> i64 {
        self.tables.iter().map(|t| t.duplicate_groups).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub mode: LoadMode,
    pub range: DateRange,
    pub sources: Vec<SourceSummary>,
    pub views: Option<MaterializeReport>,
    pub view_error: Option<String>,
}

impl RunSummary {
    pub fn failed_sources(&self) -> impl Iterator<Item = &SourceSummary> {
        self.sources.iter().filter(|s| s.failed)
    }

    pub fn has_violations(&self) -> bool {
        self.sources.iter().any(|s| s.duplicate_groups() > 0)
    }

    /// Fact views left unbuilt while some of their inputs exist
    pub fn has_degraded_views(&self) -> bool {
        self.views
            .as_ref()
            .is_some_and(|v| v.degraded().next().is_some())
    }

    /// 0 only when every source succeeded, no grain violation was found and
    /// every view that could be built was built
    pub fn exit_code(&self) -> i32 {
        if self.failed_sources().next().is_some()
            || self.has_violations()
            || self.view_error.is_some()
            || self.has_degraded_views()
        {
            1
        } else {
            0
        }
    }
}

pub struct LoadOrchestrator {
    catalog: Arc<Catalog>,
    registry: Arc<GrainRegistry>,
    warehouse: Warehouse,
    plan: ViewPlan,
    normalizer: Normalizer,
    engine: UpsertEngine,
    validator: GrainValidator,
    retry: RetryPolicy,
    extractors: BTreeMap<String, Arc<dyn Extractor>>,
}

impl LoadOrchestrator {
    /// Wire every component from the catalog. Grain and view-graph problems
    /// surface here, before any store access.
    pub fn new(catalog: Catalog, warehouse: Warehouse, config: &IngestConfig) -> Result<Self> {
        catalog.validate()?;
        let registry = Arc::new(GrainRegistry::from_catalog(&catalog)?);
        let plan = ViewPlan::new(&catalog.views, &registry)?;

        Ok(Self {
            normalizer: Normalizer::new(registry.clone()),
            engine: UpsertEngine::new(warehouse.clone(), registry.clone()),
            validator: GrainValidator::new(warehouse.clone(), registry.clone())
                .with_sample_limit(config.sample_limit),
            catalog: Arc::new(catalog),
            registry,
            warehouse,
            plan,
            retry: config.retry_policy(),
            extractors: BTreeMap::new(),
        })
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn Extractor>) -> Self {
        self.extractors
            .insert(extractor.source().to_string(), extractor);
        self
    }

    /// Register a [`JsonlExtractor`] for every source that has none yet
    pub fn with_jsonl_extractors(mut self, input_dir: &Path) -> Self {
        for source in &self.catalog.sources {
            if !self.extractors.contains_key(&source.name) {
                let extractor = JsonlExtractor::new(input_dir, &source.name, source.provider);
                self.extractors
                    .insert(source.name.clone(), Arc::new(extractor));
            }
        }
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn registry(&self) -> &Arc<GrainRegistry> {
        &self.registry
    }

    /// Expand `all` and check every name against the catalog and the
    /// registered extractors.
    pub fn resolve_sources(&self, requested: &[String]) -> Result<Vec<&SourceDef>> {
        if requested.is_empty() {
            return Err(IngestError::config("no source requested"));
        }

        let names: Vec<&str> = if requested.iter().any(|s| s == ALL_SOURCES) {
            self.catalog.source_names()
        } else {
            requested.iter().map(String::as_str).collect()
        };

        let mut sources = Vec::with_capacity(names.len());
        for name in names {
            let source = self.catalog.source(name).ok_or_else(|| {
                IngestError::config(format!(
                    "unknown source '{}', expected one of: {}",
                    name,
                    self.catalog.source_names().join(", ")
                ))
            })?;
            if !self.extractors.contains_key(name) {
                return Err(IngestError::config(format!("no extractor registered for source '{}'", name)));
            }
            for table in self.catalog.tables_for_source(name) {
                self.registry.lookup(&table.name)?;
            }
            if sources.iter().all(|s: &&SourceDef| s.name != source.name) {
                sources.push(source);
            }
        }
        Ok(sources)
    }

    /// Load the requested sources over `range`.
    ///
    /// Configuration errors are returned before anything is extracted. Every
    /// other failure is recorded in the summary.
    #[instrument(skip(self, sources, options), fields(mode = %mode, range = %range))]
    pub async fn run(
        &self,
        sources: &[String],
        mode: LoadMode,
        range: DateRange,
        options: RunOptions,
    ) -> Result<RunSummary> {
        let resolved = self
            .resolve_sources(sources)?
            .into_iter()
            .map(|source| range_for(source, mode, range).map(|r| (source, r)))
            .collect::<Result<Vec<_>>>()?;
        let run_id = Uuid::new_v4();
        info!(%run_id, sources = resolved.len(), "Starting load run");

        let mut summaries = Vec::with_capacity(resolved.len());
        for (source, source_range) in resolved {
            summaries.push(self.run_source(run_id, source, mode, source_range).await);
        }

        let (views, view_error) = if options.rebuild_views {
            match self.rebuild_views(options.drop_views).await {
                Ok(report) => (Some(report), None),
                Err(e) => {
                    error!(error = %e, "View rebuild failed");
                    (None, Some(e.to_string()))
                },
            }
        } else {
            (None, None)
        };

        let summary = RunSummary {
            run_id,
            mode,
            range,
            sources: summaries,
            views,
            view_error,
        };
        info!(
            %run_id,
            failed_sources = summary.failed_sources().count(),
            violations = summary.has_violations(),
            degraded_views = summary.has_degraded_views(),
            "Load run finished"
        );
        Ok(summary)
    }

    async fn run_source(
        &self,
        run_id: Uuid,
        source: &SourceDef,
        mode: LoadMode,
        range: DateRange,
    ) -> SourceSummary {
        info!(source = %source.name, range = %range, "Loading source");
        let mut tables = Vec::new();

        for table in self.catalog.tables_for_source(&source.name) {
            let mut outcome = TableOutcome::new(&table.name);
            if let Err(e) = self.run_table(run_id, table, mode, &range, &mut outcome).await {
                warn!(source = %source.name, table = %table.name, error = %e, "Table load failed");
                outcome.error = Some(e.to_string());
            }
            tables.push(outcome);
        }

        let failed = tables.iter().any(TableOutcome::failed);
        if failed {
            error!(source = %source.name, "Source failed");
        }
        SourceSummary {
            name: source.name.clone(),
            range,
            failed,
            tables,
        }
    }

    async fn run_table(
        &self,
        run_id: Uuid,
        table: &TableDef,
        mode: LoadMode,
        range: &DateRange,
        outcome: &mut TableOutcome,
    ) -> Result<()> {
        let started_at = Utc::now();
        let batch = match self.prepare_batch(table, mode, range).await {
            Ok(batch) => batch,
            Err(e) => {
                self.engine
                    .record_failure(run_id, &table.source, &table.name, mode, started_at, 0, &e)
                    .await;
                return Err(e);
            },
        };
        outcome.rows_in = batch.len() as i64;

        let loaded = self.engine.load(run_id, &batch, mode).await?;
        outcome.rows_before = loaded.rows_before;
        outcome.rows_after = loaded.rows_after;

        let report = self.validator.validate(&table.name).await?;
        outcome.duplicate_groups = report.total_duplicate_groups;
        outcome.extra_rows = report.extra_rows;
        Ok(())
    }

    /// Extract with retry and normalize. Nothing is written to the table here.
    async fn prepare_batch(&self, table: &TableDef, mode: LoadMode, range: &DateRange) -> Result<Batch> {
        let extractor = self
            .extractors
            .get(&table.source)
            .ok_or_else(|| IngestError::config(format!("no extractor for source '{}'", table.source)))?;

        let label = format!("{}/{}", table.source, table.name);
        let records = self
            .retry
            .run(&label, || extractor.extract(&table.name, range))
            .await
            .map_err(|e| IngestError::Extraction {
                source_name: table.source.clone(),
                message: e.to_string(),
            })?;

        // A lifetime load of nothing would empty the table.
        if records.is_empty() && mode == LoadMode::Lifetime {
            let existing = self.engine.count_existing(&table.name).await?;
            if existing > 0 {
                return Err(IngestError::Extraction {
                    source_name: table.source.clone(),
                    message: format!(
                        "lifetime extract of '{}' returned no rows; refusing to empty a table holding {} rows",
                        table.name, existing
                    ),
                });
            }
        }

        self.normalizer.normalize(table, records, Utc::now())
    }

    /// Grain audit over every registered table, without loading
    pub async fn audit(&self) -> Result<AuditReport> {
        self.validator.validate_all().await
    }

    pub async fn rebuild_views(&self, drop_existing: bool) -> Result<MaterializeReport> {
        ViewMaterializer::new(self.warehouse.clone())
            .rebuild(&self.plan, drop_existing)
            .await
    }

    pub async fn repair(&self, table: &str) -> Result<RepairResult> {
        GrainRepair::new(self.warehouse.clone(), self.registry.clone())
            .dedupe_keep_latest(table)
            .await
    }
}

/// Lifetime loads start at the source's own lifetime start when it has one
fn range_for(source: &SourceDef, mode: LoadMode, range: DateRange) -> Result<DateRange> {
    match (mode, source.lifetime_start) {
        (LoadMode::Lifetime, Some(start)) => Ok(DateRange::new(start, range.end)?),
        _ => Ok(range),
    }
}
