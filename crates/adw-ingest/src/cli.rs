//! Command-line surface of the `adw-ingest` binary

use crate::catalog::Catalog;
use crate::config::IngestConfig;
use crate::error::{IngestError, Result};
use crate::lineage::LoadMode;
use crate::orchestrator::{LoadOrchestrator, RunOptions, RunSummary};
use crate::store::Warehouse;
use crate::validate::AuditReport;
use adw_common::date_range::parse_date;
use adw_common::{DateRange, RangeSelection};
use chrono::{Local, NaiveDate};
use clap::Parser;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Table};
use std::path::{Path, PathBuf};
use tracing::info;

/// Exit code for configuration errors
pub const EXIT_CONFIG: i32 = 2;

/// Load marketing extracts into the warehouse and check table grains
#[derive(Parser, Debug)]
#[command(name = "adw-ingest")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Source to load, or `all`. Repeat or comma-separate for several.
    #[arg(long, default_value = "all", value_delimiter = ',')]
    pub source: Vec<String>,

    /// Replace every table of the source with a full extraction
    #[arg(long, conflicts_with_all = ["lookback_days", "start_date"])]
    pub lifetime: bool,

    /// Incremental load of the last N complete days
    #[arg(long, conflicts_with = "start_date")]
    pub lookback_days: Option<u32>,

    /// Incremental load starting at this date (YYYY-MM-DD)
    #[arg(long)]
    pub start_date: Option<String>,

    /// Last day of an explicit range (defaults to yesterday)
    #[arg(long, requires = "start_date")]
    pub end_date: Option<String>,

    /// Run the grain validator over every table without loading
    #[arg(long)]
    pub validate_only: bool,

    /// Drop every view before rebuilding
    #[arg(long)]
    pub drop: bool,

    /// Skip the view rebuild after loading
    #[arg(long)]
    pub no_views: bool,

    /// Remove duplicate rows from TABLE, keeping the latest per grain key
    #[arg(long, value_name = "TABLE")]
    pub repair: Option<String>,

    /// Print the run summary or audit report as JSON
    #[arg(long)]
    pub json: bool,

    /// Print the validation report as markdown (with --validate-only)
    #[arg(long, conflicts_with = "json")]
    pub markdown: bool,

    #[arg(long, env = "ADW_DATABASE_URL")]
    pub database_url: Option<String>,

    /// Root directory of the extract dumps
    #[arg(long, env = "ADW_INPUT_DIR")]
    pub input_dir: Option<PathBuf>,

    /// Catalog file replacing the built-in catalog
    #[arg(long, env = "ADW_CATALOG")]
    pub catalog: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    /// Environment configuration with flag overrides applied
    pub fn config(&self) -> Result<IngestConfig> {
        let mut config = IngestConfig::from_env()?;
        if let Some(url) = &self.database_url {
            config.database_url = url.clone();
        }
        if let Some(dir) = &self.input_dir {
            config.input_dir = dir.clone();
        }
        if let Some(path) = &self.catalog {
            config.catalog_path = Some(path.clone());
        }
        config.validate()?;
        Ok(config)
    }

    pub fn selection(&self) -> Result<RangeSelection> {
        if self.lifetime {
            return Ok(RangeSelection::Lifetime);
        }
        if let Some(days) = self.lookback_days {
            return Ok(RangeSelection::Lookback(days));
        }
        match &self.start_date {
            Some(start) => Ok(RangeSelection::Explicit {
                start: parse_date(start)?,
                end: self.end_date.as_deref().map(parse_date).transpose()?,
            }),
            None => Ok(RangeSelection::Default),
        }
    }

    pub fn mode(&self) -> LoadMode {
        if self.lifetime {
            LoadMode::Lifetime
        } else {
            LoadMode::Incremental
        }
    }
}

/// Run the command and return the process exit code
pub async fn execute(cli: &Cli) -> Result<i32> {
    let config = cli.config()?;
    let catalog = match &config.catalog_path {
        Some(path) => Catalog::from_yaml_file(path)?,
        None => Catalog::builtin()?,
    };
    let selection = cli.selection()?;
    let range = DateRange::resolve(
        &selection,
        config.lifetime_start,
        config.default_lookback_days,
        today(),
    )?;

    ensure_parent_dir(&config.database_url)?;
    let warehouse = Warehouse::connect(&config.database_url).await?;
    let orchestrator =
        LoadOrchestrator::new(catalog, warehouse.clone(), &config)?.with_jsonl_extractors(&config.input_dir);

    let code = if let Some(table) = &cli.repair {
        let result = orchestrator.repair(table).await?;
        if cli.json {
            println!("{}", serde_json::to_string_pretty(&result)?);
        } else {
            println!(
                "{}: removed {} duplicate rows ({} -> {})",
                table, result.removed, result.rows_before, result.rows_after
            );
        }
        0
    } else if cli.validate_only {
        let audit = orchestrator.audit().await?;
        if cli.json {
            println!("{}", serde_json::to_string_pretty(&audit)?);
        } else if cli.markdown {
            print!("{}", audit.to_markdown());
        } else {
            print_audit(&audit);
        }
        i32::from(!audit.is_clean())
    } else {
        let options = RunOptions {
            rebuild_views: !cli.no_views,
            drop_views: cli.drop,
        };
        let summary = orchestrator.run(&cli.source, cli.mode(), range, options).await?;
        if cli.json {
            println!("{}", serde_json::to_string_pretty(&summary)?);
        } else {
            print_summary(&summary);
        }
        summary.exit_code()
    };

    warehouse.close().await;
    info!(exit_code = code, "Done");
    Ok(code)
}

/// Map a failed command to its exit code
pub fn exit_code_for(error: &IngestError) -> i32 {
    if error.is_configuration() {
        EXIT_CONFIG
    } else {
        1
    }
}

fn today() -> NaiveDate {
    Local::now().date_naive()
}

/// SQLite creates the file but not its directory
fn ensure_parent_dir(url: &str) -> Result<()> {
    let path = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
        .unwrap_or(url);
    let path = path.split('?').next().unwrap_or(path);
    if path.is_empty() || path.starts_with(":memory:") {
        return Ok(());
    }
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec!["Source", "Range", "Tables", "Rows loaded", "Duplicate groups", "Status"]);

    for source in &summary.sources {
        let status = if source.failed {
            "FAILED"
        } else if source.duplicate_groups() > 0 {
            "VIOLATION"
        } else {
            "ok"
        };
        table.add_row(vec![
            source.name.clone(),
            source.range.to_string(),
            source.tables.len().to_string(),
            source.rows_loaded().to_string(),
            source.duplicate_groups().to_string(),
            status.to_string(),
        ]);
    }

    println!("Run {} ({}, {})", summary.run_id, summary.mode, summary.range);
    println!("{table}");

    for source in summary.failed_sources() {
        for t in source.tables.iter().filter(|t| t.failed()) {
            if let Some(error) = &t.error {
                println!("  {}.{}: {}", source.name, t.table, error);
            }
        }
    }
    if let Some(views) = &summary.views {
        println!(
            "Views: {} created, {} skipped",
            views.created.len(),
            views.skipped.len()
        );
        for view in views.degraded() {
            println!("  {} not built: {}", view.name, view.reason);
        }
    }
    if let Some(error) = &summary.view_error {
        println!("Views: rebuild failed: {}", error);
    }
}

fn print_audit(audit: &AuditReport) {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec!["Table", "Grain", "Rows", "Duplicate groups", "Extra rows", "Status"]);

    for t in &audit.tables {
        let status = if !t.present {
            "missing"
        } else if t.is_clean() {
            "ok"
        } else {
            "VIOLATION"
        };
        table.add_row(vec![
            t.table.clone(),
            t.grain.join(", "),
            t.row_count.to_string(),
            t.total_duplicate_groups.to_string(),
            t.extra_rows.to_string(),
            status.to_string(),
        ]);
    }
    println!("{table}");
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_range_flags() {
        let cli = Cli::try_parse_from(["adw-ingest", "--lifetime"]).unwrap();
        assert_eq!(cli.selection().unwrap(), RangeSelection::Lifetime);
        assert_eq!(cli.mode(), LoadMode::Lifetime);

        let cli = Cli::try_parse_from(["adw-ingest", "--lookback-days", "7"]).unwrap();
        assert_eq!(cli.selection().unwrap(), RangeSelection::Lookback(7));
        assert_eq!(cli.mode(), LoadMode::Incremental);

        let cli = Cli::try_parse_from(["adw-ingest", "--start-date", "2024-06-01", "--end-date", "2024-06-07"])
            .unwrap();
        assert!(matches!(cli.selection().unwrap(), RangeSelection::Explicit { end: Some(_), .. }));
    }

    #[test]
    fn test_lifetime_excludes_windows() {
        assert!(Cli::try_parse_from(["adw-ingest", "--lifetime", "--lookback-days", "3"]).is_err());
        assert!(Cli::try_parse_from(["adw-ingest", "--lifetime", "--start-date", "2024-01-01"]).is_err());
        assert!(Cli::try_parse_from(["adw-ingest", "--end-date", "2024-01-01"]).is_err());
    }

    #[test]
    fn test_sources_are_comma_separated() {
        let cli = Cli::try_parse_from(["adw-ingest", "--source", "gads,meta"]).unwrap();
        assert_eq!(cli.source, vec!["gads", "meta"]);
        let cli = Cli::try_parse_from(["adw-ingest"]).unwrap();
        assert_eq!(cli.source, vec!["all"]);
    }

    #[test]
    fn test_malformed_date_is_config_error() {
        let cli = Cli::try_parse_from(["adw-ingest", "--start-date", "06/01/2024"]).unwrap();
        let err = cli.selection().unwrap_err();
        assert_eq!(exit_code_for(&err), EXIT_CONFIG);
    }

    #[test]
    fn test_parent_dir_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("nested/warehouse.db");
        ensure_parent_dir(&format!("sqlite://{}", db.display())).unwrap();
        assert!(dir.path().join("nested").is_dir());
        ensure_parent_dir("sqlite::memory:").unwrap();
    }
}
