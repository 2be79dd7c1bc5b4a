//! Runtime configuration
//!
//! Built once at startup from environment variables (after loading `.env`),
//! then overridden by CLI flags and passed around by reference.

use crate::error::{IngestError, Result};
use crate::retry::RetryPolicy;
use adw_common::date_range::parse_date;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://data/warehouse.db";
pub const DEFAULT_INPUT_DIR: &str = "./data/extracts";
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 2000;
pub const DEFAULT_SAMPLE_LIMIT: usize = 5;
pub const DEFAULT_LIFETIME_START: &str = "2020-01-01";
pub const DEFAULT_LOOKBACK_DAYS: u32 = 30;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestConfig {
    pub database_url: String,
    /// Root of the extract dumps, one subdirectory per source
    pub input_dir: PathBuf,
    /// Catalog file replacing the built-in catalog
    pub catalog_path: Option<PathBuf>,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    /// Sample rows kept per duplicate group
    pub sample_limit: usize,
    /// Lifetime start for sources that do not declare their own
    pub lifetime_start: NaiveDate,
    pub default_lookback_days: u32,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            input_dir: PathBuf::from(DEFAULT_INPUT_DIR),
            catalog_path: None,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            sample_limit: DEFAULT_SAMPLE_LIMIT,
            lifetime_start: NaiveDate::from_ymd_opt(2020, 1, 1).unwrap_or(NaiveDate::MIN),
            default_lookback_days: DEFAULT_LOOKBACK_DAYS,
        }
    }
}

impl IngestConfig {
    /// Load configuration from the environment, reading `.env` first if present
    ///
    /// - `ADW_DATABASE_URL`
    /// - `ADW_INPUT_DIR`
    /// - `ADW_CATALOG`
    /// - `ADW_MAX_RETRIES`
    /// - `ADW_RETRY_DELAY_MS`
    /// - `ADW_SAMPLE_LIMIT`
    /// - `ADW_LIFETIME_START` (YYYY-MM-DD)
    /// - `ADW_DEFAULT_LOOKBACK_DAYS`
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        Self::default().with_env()
    }

    /// Apply environment overrides on top of `self`
    pub fn with_env(mut self) -> Result<Self> {
        if let Ok(url) = std::env::var("ADW_DATABASE_URL") {
            self.database_url = url;
        }
        if let Ok(dir) = std::env::var("ADW_INPUT_DIR") {
            self.input_dir = PathBuf::from(dir);
        }
        if let Ok(path) = std::env::var("ADW_CATALOG") {
            if !path.trim().is_empty() {
                self.catalog_path = Some(PathBuf::from(path));
            }
        }
        if let Some(n) = env_parse("ADW_MAX_RETRIES")? {
            self.max_retries = n;
        }
        if let Some(ms) = env_parse("ADW_RETRY_DELAY_MS")? {
            self.retry_delay_ms = ms;
        }
        if let Some(n) = env_parse("ADW_SAMPLE_LIMIT")? {
            self.sample_limit = n;
        }
        if let Ok(date) = std::env::var("ADW_LIFETIME_START") {
            self.lifetime_start = parse_date(&date)?;
        }
        if let Some(days) = env_parse("ADW_DEFAULT_LOOKBACK_DAYS")? {
            self.default_lookback_days = days;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.database_url.trim().is_empty() {
            return Err(IngestError::config("database url must not be empty"));
        }
        if self.max_retries == 0 {
            return Err(IngestError::config("ADW_MAX_RETRIES must be at least 1"));
        }
        if self.default_lookback_days == 0 {
            return Err(IngestError::config("ADW_DEFAULT_LOOKBACK_DAYS must be at least 1"));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, Duration::from_millis(self.retry_delay_ms))
    }
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| IngestError::config(format!("invalid {} '{}': {}", key, raw, e))),
        Err(_) => Ok(None),
    }
}
