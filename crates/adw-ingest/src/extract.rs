//! Extractors: where raw provider records come from
//!
//! The engine only depends on the [`Extractor`] trait. Provider API clients are
//! out of tree; the bundled [`JsonlExtractor`] reads extract dumps written by
//! them, one JSON object per line.

use crate::records::{Provider, SourceRecord};
use adw_common::DateRange;
use async_trait::async_trait;
use serde_json::Value as Json;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExtractError {
    /// Worth another attempt: timeouts, rate limits, flaky IO
    #[error("transient extraction error: {0}")]
    Transient(String),

    /// Retrying will not help: bad credentials, malformed payloads
    #[error("extraction error: {0}")]
    Permanent(String),
}

impl ExtractError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Transient(m) | Self::Permanent(m) => m,
        }
    }
}

/// Pulls raw records for one source, one table at a time
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Source name this extractor serves
    fn source(&self) -> &str;

    async fn extract(&self, table: &str, range: &DateRange) -> Result<Vec<SourceRecord>, ExtractError>;
}

/// Reads `{input_dir}/{source}/{table}.jsonl`.
///
/// A missing file yields no records. The dump is trusted to cover the requested
/// range; rows are not filtered by date.
pub struct JsonlExtractor {
    input_dir: PathBuf,
    source: String,
    provider: Provider,
}

impl JsonlExtractor {
    pub fn new(input_dir: impl Into<PathBuf>, source: impl Into<String>, provider: Provider) -> Self {
        Self {
            input_dir: input_dir.into(),
            source: source.into(),
            provider,
        }
    }

    pub fn path_for(&self, table: &str) -> PathBuf {
        self.input_dir
            .join(&self.source)
            .join(format!("{}.jsonl", table))
    }
}

#[async_trait]
impl Extractor for JsonlExtractor {
    fn source(&self) -> &str {
        &self.source
    }

    async fn extract(&self, table: &str, range: &DateRange) -> Result<Vec<SourceRecord>, ExtractError> {
        let path = self.path_for(table);
        let provider = self.provider;
        debug!(path = %path.display(), range = %range, "Reading extract dump");

        let records = tokio::task::spawn_blocking(move || read_dump(&path, provider))
            .await
            .map_err(|e| ExtractError::Transient(format!("reader task failed: {}", e)))??;

        info!(source = %self.source, table, records = records.len(), "Extracted records");
        Ok(records)
    }
}

fn read_dump(path: &Path, provider: Provider) -> Result<Vec<SourceRecord>, ExtractError> {
    let lines = match serde_jsonlines::json_lines::<Json, _>(path) {
        Ok(lines) => lines,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!(path = %path.display(), "No extract dump, treating as empty");
            return Ok(Vec::new());
        },
        Err(e) => return Err(io_error(path, e)),
    };

    let mut records = Vec::new();
    for (index, line) in lines.enumerate() {
        let value = line.map_err(|e| io_error(path, e))?;
        let record = SourceRecord::from_json(provider, value).map_err(|e| {
            ExtractError::Permanent(format!("{} line {}: {}", path.display(), index + 1, e))
        })?;
        records.push(record);
    }
    Ok(records)
}

fn io_error(path: &Path, e: std::io::Error) -> ExtractError {
    let message = format!("{}: {}", path.display(), e);
    match e.kind() {
        ErrorKind::InvalidData | ErrorKind::UnexpectedEof => ExtractError::Permanent(message),
        _ => ExtractError::Transient(message),
    }
}

type Scripted = Result<Vec<SourceRecord>, ExtractError>;

/// In-memory extractor with scripted responses per table.
///
/// Each table holds a queue of responses; calls pop from the front, and the
/// last response repeats once the queue is down to one.
pub struct MemoryExtractor {
    source: String,
    responses: Mutex<BTreeMap<String, Vec<Scripted>>>,
    calls: Mutex<Vec<String>>,
}

impl MemoryExtractor {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            responses: Mutex::new(BTreeMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_records(self, table: &str, records: Vec<SourceRecord>) -> Self {
        self.push(table, Ok(records))
    }

    pub fn with_error(self, table: &str, error: ExtractError) -> Self {
        self.push(table, Err(error))
    }

    fn push(self, table: &str, response: Scripted) -> Self {
        if let Ok(mut responses) = self.responses.lock() {
            responses.entry(table.to_string()).or_default().push(response);
        }
        self
    }

    /// Tables requested so far, in call order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Extractor for MemoryExtractor {
    fn source(&self) -> &str {
        &self.source
    }

    async fn extract(&self, table: &str, _range: &DateRange) -> Result<Vec<SourceRecord>, ExtractError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(table.to_string());
        }
        let mut responses = self
            .responses
            .lock()
            .map_err(|_| ExtractError::Permanent("extractor state poisoned".into()))?;
        match responses.get_mut(table) {
            Some(queue) if queue.len() > 1 => Ok(queue.remove(0)?),
            Some(queue) => queue.first().cloned().unwrap_or_else(|| Ok(Vec::new())),
            None => Ok(Vec::new()),
        }
    }
}
