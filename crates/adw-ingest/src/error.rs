//! Error types for the ingestion engine
//!
//! Variants line up with how the orchestrator reacts to them: configuration
//! faults abort a run before extraction, normalization faults reject one batch,
//! storage faults roll back one table load, extraction faults fail one source.

use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, IngestError>;

#[derive(Error, Debug)]
pub enum IngestError {
    /// Table has no registered grain. Loads and validation refuse to guess one.
    #[error("Unknown table '{0}': no grain is registered for it")]
    UnknownTable(String),

    /// Batch does not carry the grain columns of its destination
    #[error("Schema mismatch for '{table}': {detail}")]
    SchemaMismatch { table: String, detail: String },

    #[error("Cannot coerce value {value} in '{table}.{column}' to {expected}")]
    UntypeableValue {
        table: String,
        column: String,
        value: String,
        expected: String,
    },

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Invalid view graph: {0}")]
    ViewDependency(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Extraction failed for {source_name}: {message}")]
    Extraction { source_name: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Common(#[from] adw_common::CommonError),
}

impl IngestError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn schema_mismatch(table: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::SchemaMismatch {
            table: table.into(),
            detail: detail.into(),
        }
    }

    pub fn view_dependency(msg: impl Into<String>) -> Self {
        Self::ViewDependency(msg.into())
    }

    /// Errors that must stop a run before any data moves
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::UnknownTable(_)
                | Self::Config(_)
                | Self::ViewDependency(_)
                | Self::Yaml(_)
                | Self::Common(_)
        )
    }
}
