//! Warehouse catalog: sources, raw tables with their grains, and view specs
//!
//! The catalog is read once at startup and never mutated afterwards. The
//! built-in catalog covers the supported providers; a YAML file with the same
//! layout replaces it entirely.

use crate::error::{IngestError, Result};
use crate::records::Provider;
use crate::schema::{Column, TableSchema};
use crate::views::ViewSpec;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

const BUILTIN_CATALOG: &str = include_str!("../catalog/default.yml");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDef {
    pub name: String,
    pub provider: Provider,
    /// First day a lifetime load asks for. Falls back to the configured default.
    #[serde(default)]
    pub lifetime_start: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDef {
    pub name: String,
    pub source: String,
    pub grain: Vec<String>,
    /// Declared columns; empty means the schema is inferred from the first batch
    #[serde(default)]
    pub columns: Vec<Column>,
    /// Names of positional dimension keys (search console `keys`)
    #[serde(default)]
    pub dimensions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl TableDef {
    pub fn schema(&self) -> Option<TableSchema> {
        if self.columns.is_empty() {
            None
        } else {
            Some(TableSchema::new(self.columns.clone()))
        }
    }

    /// Positional dimension names, defaulting to the grain minus the dataset tag
    pub fn dimension_names(&self) -> Vec<&str> {
        let names = if self.dimensions.is_empty() {
            &self.grain
        } else {
            &self.dimensions
        };
        names
            .iter()
            .map(String::as_str)
            .filter(|n| *n != "_dataset")
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    pub sources: Vec<SourceDef>,
    pub tables: Vec<TableDef>,
    #[serde(default)]
    pub views: Vec<ViewSpec>,
}

impl Catalog {
    pub fn builtin() -> Result<Self> {
        Self::from_yaml_str(BUILTIN_CATALOG)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let catalog: Catalog = serde_yaml::from_str(yaml)?;
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|e| {
            IngestError::config(format!("cannot read catalog {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&yaml)
    }

    /// Structural checks that do not need the store
    pub fn validate(&self) -> Result<()> {
        let mut sources = BTreeSet::new();
        for source in &self.sources {
            check_identifier("source", &source.name)?;
            if !sources.insert(source.name.as_str()) {
                return Err(IngestError::config(format!(
                    "source '{}' is declared twice",
                    source.name
                )));
            }
        }

        let mut names = BTreeSet::new();
        for table in &self.tables {
            check_identifier("table", &table.name)?;
            if !names.insert(table.name.as_str()) {
                return Err(IngestError::config(format!(
                    "table '{}' is declared twice",
                    table.name
                )));
            }
            if !sources.contains(table.source.as_str()) {
                return Err(IngestError::config(format!(
                    "table '{}' belongs to unknown source '{}'",
                    table.name, table.source
                )));
            }
            if let Some(schema) = table.schema() {
                for key in &table.grain {
                    if !schema.contains(key) {
                        return Err(IngestError::config(format!(
                            "grain column '{}' of table '{}' is not declared",
                            key, table.name
                        )));
                    }
                }
            }
        }

        for view in &self.views {
            check_identifier("view", view.name())?;
            if !names.insert(view.name()) {
                return Err(IngestError::config(format!(
                    "view '{}' collides with another table or view",
                    view.name()
                )));
            }
        }

        Ok(())
    }

    pub fn source(&self, name: &str) -> Option<&SourceDef> {
        self.sources.iter().find(|s| s.name == name)
    }

    pub fn source_names(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn table(&self, name: &str) -> Option<&TableDef> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn tables_for_source<'a>(&'a self, source: &'a str) -> impl Iterator<Item = &'a TableDef> {
        self.tables.iter().filter(move |t| t.source == source)
    }
}

/// Names end up inside quoted identifiers; keep them plain anyway.
fn check_identifier(kind: &str, name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with("sqlite_");
    if valid {
        Ok(())
    } else {
        Err(IngestError::config(format!("invalid {} name '{}'", kind, name)))
    }
}
