//! Grain registry
//!
//! Maps every raw table to the ordered columns that identify one of its rows.
//! The registry is the single source of truth for both the delete predicate of
//! incremental loads and the grouping used by validation. A table without an
//! entry cannot be loaded or validated.

use crate::catalog::Catalog;
use crate::error::{IngestError, Result};
use std::collections::{BTreeMap, BTreeSet};

/// Ordered key columns of one table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grain {
    columns: Vec<String>,
}

impl Grain {
    pub fn new<I, S>(columns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let columns: Vec<String> = columns.into_iter().map(Into::into).collect();
        if columns.is_empty() {
            return Err(IngestError::config("a grain needs at least one column"));
        }
        let mut seen = BTreeSet::new();
        for column in &columns {
            if !seen.insert(column.as_str()) {
                return Err(IngestError::config(format!(
                    "grain column '{}' appears twice",
                    column
                )));
            }
        }
        Ok(Self { columns })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn contains(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

impl std::fmt::Display for Grain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({})", self.columns.join(", "))
    }
}

#[derive(Debug, Clone, Default)]
pub struct GrainRegistry {
    grains: BTreeMap<String, Grain>,
}

impl GrainRegistry {
    pub fn new<I, T, C, S>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (T, C)>,
        T: Into<String>,
        C: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut grains = BTreeMap::new();
        for (table, columns) in entries {
            let table = table.into();
            let grain = Grain::new(columns)
                .map_err(|e| IngestError::config(format!("table '{}': {}", table, e)))?;
            if grains.insert(table.clone(), grain).is_some() {
                return Err(IngestError::config(format!(
                    "grain for '{}' registered twice",
                    table
                )));
            }
        }
        Ok(Self { grains })
    }

    pub fn from_catalog(catalog: &Catalog) -> Result<Self> {
        Self::new(
            catalog
                .tables
                .iter()
                .map(|t| (t.name.clone(), t.grain.clone())),
        )
    }

    pub fn lookup(&self, table: &str) -> Result<&Grain> {
        self.grains
            .get(table)
            .ok_or_else(|| IngestError::UnknownTable(table.to_string()))
    }

    pub fn contains(&self, table: &str) -> bool {
        self.grains.contains_key(table)
    }

    /// Registered tables in sorted order
    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.grains.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.grains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grains.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_returns_ordered_columns() {
        let registry = GrainRegistry::new([("ads_daily", vec!["date", "campaign_id"])]).unwrap();
        let grain = registry.lookup("ads_daily").unwrap();
        assert_eq!(grain.columns(), ["date", "campaign_id"]);
        assert_eq!(grain.to_string(), "(date, campaign_id)");
    }

    #[test]
    fn test_unknown_table_is_an_error() {
        let registry = GrainRegistry::new([("ads_daily", vec!["date"])]).unwrap();
        let err = registry.lookup("ads_hourly").unwrap_err();
        assert!(matches!(err, IngestError::UnknownTable(t) if t == "ads_hourly"));
    }

    #[test]
    fn test_bad_grains_are_rejected() {
        assert!(GrainRegistry::new([("t", Vec::<&str>::new())]).is_err());
        assert!(GrainRegistry::new([("t", vec!["date", "date"])]).is_err());
    }

    #[test]
    fn test_builtin_grains() {
        let registry = GrainRegistry::from_catalog(&Catalog::builtin().unwrap()).unwrap();
        assert_eq!(
            registry.lookup("gads_keywords").unwrap().columns(),
            ["date", "campaign_id", "ad_group_id", "keyword_id"]
        );
        assert_eq!(
            registry.lookup("gsc_query_page").unwrap().columns(),
            ["_dataset", "query", "page"]
        );
        let tables: Vec<&str> = registry.tables().collect();
        let mut sorted = tables.clone();
        sorted.sort_unstable();
        assert_eq!(tables, sorted);
    }
}
