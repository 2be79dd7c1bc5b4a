//! Column types, typed values and table schemas

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Lineage timestamp column carried by every raw table
pub const EXTRACTED_AT: &str = "extracted_at";

/// Semantic column type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Integer,
    Float,
    String,
    Date,
    Timestamp,
}

impl ColumnType {
    /// Declared SQLite type. Dates and timestamps are stored as ISO text so
    /// they compare lexically.
    pub fn sql_type(self) -> &'static str {
        match self {
            ColumnType::Integer => "INTEGER",
            ColumnType::Float => "REAL",
            ColumnType::String | ColumnType::Date | ColumnType::Timestamp => "TEXT",
        }
    }
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ColumnType::Integer => "integer",
            ColumnType::Float => "float",
            ColumnType::String => "string",
            ColumnType::Date => "date",
            ColumnType::Timestamp => "timestamp",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
}

impl Column {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

/// A single typed cell. Missing data is `Null`, never a zero or empty string.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Integer(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
    Timestamp(DateTime<Utc>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Integer(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Text(v) => f.write_str(v),
            Value::Date(v) => write!(f, "{}", v.format("%Y-%m-%d")),
            Value::Timestamp(v) => f.write_str(&v.to_rfc3339()),
        }
    }
}

/// One row keyed by column name
pub type Row = BTreeMap<String, Value>;

/// Ordered column list of a raw table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub columns: Vec<Column>,
}

impl TableSchema {
    pub fn new(columns: Vec<Column>) -> Self {
        Self { columns }
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Append the lineage timestamp column if the schema lacks it
    pub fn with_extracted_at(mut self) -> Self {
        if !self.contains(EXTRACTED_AT) {
            self.columns
                .push(Column::new(EXTRACTED_AT, ColumnType::Timestamp));
        }
        self
    }

    /// Infer a schema from canonical records.
    ///
    /// Columns appear in first-seen order; each takes the type of its first
    /// non-null value. Columns that are null everywhere become strings.
    pub fn infer<'a, I>(records: I) -> Self
    where
        I: IntoIterator<Item = &'a serde_json::Map<String, serde_json::Value>>,
    {
        let mut order: Vec<String> = Vec::new();
        let mut types: BTreeMap<String, Option<ColumnType>> = BTreeMap::new();

        for record in records {
            for (key, value) in record {
                let name = clean_column_name(key);
                let slot = types.entry(name.clone()).or_insert_with(|| {
                    order.push(name);
                    None
                });
                if slot.is_none() {
                    *slot = infer_type(value);
                }
            }
        }

        let columns = order
            .into_iter()
            .map(|name| {
                let column_type = types
                    .get(&name)
                    .copied()
                    .flatten()
                    .unwrap_or(ColumnType::String);
                Column::new(name, column_type)
            })
            .collect();

        Self { columns }
    }
}

fn infer_type(value: &serde_json::Value) -> Option<ColumnType> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => Some(ColumnType::Integer),
        serde_json::Value::Number(_) => Some(ColumnType::Float),
        serde_json::Value::String(s) if s.is_empty() => None,
        serde_json::Value::String(s) if NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok() => {
            Some(ColumnType::Date)
        },
        _ => Some(ColumnType::String),
    }
}

/// Replace every character outside `[A-Za-z0-9_]` with `_`
pub fn clean_column_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}
