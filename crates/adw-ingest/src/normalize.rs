//! Batch normalizer
//!
//! Turns provider records into a typed [`Batch`] for one destination table.
//! A batch either comes out fully typed with every grain column present, or it
//! is rejected whole and never reaches the store.

use crate::catalog::TableDef;
use crate::error::{IngestError, Result};
use crate::grain::GrainRegistry;
use crate::records::{CanonicalRecord, SourceRecord};
use crate::schema::{clean_column_name, ColumnType, Row, TableSchema, Value, EXTRACTED_AT};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value as Json;
use std::sync::Arc;
use tracing::{debug, instrument};

const NAIVE_TIMESTAMP_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

/// Typed rows bound for one raw table
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub source: String,
    pub table: String,
    pub schema: TableSchema,
    pub rows: Vec<Row>,
    pub extracted_at: DateTime<Utc>,
}

impl Batch {
    pub fn new(
        source: impl Into<String>,
        table: impl Into<String>,
        schema: TableSchema,
        rows: Vec<Row>,
    ) -> Self {
        Self {
            source: source.into(),
            table: table.into(),
            schema,
            rows,
            extracted_at: Utc::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

pub struct Normalizer {
    registry: Arc<GrainRegistry>,
}

impl Normalizer {
    pub fn new(registry: Arc<GrainRegistry>) -> Self {
        Self { registry }
    }

    /// Map provider records to canonical form, then type them against the
    /// table's declared schema (or one inferred from the records).
    #[instrument(skip(self, table, records), fields(table = %table.name, records = records.len()))]
    pub fn normalize(
        &self,
        table: &TableDef,
        records: Vec<SourceRecord>,
        extracted_at: DateTime<Utc>,
    ) -> Result<Batch> {
        let dimensions = table.dimension_names();
        let canonical: Vec<CanonicalRecord> = records
            .into_iter()
            .map(|r| clean_record(r.into_canonical(&dimensions)))
            .collect();

        let schema = table
            .schema()
            .unwrap_or_else(|| TableSchema::infer(&canonical));

        self.normalize_canonical(&table.source, &table.name, &schema, canonical, extracted_at)
    }

    /// Type already-canonical records against `schema`.
    pub fn normalize_canonical(
        &self,
        source: &str,
        table: &str,
        schema: &TableSchema,
        records: Vec<CanonicalRecord>,
        extracted_at: DateTime<Utc>,
    ) -> Result<Batch> {
        let grain = self.registry.lookup(table)?;

        // Nothing extracted: an inferred schema is empty too, so skip the checks.
        if records.is_empty() {
            debug!(table, "No records to normalize");
            return Ok(Batch {
                source: source.to_string(),
                table: table.to_string(),
                schema: schema.clone(),
                rows: Vec::new(),
                extracted_at,
            });
        }

        if let Some(missing) = grain.columns().iter().find(|c| !schema.contains(c)) {
            return Err(IngestError::schema_mismatch(
                table,
                format!("grain column '{}' is not part of the schema", missing),
            ));
        }

        let schema = schema.clone().with_extracted_at();
        let mut rows = Vec::with_capacity(records.len());

        for (index, record) in records.into_iter().enumerate() {
            let mut row = Row::new();
            for column in &schema.columns {
                let raw = record.get(&column.name).unwrap_or(&Json::Null);
                let is_key = grain.contains(&column.name);

                let value = coerce(raw, column.column_type, is_key).ok_or_else(|| {
                    IngestError::UntypeableValue {
                        table: table.to_string(),
                        column: column.name.clone(),
                        value: raw.to_string(),
                        expected: column.column_type.to_string(),
                    }
                })?;

                if is_key && value.is_null() {
                    return Err(IngestError::schema_mismatch(
                        table,
                        format!("record {} has no value for grain column '{}'", index, column.name),
                    ));
                }

                let value = if column.name == EXTRACTED_AT && value.is_null() {
                    Value::Timestamp(extracted_at)
                } else {
                    value
                };
                row.insert(column.name.clone(), value);
            }
            rows.push(row);
        }

        debug!(table, rows = rows.len(), "Normalized batch");

        Ok(Batch {
            source: source.to_string(),
            table: table.to_string(),
            schema,
            rows,
            extracted_at,
        })
    }
}

fn clean_record(record: CanonicalRecord) -> CanonicalRecord {
    record
        .into_iter()
        .map(|(k, v)| (clean_column_name(&k), v))
        .collect()
}

/// Coerce one JSON value. `None` means the value cannot take the type.
fn coerce(raw: &Json, column_type: ColumnType, is_key: bool) -> Option<Value> {
    if let Json::String(s) = raw {
        if s.trim().is_empty() && !(is_key && column_type == ColumnType::String) {
            return Some(Value::Null);
        }
    }

    match (column_type, raw) {
        (_, Json::Null) => Some(Value::Null),

        (ColumnType::Integer, Json::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().and_then(exact_i64))
            .map(Value::Integer),
        (ColumnType::Integer, Json::String(s)) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().and_then(exact_i64))
                .map(Value::Integer)
        },
        (ColumnType::Integer, Json::Bool(b)) => Some(Value::Integer(i64::from(*b))),

        (ColumnType::Float, Json::Number(n)) => n.as_f64().map(Value::Float),
        (ColumnType::Float, Json::String(s)) => s.trim().parse::<f64>().ok().map(Value::Float),

        (ColumnType::String, Json::String(s)) => Some(Value::Text(s.clone())),
        (ColumnType::String, Json::Number(n)) => Some(Value::Text(n.to_string())),
        (ColumnType::String, Json::Bool(b)) => Some(Value::Text(b.to_string())),
        (ColumnType::String, other @ (Json::Array(_) | Json::Object(_))) => {
            Some(Value::Text(other.to_string()))
        },

        (ColumnType::Date, Json::String(s)) => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
            .ok()
            .map(Value::Date),

        (ColumnType::Timestamp, Json::String(s)) => parse_timestamp(s.trim()).map(Value::Timestamp),

        _ => None,
    }
}

/// Whole floats inside the i64 range, e.g. `3.0` or `"1e3"`
pub(crate) fn exact_i64(f: f64) -> Option<i64> {
    const BOUND: f64 = 9_223_372_036_854_775_808.0; // 2^63
    if f.fract() == 0.0 && (-BOUND..BOUND).contains(&f) {
        Some(f as i64)
    } else {
        None
    }
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    // Offsets without a colon, e.g. 2024-01-01T10:00:00+0000
    if let Ok(ts) = DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%z") {
        return Some(ts.with_timezone(&Utc));
    }
    NAIVE_TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::schema::Column;
    use serde_json::json;

    fn registry() -> Arc<GrainRegistry> {
        Arc::new(GrainRegistry::new([("ads_daily", vec!["date", "campaign_id"])]).unwrap())
    }

    fn schema() -> TableSchema {
        TableSchema::new(vec![
            Column::new("date", ColumnType::Date),
            Column::new("campaign_id", ColumnType::Integer),
            Column::new("clicks", ColumnType::Integer),
            Column::new("cost", ColumnType::Float),
            Column::new("campaign_name", ColumnType::String),
        ])
    }

    fn record(v: serde_json::Value) -> CanonicalRecord {
        v.as_object().unwrap().clone()
    }

    fn now() -> DateTime<Utc> {
        "2024-06-02T03:00:00Z".parse().unwrap()
    }

    #[test]
    fn test_values_are_coerced_by_declared_type() {
        let normalizer = Normalizer::new(registry());
        let batch = normalizer
            .normalize_canonical(
                "gads",
                "ads_daily",
                &schema(),
                vec![record(json!({
                    "date": "2024-06-01",
                    "campaign_id": "101",
                    "clicks": 5.0,
                    "cost": "1.5",
                    "campaign_name": "",
                    "ignored": true
                }))],
                now(),
            )
            .unwrap();

        let row = &batch.rows[0];
        assert_eq!(row["date"], Value::Date(NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()));
        assert_eq!(row["campaign_id"], Value::Integer(101));
        assert_eq!(row["clicks"], Value::Integer(5));
        assert_eq!(row["cost"], Value::Float(1.5));
        assert_eq!(row["campaign_name"], Value::Null);
        assert_eq!(row[EXTRACTED_AT], Value::Timestamp(now()));
        assert!(!row.contains_key("ignored"));
    }

    #[test]
    fn test_missing_grain_value_rejects_batch() {
        let normalizer = Normalizer::new(registry());
        let err = normalizer
            .normalize_canonical(
                "gads",
                "ads_daily",
                &schema(),
                vec![
                    record(json!({"date": "2024-06-01", "campaign_id": 101})),
                    record(json!({"date": "2024-06-01", "clicks": 3})),
                ],
                now(),
            )
            .unwrap_err();
        assert!(matches!(err, IngestError::SchemaMismatch { .. }));
    }

    #[test]
    fn test_grain_column_absent_from_schema() {
        let normalizer = Normalizer::new(registry());
        let schema = TableSchema::new(vec![Column::new("date", ColumnType::Date)]);
        let err = normalizer
            .normalize_canonical(
                "gads",
                "ads_daily",
                &schema,
                vec![record(json!({"date": "2024-06-01", "campaign_id": 101}))],
                now(),
            )
            .unwrap_err();
        assert!(matches!(err, IngestError::SchemaMismatch { .. }));
    }

    #[test]
    fn test_no_records_gives_empty_batch() {
        let normalizer = Normalizer::new(registry());
        let batch = normalizer
            .normalize_canonical("gads", "ads_daily", &TableSchema::default(), vec![], now())
            .unwrap();
        assert!(batch.is_empty());
    }

    #[test]
    fn test_untypeable_value() {
        let normalizer = Normalizer::new(registry());
        let err = normalizer
            .normalize_canonical(
                "gads",
                "ads_daily",
                &schema(),
                vec![record(json!({"date": "06/01/2024", "campaign_id": 101}))],
                now(),
            )
            .unwrap_err();
        assert!(matches!(err, IngestError::UntypeableValue { ref column, .. } if column == "date"));
    }

    #[test]
    fn test_integer_out_of_range_is_untypeable() {
        let normalizer = Normalizer::new(registry());
        for clicks in [json!(1e20), json!("1e20"), json!(-1e19), json!(4.5)] {
            let err = normalizer
                .normalize_canonical(
                    "gads",
                    "ads_daily",
                    &schema(),
                    vec![record(json!({"date": "2024-06-01", "campaign_id": 101, "clicks": clicks}))],
                    now(),
                )
                .unwrap_err();
            assert!(matches!(err, IngestError::UntypeableValue { ref column, .. } if column == "clicks"));
        }
    }

    #[test]
    fn test_exact_i64_bounds() {
        assert_eq!(exact_i64(3.0), Some(3));
        assert_eq!(exact_i64(-9_223_372_036_854_775_808.0), Some(i64::MIN));
        assert_eq!(exact_i64(9_223_372_036_854_775_808.0), None);
        assert_eq!(exact_i64(f64::NAN), None);
        assert_eq!(exact_i64(f64::INFINITY), None);
    }

    #[test]
    fn test_unknown_table() {
        let normalizer = Normalizer::new(registry());
        let err = normalizer
            .normalize_canonical("gads", "campaigns", &schema(), vec![], now())
            .unwrap_err();
        assert!(matches!(err, IngestError::UnknownTable(_)));
    }

    #[test]
    fn test_timestamp_formats() {
        assert!(parse_timestamp("2024-01-01T10:00:00+0000").is_some());
        assert!(parse_timestamp("2024-01-01T10:00:00Z").is_some());
        assert!(parse_timestamp("2024-01-01 10:00:00.123").is_some());
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn test_provider_records_through_table_def() {
        let registry = Arc::new(GrainRegistry::new([("gads_lite", vec!["date", "campaign_id"])]).unwrap());
        let table = TableDef {
            name: "gads_lite".to_string(),
            source: "gads".to_string(),
            grain: vec!["date".to_string(), "campaign_id".to_string()],
            columns: vec![],
            dimensions: vec![],
            description: None,
        };
        let records = vec![SourceRecord::from_json(
            crate::records::Provider::Ads,
            json!({"campaign": {"id": 7}, "segments": {"date": "2024-06-01"}, "metrics": {"clicks": 2}}),
        )
        .unwrap()];

        let batch = Normalizer::new(registry).normalize(&table, records, now()).unwrap();
        assert_eq!(batch.rows[0]["campaign_id"], Value::Integer(7));
        assert_eq!(batch.schema.column("date").unwrap().column_type, ColumnType::Date);
        assert!(batch.schema.contains(EXTRACTED_AT));
    }
}
