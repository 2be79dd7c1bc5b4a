//! Derived views: typed, fact and dimension
//!
//! View specs declare what they read. [`ViewPlan`] orders them so every view
//! is created after its inputs, and rejects cycles or dangling references when
//! the catalog is loaded. [`ViewMaterializer`] drops and recreates the planned
//! views as one transaction.
//!
//! Naming contract for consumers:
//!
//! - `{table}_v` typed view over one raw table
//! - `fact_{domain}_{grain}` union of views sharing a canonical column set
//! - `dim_{source}_{entity}` latest row per entity

use crate::error::{IngestError, Result};
use crate::grain::GrainRegistry;
use crate::schema::{ColumnType, EXTRACTED_AT};
use crate::store::{self, quote_ident, quote_literal, Warehouse};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteConnection;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::{info, instrument, warn};

/// Canonical date column of every typed view
pub const DATE_DAY: &str = "date_day";
/// Source tag column of every fact view
pub const PLATFORM: &str = "platform";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ViewSpec {
    Typed(TypedView),
    Fact(FactView),
    Dimension(DimensionView),
}

/// How the raw date column is encoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateFormat {
    /// `20240601`
    Yyyymmdd,
    /// `2024-06-01`, optionally followed by a time part
    Iso,
    /// Already a stored date
    Native,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateDerivation {
    pub column: String,
    pub format: DateFormat,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypedColumn {
    /// Canonical output name
    pub name: String,
    /// Raw column, when it differs from `name`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    /// SQL expression over raw columns, used instead of `source`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expr: Option<String>,
}

impl TypedColumn {
    fn source_column(&self) -> &str {
        self.source.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypedView {
    pub name: String,
    pub table: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<DateDerivation>,
    pub columns: Vec<TypedColumn>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactInput {
    pub view: String,
    pub platform: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactView {
    pub name: String,
    pub inputs: Vec<FactInput>,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionView {
    pub name: String,
    pub table: String,
    pub key: Vec<String>,
    /// Output columns; empty selects every column of the table
    #[serde(default)]
    pub columns: Vec<String>,
}

impl ViewSpec {
    pub fn name(&self) -> &str {
        match self {
            ViewSpec::Typed(v) => &v.name,
            ViewSpec::Fact(v) => &v.name,
            ViewSpec::Dimension(v) => &v.name,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ViewSpec::Typed(_) => "typed",
            ViewSpec::Fact(_) => "fact",
            ViewSpec::Dimension(_) => "dimension",
        }
    }

    /// Views this view reads from
    fn view_inputs(&self) -> Vec<&str> {
        match self {
            ViewSpec::Fact(v) => v.inputs.iter().map(|i| i.view.as_str()).collect(),
            _ => Vec::new(),
        }
    }

    /// Raw table this view reads from
    fn table_input(&self) -> Option<&str> {
        match self {
            ViewSpec::Typed(v) => Some(&v.table),
            ViewSpec::Dimension(v) => Some(&v.table),
            ViewSpec::Fact(_) => None,
        }
    }
}

/// View specs in dependency order
#[derive(Debug, Clone, Default)]
pub struct ViewPlan {
    order: Vec<ViewSpec>,
}

impl ViewPlan {
    pub fn new(specs: &[ViewSpec], registry: &GrainRegistry) -> Result<Self> {
        let mut index: BTreeMap<&str, usize> = BTreeMap::new();
        for (i, spec) in specs.iter().enumerate() {
            if index.insert(spec.name(), i).is_some() {
                return Err(IngestError::view_dependency(format!(
                    "view '{}' is declared twice",
                    spec.name()
                )));
            }
        }

        for spec in specs {
            check_spec(spec, &index, registry)?;
        }

        // Kahn's algorithm, seeded and drained in declaration order.
        let mut indegree: Vec<usize> = specs.iter().map(|s| s.view_inputs().len()).collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); specs.len()];
        for (i, spec) in specs.iter().enumerate() {
            for input in spec.view_inputs() {
                if let Some(&j) = index.get(input) {
                    dependents[j].push(i);
                }
            }
        }

        let mut ready: VecDeque<usize> = (0..specs.len()).filter(|&i| indegree[i] == 0).collect();
        let mut order = Vec::with_capacity(specs.len());
        while let Some(i) = ready.pop_front() {
            order.push(specs[i].clone());
            for &d in &dependents[i] {
                indegree[d] -= 1;
                if indegree[d] == 0 {
                    ready.push_back(d);
                }
            }
        }

        if order.len() < specs.len() {
            let stuck: Vec<&str> = specs
                .iter()
                .enumerate()
                .filter(|(i, _)| indegree[*i] > 0)
                .map(|(_, s)| s.name())
                .collect();
            return Err(IngestError::view_dependency(format!(
                "cycle between views: {}",
                stuck.join(", ")
            )));
        }

        Ok(Self { order })
    }

    pub fn views(&self) -> &[ViewSpec] {
        &self.order
    }

    pub fn names(&self) -> Vec<&str> {
        self.order.iter().map(ViewSpec::name).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

fn check_spec(spec: &ViewSpec, views: &BTreeMap<&str, usize>, registry: &GrainRegistry) -> Result<()> {
    let name = spec.name();

    if let Some(table) = spec.table_input() {
        if views.contains_key(table) {
            return Err(IngestError::view_dependency(format!(
                "{} view '{}' must read a raw table, '{}' is a view",
                spec.kind(),
                name,
                table
            )));
        }
        if !registry.contains(table) {
            return Err(IngestError::view_dependency(format!(
                "view '{}' reads unknown table '{}'",
                name, table
            )));
        }
    }

    match spec {
        ViewSpec::Typed(v) if v.columns.is_empty() => Err(IngestError::view_dependency(format!(
            "typed view '{}' declares no columns",
            name
        ))),
        ViewSpec::Dimension(v) if v.key.is_empty() => Err(IngestError::view_dependency(format!(
            "dimension view '{}' has no entity key",
            name
        ))),
        ViewSpec::Fact(v) => {
            if v.inputs.len() < 2 || v.columns.is_empty() {
                return Err(IngestError::view_dependency(format!(
                    "fact view '{}' needs at least two inputs and a column list",
                    name
                )));
            }
            for input in &v.inputs {
                if !views.contains_key(input.view.as_str()) {
                    return Err(IngestError::view_dependency(format!(
                        "fact view '{}' reads '{}', which is not a declared view",
                        name, input.view
                    )));
                }
            }
            Ok(())
        },
        _ => Ok(()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedView {
    pub name: String,
    pub reason: String,
    /// Some inputs were built and others were not, so consumers see a gap
    /// rather than a view that simply does not apply yet.
    pub degraded: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaterializeReport {
    pub dropped: Vec<String>,
    pub created: Vec<String>,
    pub skipped: Vec<SkippedView>,
}

impl MaterializeReport {
    pub fn degraded(&self) -> impl Iterator<Item = &SkippedView> {
        self.skipped.iter().filter(|s| s.degraded)
    }
}

/// Why a planned view was not created
struct Skip {
    reason: String,
    degraded: bool,
}

impl Skip {
    fn absent(reason: String) -> Self {
        Self {
            reason,
            degraded: false,
        }
    }
}

pub struct ViewMaterializer {
    warehouse: Warehouse,
}

impl ViewMaterializer {
    pub fn new(warehouse: Warehouse) -> Self {
        Self { warehouse }
    }

    /// Drop and recreate every planned view. With `drop_existing`, every view
    /// in the store is dropped first, planned or not.
    #[instrument(skip(self, plan), fields(views = plan.views().len()))]
    pub async fn rebuild(&self, plan: &ViewPlan, drop_existing: bool) -> Result<MaterializeReport> {
        let mut tx = self.warehouse.pool().begin().await?;
        let mut report = MaterializeReport::default();

        let to_drop: Vec<String> = if drop_existing {
            store::list_objects(&mut tx, "view").await?
        } else {
            plan.names().into_iter().rev().map(str::to_string).collect()
        };
        for name in to_drop {
            if store::object_exists(&mut tx, "view", &name).await? {
                let sql = format!("DROP VIEW IF EXISTS {}", quote_ident(&name));
                sqlx::query(&sql).execute(&mut *tx).await?;
                report.dropped.push(name);
            }
        }

        let mut created: BTreeSet<String> = BTreeSet::new();
        for spec in plan.views() {
            match build_sql(&mut tx, spec, &created).await? {
                Ok(sql) => {
                    sqlx::query(&sql).execute(&mut *tx).await?;
                    created.insert(spec.name().to_string());
                    report.created.push(spec.name().to_string());
                },
                Err(skip) => {
                    warn!(view = spec.name(), reason = %skip.reason, degraded = skip.degraded, "Skipping view");
                    report.skipped.push(SkippedView {
                        name: spec.name().to_string(),
                        reason: skip.reason,
                        degraded: skip.degraded,
                    });
                },
            }
        }

        tx.commit().await?;
        info!(
            created = report.created.len(),
            skipped = report.skipped.len(),
            degraded = report.degraded().count(),
            dropped = report.dropped.len(),
            "Views rebuilt"
        );
        Ok(report)
    }
}

/// SQL for one view, or why it cannot be built against this store
async fn build_sql(
    conn: &mut SqliteConnection,
    spec: &ViewSpec,
    created: &BTreeSet<String>,
) -> Result<std::result::Result<String, Skip>> {
    match spec {
        ViewSpec::Typed(v) => {
            let columns = column_names(conn, &v.table).await?;
            if columns.is_empty() {
                return Ok(Err(Skip::absent(format!("table '{}' has not been loaded", v.table))));
            }
            Ok(Ok(typed_sql(v, &columns)))
        },
        ViewSpec::Dimension(v) => {
            let columns = column_names(conn, &v.table).await?;
            if columns.is_empty() {
                return Ok(Err(Skip::absent(format!("table '{}' has not been loaded", v.table))));
            }
            Ok(Ok(dimension_sql(v, &columns)))
        },
        ViewSpec::Fact(v) => {
            let missing: Vec<&str> = v
                .inputs
                .iter()
                .filter(|i| !created.contains(&i.view))
                .map(|i| i.view.as_str())
                .collect();
            if !missing.is_empty() {
                return Ok(Err(Skip {
                    reason: format!("input views not built: {}", missing.join(", ")),
                    degraded: missing.len() < v.inputs.len(),
                }));
            }

            let mut inputs = Vec::with_capacity(v.inputs.len());
            for input in &v.inputs {
                inputs.push((input, column_names(conn, &input.view).await?));
            }
            Ok(Ok(fact_sql(v, &inputs)))
        },
    }
}

async fn column_names(conn: &mut SqliteConnection, relation: &str) -> Result<BTreeSet<String>> {
    Ok(store::table_columns(conn, relation)
        .await?
        .into_iter()
        .map(|c| c.name)
        .collect())
}

fn date_expr(derivation: &DateDerivation) -> String {
    let col = quote_ident(&derivation.column);
    match derivation.format {
        DateFormat::Yyyymmdd => {
            let text = format!("CAST({} AS TEXT)", col);
            format!(
                "date(substr({t}, 1, 4) || '-' || substr({t}, 5, 2) || '-' || substr({t}, 7, 2))",
                t = text
            )
        },
        DateFormat::Iso => format!("date(substr(CAST({} AS TEXT), 1, 10))", col),
        DateFormat::Native => format!("date({})", col),
    }
}

fn cast_expr(source: &str, column_type: ColumnType) -> String {
    match column_type {
        ColumnType::Date => format!("date({})", source),
        other => format!("CAST({} AS {})", source, other.sql_type()),
    }
}

pub fn typed_sql(view: &TypedView, table_columns: &BTreeSet<String>) -> String {
    let mut select = Vec::with_capacity(view.columns.len() + 1);

    if let Some(derivation) = &view.date {
        let expr = if table_columns.contains(&derivation.column) {
            date_expr(derivation)
        } else {
            "NULL".to_string()
        };
        select.push(format!("{} AS {}", expr, quote_ident(DATE_DAY)));
    }

    for column in &view.columns {
        let source = match &column.expr {
            Some(expr) => format!("({})", expr),
            None if table_columns.contains(column.source_column()) => {
                quote_ident(column.source_column())
            },
            None => "NULL".to_string(),
        };
        select.push(format!(
            "{} AS {}",
            cast_expr(&source, column.column_type),
            quote_ident(&column.name)
        ));
    }

    format!(
        "CREATE VIEW {} AS SELECT {} FROM {}",
        quote_ident(&view.name),
        select.join(", "),
        quote_ident(&view.table)
    )
}

pub fn fact_sql(view: &FactView, inputs: &[(&FactInput, BTreeSet<String>)]) -> String {
    let branches: Vec<String> = inputs
        .iter()
        .map(|(input, available)| {
            let mut select = vec![format!(
                "{} AS {}",
                quote_literal(&input.platform),
                quote_ident(PLATFORM)
            )];
            for column in &view.columns {
                if available.contains(column) {
                    select.push(quote_ident(column));
                } else {
                    select.push(format!("NULL AS {}", quote_ident(column)));
                }
            }
            format!("SELECT {} FROM {}", select.join(", "), quote_ident(&input.view))
        })
        .collect();

    format!(
        "CREATE VIEW {} AS {}",
        quote_ident(&view.name),
        branches.join(" UNION ALL ")
    )
}

pub fn dimension_sql(view: &DimensionView, table_columns: &BTreeSet<String>) -> String {
    let select = if view.columns.is_empty() {
        table_columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ")
    } else {
        view.columns
            .iter()
            .map(|c| {
                if table_columns.contains(c) {
                    quote_ident(c)
                } else {
                    format!("NULL AS {}", quote_ident(c))
                }
            })
            .collect::<Vec<_>>()
            .join(", ")
    };

    let partition = view
        .key
        .iter()
        .map(|k| quote_ident(k))
        .collect::<Vec<_>>()
        .join(", ");
    let order = if table_columns.contains(EXTRACTED_AT) {
        format!("{} DESC NULLS LAST, rowid DESC", quote_ident(EXTRACTED_AT))
    } else {
        "rowid DESC".to_string()
    };

    format!(
        "CREATE VIEW {name} AS SELECT {select} FROM (SELECT *, ROW_NUMBER() OVER \
         (PARTITION BY {partition} ORDER BY {order}) AS \"_rn\" FROM {table}) WHERE \"_rn\" = 1",
        name = quote_ident(&view.name),
        select = select,
        partition = partition,
        order = order,
        table = quote_ident(&view.table)
    )
}
