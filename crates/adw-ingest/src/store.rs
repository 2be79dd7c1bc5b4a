//! SQLite-backed analytical store
//!
//! The warehouse is single-writer: the pool holds exactly one connection, so a
//! transaction opened by one component owns the whole store until it commits
//! or rolls back. Code running inside a transaction must use that
//! transaction's connection, never the pool.

use crate::error::Result;
use crate::schema::{Row, Value};
use chrono::SecondsFormat;
use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions,
    SqliteRow,
};
use sqlx::{Row as _, Sqlite, TypeInfo, ValueRef};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

/// Tables owned by the engine itself. Never validated or listed as raw tables.
pub const INTERNAL_TABLES: &[&str] = &["_lineage", "_sqlx_migrations"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub declared_type: String,
}

#[derive(Clone)]
pub struct Warehouse {
    pool: SqlitePool,
}

impl Warehouse {
    /// Open (creating if needed) the store at `url` and apply migrations.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        info!(url, "Warehouse opened");
        Ok(Self { pool })
    }

    /// Private in-memory store. Lives as long as the returned handle.
    pub async fn in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:").await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn table_exists(&self, name: &str) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        object_exists(&mut conn, "table", name).await
    }

    pub async fn view_exists(&self, name: &str) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        object_exists(&mut conn, "view", name).await
    }

    pub async fn table_columns(&self, name: &str) -> Result<Vec<ColumnInfo>> {
        let mut conn = self.pool.acquire().await?;
        table_columns(&mut conn, name).await
    }

    pub async fn row_count(&self, name: &str) -> Result<i64> {
        let mut conn = self.pool.acquire().await?;
        row_count(&mut conn, name).await
    }

    /// Raw tables present in the store, excluding engine-internal ones
    pub async fn list_tables(&self) -> Result<Vec<String>> {
        let mut conn = self.pool.acquire().await?;
        let names = list_objects(&mut conn, "table").await?;
        Ok(names
            .into_iter()
            .filter(|n| !INTERNAL_TABLES.contains(&n.as_str()))
            .collect())
    }

    pub async fn list_views(&self) -> Result<Vec<String>> {
        let mut conn = self.pool.acquire().await?;
        list_objects(&mut conn, "view").await
    }

    /// Run a read query and decode every row dynamically
    pub async fn fetch_rows(&self, sql: &str) -> Result<Vec<Row>> {
        let rows = sqlx::query(sql).fetch_all(&self.pool).await?;
        Ok(rows.iter().map(decode_row).collect())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

pub async fn object_exists(conn: &mut SqliteConnection, kind: &str, name: &str) -> Result<bool> {
    let row = sqlx::query(
        r#"
        SELECT COUNT(*) AS count FROM sqlite_master WHERE type = ?1 AND name = ?2
        "#,
    )
    .bind(kind)
    .bind(name)
    .fetch_one(&mut *conn)
    .await?;

    let count: i64 = row.get("count");
    Ok(count > 0)
}

pub async fn list_objects(conn: &mut SqliteConnection, kind: &str) -> Result<Vec<String>> {
    let rows = sqlx::query(
        r#"
        SELECT name FROM sqlite_master
        WHERE type = ?1 AND name NOT LIKE 'sqlite_%'
        ORDER BY name
        "#,
    )
    .bind(kind)
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows.iter().map(|r| r.get::<String, _>("name")).collect())
}

/// Columns of a table or view in declaration order
pub async fn table_columns(conn: &mut SqliteConnection, name: &str) -> Result<Vec<ColumnInfo>> {
    let rows = sqlx::query("SELECT name, type FROM pragma_table_info(?1) ORDER BY cid")
        .bind(name)
        .fetch_all(&mut *conn)
        .await?;

    Ok(rows
        .iter()
        .map(|r| ColumnInfo {
            name: r.get("name"),
            declared_type: r.get("type"),
        })
        .collect())
}

pub async fn row_count(conn: &mut SqliteConnection, name: &str) -> Result<i64> {
    let sql = format!("SELECT COUNT(*) AS count FROM {}", quote_ident(name));
    let row = sqlx::query(&sql).fetch_one(&mut *conn).await?;
    Ok(row.get("count"))
}

/// Quote an identifier for interpolation into SQL text
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a string literal for interpolation into SQL text
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Timestamps are stored as fixed-width RFC 3339 so text order is time order.
pub fn timestamp_text(ts: &chrono::DateTime<chrono::Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Bind a typed value to a runtime query
pub fn bind_value<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &Value,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Integer(v) => query.bind(*v),
        Value::Float(v) => query.bind(*v),
        Value::Text(v) => query.bind(v.clone()),
        Value::Date(d) => query.bind(d.format("%Y-%m-%d").to_string()),
        Value::Timestamp(ts) => query.bind(timestamp_text(ts)),
    }
}

/// Push a typed value onto a `QueryBuilder` values list
pub fn push_value(
    builder: &mut sqlx::query_builder::Separated<'_, '_, Sqlite, &'static str>,
    value: &Value,
) {
    match value {
        Value::Null => builder.push_bind(None::<String>),
        Value::Integer(v) => builder.push_bind(*v),
        Value::Float(v) => builder.push_bind(*v),
        Value::Text(v) => builder.push_bind(v.clone()),
        Value::Date(d) => builder.push_bind(d.format("%Y-%m-%d").to_string()),
        Value::Timestamp(ts) => builder.push_bind(timestamp_text(ts)),
    };
}

/// Decode a row without knowing its shape. Storage classes map to
/// integer, float or text values; blobs are read as lossy UTF-8.
pub fn decode_row(row: &SqliteRow) -> Row {
    let mut out = Row::new();
    for (index, column) in row.columns().iter().enumerate() {
        let name = sqlx::Column::name(column).to_string();
        out.insert(name, decode_value(row, index));
    }
    out
}

fn decode_value(row: &SqliteRow, index: usize) -> Value {
    let Ok(raw) = row.try_get_raw(index) else {
        return Value::Null;
    };
    if raw.is_null() {
        return Value::Null;
    }
    let type_name = raw.type_info().name().to_string();

    let decoded = match type_name.as_str() {
        "INTEGER" => row.try_get_unchecked::<i64, _>(index).map(Value::Integer),
        "REAL" => row.try_get_unchecked::<f64, _>(index).map(Value::Float),
        "BLOB" => row
            .try_get_unchecked::<Vec<u8>, _>(index)
            .map(|b| Value::Text(String::from_utf8_lossy(&b).into_owned())),
        _ => row.try_get_unchecked::<String, _>(index).map(Value::Text),
    };

    decoded.unwrap_or_else(|e| {
        debug!(error = %e, index, "Undecodable column value");
        Value::Null
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_migrations_create_lineage_table() {
        let warehouse = Warehouse::in_memory().await.unwrap();
        assert!(warehouse.table_exists("_lineage").await.unwrap());
        assert!(warehouse.list_tables().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dynamic_decode() {
        let warehouse = Warehouse::in_memory().await.unwrap();
        let rows = warehouse
            .fetch_rows("SELECT 1 AS i, 2.5 AS f, 'x' AS t, NULL AS n")
            .await
            .unwrap();
        let row = &rows[0];
        assert_eq!(row["i"], Value::Integer(1));
        assert_eq!(row["f"], Value::Float(2.5));
        assert_eq!(row["t"], Value::Text("x".to_string()));
        assert_eq!(row["n"], Value::Null);
    }

    #[tokio::test]
    async fn test_table_introspection() {
        let warehouse = Warehouse::in_memory().await.unwrap();
        sqlx::query(r#"CREATE TABLE "ads daily" (date TEXT, clicks INTEGER)"#)
            .execute(warehouse.pool())
            .await
            .unwrap();

        let columns = warehouse.table_columns("ads daily").await.unwrap();
        assert_eq!(columns.len(), 2);
        assert_eq!(columns[1].declared_type, "INTEGER");
        assert_eq!(warehouse.row_count("ads daily").await.unwrap(), 0);
        assert_eq!(warehouse.list_tables().await.unwrap(), vec!["ads daily".to_string()]);
    }

    #[test]
    fn test_quoting() {
        assert_eq!(quote_ident(r#"a"b"#), r#""a""b""#);
        assert_eq!(quote_literal("it's"), "'it''s'");
    }
}
