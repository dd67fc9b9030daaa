//! SQL execution against the plant database.
//!
//! [`SqlExecutor`] is the boundary the agent and service talk to. A query the
//! database rejects is a normal outcome (`Ok` with `success = false`); only a
//! database that cannot be reached is an `Err`.

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row as _, TypeInfo, ValueRef};

use crate::corpus::SchemaCatalog;
use crate::error::{Result, Text2SqlError};
use crate::models::{ExecutionResult, Row};

#[async_trait]
pub trait SqlExecutor: Send + Sync {
    /// Run `sql` and collect its rows.
    async fn execute(&self, sql: &str) -> Result<ExecutionResult>;
    /// First `limit` rows of a catalog table.
    async fn sample_rows(&self, table: &str, limit: usize) -> Result<Vec<Row>>;
}

/// Stand-in used when no database is configured.
pub struct UnavailableExecutor;

#[async_trait]
impl SqlExecutor for UnavailableExecutor {
    async fn execute(&self, _sql: &str) -> Result<ExecutionResult> {
        Err(Text2SqlError::Execution(
            "no database configured; set [database] path".into(),
        ))
    }

    async fn sample_rows(&self, _table: &str, _limit: usize) -> Result<Vec<Row>> {
        Err(Text2SqlError::Execution(
            "no database configured; set [database] path".into(),
        ))
    }
}

/// Read-only SQLite executor.
pub struct SqliteExecutor {
    pool: SqlitePool,
    catalog: SchemaCatalog,
    max_rows: usize,
}

impl SqliteExecutor {
    /// Open `path` read-only. The file must already exist.
    pub async fn connect(path: &Path, catalog: SchemaCatalog, max_rows: usize) -> Result<Self> {
        if !path.exists() {
            return Err(Text2SqlError::Configuration(format!(
                "database file not found: {}",
                path.display()
            )));
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .map_err(|e| Text2SqlError::Configuration(format!("invalid database path: {}", e)))?
            .read_only(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| {
                Text2SqlError::Configuration(format!(
                    "cannot open database {}: {}",
                    path.display(),
                    e
                ))
            })?;

        tracing::info!(path = %path.display(), "database opened read-only");
        Ok(Self::from_pool(pool, catalog, max_rows))
    }

    pub fn from_pool(pool: SqlitePool, catalog: SchemaCatalog, max_rows: usize) -> Self {
        Self {
            pool,
            catalog,
            max_rows: max_rows.max(1),
        }
    }
}

#[async_trait]
impl SqlExecutor for SqliteExecutor {
    async fn execute(&self, sql: &str) -> Result<ExecutionResult> {
        match sqlx::query(sql).fetch_all(&self.pool).await {
            Ok(rows) => {
                let total = rows.len();
                let data: Vec<Row> = rows.iter().take(self.max_rows).map(decode_row).collect();
                if total > data.len() {
                    tracing::warn!(total, kept = data.len(), "result truncated to max_rows");
                    return Ok(ExecutionResult::truncated(data, total));
                }
                Ok(ExecutionResult::rows(data))
            }
            Err(e) if is_outage(&e) => Err(Text2SqlError::Execution(e.to_string())),
            Err(e) => {
                tracing::debug!(error = %e, "query rejected by database");
                Ok(ExecutionResult::failure(e.to_string()))
            }
        }
    }

    async fn sample_rows(&self, table: &str, limit: usize) -> Result<Vec<Row>> {
        if !self.catalog.has_table(table) {
            return Err(Text2SqlError::Execution(format!(
                "table {} is not in the schema catalog",
                table
            )));
        }
        let sql = format!("SELECT * FROM \"{}\" LIMIT {}", table, limit);
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Text2SqlError::Execution(format!("sampling {}: {}", table, e)))?;
        Ok(rows.iter().map(decode_row).collect())
    }
}

/// Connection-level failures, as opposed to errors in the statement itself.
fn is_outage(e: &sqlx::Error) -> bool {
    matches!(
        e,
        sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Tls(_)
            | sqlx::Error::Configuration(_)
    )
}

/// Decode a row by each value's runtime storage class.
fn decode_row(row: &SqliteRow) -> Row {
    let mut out = Row::new();
    for (i, column) in row.columns().iter().enumerate() {
        out.insert(column.name().to_string(), decode_value(row, i));
    }
    out
}

fn decode_value(row: &SqliteRow, i: usize) -> serde_json::Value {
    let type_name = match row.try_get_raw(i) {
        Ok(raw) if raw.is_null() => return serde_json::Value::Null,
        Ok(raw) => raw.type_info().name().to_string(),
        Err(_) => return serde_json::Value::Null,
    };

    match type_name.as_str() {
        "INTEGER" | "BOOLEAN" => row
            .try_get::<i64, _>(i)
            .map(serde_json::Value::from)
            .unwrap_or(serde_json::Value::Null),
        "REAL" => row
            .try_get::<f64, _>(i)
            .map(serde_json::Value::from)
            .unwrap_or(serde_json::Value::Null),
        "BLOB" => row
            .try_get::<Vec<u8>, _>(i)
            .map(|b| serde_json::Value::String(hex::encode(b)))
            .unwrap_or(serde_json::Value::Null),
        _ => row
            .try_get::<String, _>(i)
            .map(serde_json::Value::String)
            .unwrap_or(serde_json::Value::Null),
    }
}
