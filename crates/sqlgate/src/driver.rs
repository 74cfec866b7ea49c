//! Backend driver abstraction.
//!
//! The engine is written against [`SqlDriver`]; [`SqlxDriver`] is the
//! bundled sqlx/AnyPool implementation (PostgreSQL, plus SQLite for local
//! testing). Oracle deployments plug an external implementation into the
//! same trait.

use std::sync::Once;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{Any, AnyPool, Column, Row};
use thiserror::Error;

use crate::model::Params;

/// Error surface the classifier consumes: the raw message plus, when the
/// backend exposes one, its native error code (SQLSTATE / ORA-nnnnn).
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct DriverError {
    pub message: String,
    pub code: Option<String>,
}

impl DriverError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: Some(code.into()),
        }
    }
}

impl From<sqlx::Error> for DriverError {
    fn from(error: sqlx::Error) -> Self {
        match &error {
            sqlx::Error::Database(db_err) => Self {
                message: db_err.message().to_string(),
                code: db_err.code().map(|code| code.to_string()),
            },
            _ => Self::new(error.to_string()),
        }
    }
}

/// Materialized query result: column order from driver metadata, rows as
/// column → value maps.
#[derive(Debug, Clone, Default)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<Params>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    pub size: u32,
    pub idle: usize,
}

/// Handle to one backend database pool.
#[async_trait]
pub trait SqlDriver: Send + Sync {
    async fn execute(&self, sql: &str, args: &[Value]) -> Result<u64, DriverError>;

    async fn query(&self, sql: &str, args: &[Value]) -> Result<RowSet, DriverError>;

    async fn begin(&self) -> Result<Box<dyn DriverTransaction>, DriverError>;

    fn pool_stats(&self) -> PoolStats;
}

/// An open transaction. Implementations MUST roll back on drop when neither
/// `commit` nor `rollback` ran, so a panic mid-batch cannot leave the
/// transaction open.
#[async_trait]
pub trait DriverTransaction: Send {
    async fn execute(&mut self, sql: &str, args: &[Value]) -> Result<u64, DriverError>;

    async fn commit(self: Box<Self>) -> Result<(), DriverError>;

    async fn rollback(self: Box<Self>) -> Result<(), DriverError>;
}

/// sqlx-backed pool over the Any driver.
#[derive(Clone, Debug)]
pub struct SqlxDriver {
    pool: AnyPool,
}

impl SqlxDriver {
    /// Establishes a connection pool for the given URL
    /// (e.g. `postgres://user@host/db`).
    pub async fn connect(database_url: &str) -> Result<Self, DriverError> {
        static DRIVERS: Once = Once::new();
        DRIVERS.call_once(|| {
            sqlx::any::install_default_drivers();
        });

        let max_connections = if database_url.contains(":memory:") { 1 } else { 8 };
        let pool = AnyPoolOptions::new()
            .min_connections(1)
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }
}

#[async_trait]
impl SqlDriver for SqlxDriver {
    async fn execute(&self, sql: &str, args: &[Value]) -> Result<u64, DriverError> {
        let query = bind_all(sqlx::query(sql), args);
        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn query(&self, sql: &str, args: &[Value]) -> Result<RowSet, DriverError> {
        let query = bind_all(sqlx::query(sql), args);
        let rows = query.fetch_all(&self.pool).await?;
        materialize(rows)
    }

    async fn begin(&self) -> Result<Box<dyn DriverTransaction>, DriverError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(SqlxTransaction { tx }))
    }

    fn pool_stats(&self) -> PoolStats {
        PoolStats {
            size: self.pool.size(),
            idle: self.pool.num_idle(),
        }
    }
}

struct SqlxTransaction {
    tx: sqlx::Transaction<'static, Any>,
}

// sqlx rolls an uncommitted transaction back when it is dropped.
#[async_trait]
impl DriverTransaction for SqlxTransaction {
    async fn execute(&mut self, sql: &str, args: &[Value]) -> Result<u64, DriverError> {
        let query = bind_all(sqlx::query(sql), args);
        let result = query.execute(&mut *self.tx).await?;
        Ok(result.rows_affected())
    }

    async fn commit(self: Box<Self>) -> Result<(), DriverError> {
        self.tx.commit().await.map_err(DriverError::from)
    }

    async fn rollback(self: Box<Self>) -> Result<(), DriverError> {
        self.tx.rollback().await.map_err(DriverError::from)
    }
}

type AnyQuery<'q> = sqlx::query::Query<'q, Any, sqlx::any::AnyArguments<'q>>;

fn bind_all<'q>(mut query: AnyQuery<'q>, args: &[Value]) -> AnyQuery<'q> {
    for value in args {
        query = match value {
            Value::Null => query.bind(Option::<String>::None),
            Value::Bool(b) => query.bind(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    query.bind(i)
                } else {
                    query.bind(n.as_f64().unwrap_or_default())
                }
            }
            Value::String(s) => query.bind(s.clone()),
            // arrays and objects travel as their JSON text
            other => query.bind(other.to_string()),
        };
    }
    query
}

fn materialize(rows: Vec<AnyRow>) -> Result<RowSet, DriverError> {
    let mut set = RowSet::default();

    if let Some(first) = rows.first() {
        set.columns = first
            .columns()
            .iter()
            .map(|column| column.name().to_string())
            .collect();
    }

    for row in &rows {
        let mut record = Params::new();
        for (index, column) in set.columns.iter().enumerate() {
            record.insert(column.clone(), decode_cell(row, index));
        }
        set.rows.push(record);
    }

    Ok(set)
}

/// Best-effort cell decoding across the Any driver's type surface. Byte
/// array cells are normalized to UTF-8 strings.
fn decode_cell(row: &AnyRow, index: usize) -> Value {
    if let Ok(value) = row.try_get::<Option<i64>, _>(index) {
        return match value {
            Some(v) => Value::from(v),
            None => Value::Null,
        };
    }
    if let Ok(value) = row.try_get::<Option<f64>, _>(index) {
        return match value {
            Some(v) => Value::from(v),
            None => Value::Null,
        };
    }
    if let Ok(value) = row.try_get::<Option<bool>, _>(index) {
        return match value {
            Some(v) => Value::from(v),
            None => Value::Null,
        };
    }
    if let Ok(value) = row.try_get::<Option<String>, _>(index) {
        return match value {
            Some(v) => Value::from(v),
            None => Value::Null,
        };
    }
    if let Ok(value) = row.try_get::<Option<Vec<u8>>, _>(index) {
        return match value {
            Some(bytes) => Value::from(String::from_utf8_lossy(&bytes).into_owned()),
            None => Value::Null,
        };
    }
    Value::Null
}
