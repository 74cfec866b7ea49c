//! End-to-end pipeline runs through the public API against an in-memory
//! driver: request in, validated/translated/deadlined execution, typed
//! response out.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use sqlgate::{
    BatchSqlRequest, DatabaseKind, DriverError, DriverTransaction, Params, PoolStats, RowSet,
    SqlConfig, SqlDriver, SqlEngine, SqlRequest,
};

/// Fixed-response driver that records every statement it sees.
#[derive(Clone, Default)]
struct RecordingDriver {
    statements: Arc<Mutex<Vec<String>>>,
    rows: RowSet,
}

#[async_trait]
impl SqlDriver for RecordingDriver {
    async fn execute(&self, sql: &str, _args: &[Value]) -> Result<u64, DriverError> {
        self.statements.lock().push(sql.to_string());
        Ok(1)
    }

    async fn query(&self, sql: &str, _args: &[Value]) -> Result<RowSet, DriverError> {
        self.statements.lock().push(sql.to_string());
        Ok(self.rows.clone())
    }

    async fn begin(&self) -> Result<Box<dyn DriverTransaction>, DriverError> {
        Ok(Box::new(RecordingTransaction {
            driver: self.clone(),
        }))
    }

    fn pool_stats(&self) -> PoolStats {
        PoolStats::default()
    }
}

struct RecordingTransaction {
    driver: RecordingDriver,
}

#[async_trait]
impl DriverTransaction for RecordingTransaction {
    async fn execute(&mut self, sql: &str, _args: &[Value]) -> Result<u64, DriverError> {
        self.driver.statements.lock().push(sql.to_string());
        Ok(1)
    }

    async fn commit(self: Box<Self>) -> Result<(), DriverError> {
        self.driver.statements.lock().push("COMMIT".to_string());
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), DriverError> {
        self.driver.statements.lock().push("ROLLBACK".to_string());
        Ok(())
    }
}

fn engine(driver: RecordingDriver, kind: DatabaseKind) -> SqlEngine {
    let config = SqlConfig {
        allowed_tables: vec!["items".to_string(), "orders".to_string()],
        ..SqlConfig::default()
    };
    SqlEngine::new(Arc::new(driver), kind, config).unwrap()
}

fn sample_rows() -> RowSet {
    let mut row = Params::new();
    row.insert("id".to_string(), json!(1));
    row.insert("name".to_string(), json!("alpha"));
    RowSet {
        columns: vec!["id".to_string(), "name".to_string()],
        rows: vec![row],
    }
}

#[tokio::test]
async fn structured_read_round_trip() {
    let driver = RecordingDriver {
        rows: sample_rows(),
        ..RecordingDriver::default()
    };
    let statements = driver.statements.clone();
    let engine = engine(driver, DatabaseKind::Postgres);

    let request: SqlRequest = serde_json::from_value(json!({
        "database_type": "postgres",
        "query": {
            "table": "items",
            "action": "select",
            "fields": ["id", "name"],
            "where": {"active": true}
        },
        "pagination": {"page": 1, "page_size": 20}
    }))
    .unwrap();

    let response = engine.execute_query(&request).await.unwrap();
    assert!(response.success);
    assert_eq!(response.total, 1);
    assert_eq!(response.columns, vec!["id", "name"]);
    assert_eq!(response.data[0]["name"], json!("alpha"));
    assert_eq!(response.page_size, Some(20));

    assert_eq!(
        statements.lock()[0],
        "SELECT id, name FROM items WHERE active = $1 LIMIT 20"
    );
}

#[tokio::test]
async fn pagination_is_idempotent_over_repeated_requests() {
    let driver = RecordingDriver {
        rows: sample_rows(),
        ..RecordingDriver::default()
    };
    let engine = engine(driver, DatabaseKind::Postgres);

    let request: SqlRequest = serde_json::from_value(json!({
        "database_type": "postgres",
        "sql": "SELECT id, name FROM items",
        "pagination": {"page": 1, "page_size": 5}
    }))
    .unwrap();

    let first = engine.execute_query(&request).await.unwrap();
    let second = engine.execute_query(&request).await.unwrap();
    assert_eq!(first.total, second.total);
    assert_eq!(first.data.len(), second.data.len());
}

#[tokio::test]
async fn transactional_batch_walks_begin_exec_commit() {
    let driver = RecordingDriver::default();
    let statements = driver.statements.clone();
    let engine = engine(driver, DatabaseKind::Postgres);

    let request: BatchSqlRequest = serde_json::from_value(json!({
        "database_type": "postgres",
        "operations": [
            {
                "database_type": "postgres",
                "query": {
                    "table": "items",
                    "action": "insert",
                    "data": {"sku": "A", "name": "Alpha"}
                }
            },
            {
                "database_type": "postgres",
                "query": {
                    "table": "items",
                    "action": "update",
                    "data": {"name": "Beta"},
                    "where": {"sku": "A"}
                }
            }
        ],
        "transactional": true
    }))
    .unwrap();

    let response = engine.execute_batch(&request).await.unwrap();
    assert!(response.success);
    assert_eq!(response.executed_count, 2);
    assert_eq!(response.failed_count, 0);
    assert_eq!(response.total_affected_rows, 2);

    let seen = statements.lock();
    assert_eq!(seen.len(), 3);
    assert_eq!(seen[0], "INSERT INTO items (sku, name) VALUES ($1, $2)");
    assert_eq!(seen[1], "UPDATE items SET name = $1 WHERE sku = $2");
    assert_eq!(seen[2], "COMMIT");
}

#[tokio::test]
async fn denied_tables_never_reach_the_driver() {
    let driver = RecordingDriver::default();
    let statements = driver.statements.clone();
    let engine = engine(driver, DatabaseKind::Postgres);

    let request: SqlRequest = serde_json::from_value(json!({
        "database_type": "postgres",
        "sql": "SELECT * FROM users"
    }))
    .unwrap();

    let err = engine.execute_query(&request).await.unwrap_err();
    assert_eq!(err.code(), 4003);
    assert!(err.details().unwrap().contains("users"));
    assert!(statements.lock().is_empty());
}

#[tokio::test]
async fn oracle_structured_write_uses_named_placeholders() {
    let driver = RecordingDriver::default();
    let statements = driver.statements.clone();
    let engine = engine(driver, DatabaseKind::Oracle);

    let request: SqlRequest = serde_json::from_value(json!({
        "database_type": "oracle",
        "query": {
            "table": "items",
            "action": "update",
            "data": {"name": "Gamma"},
            "where": {"id": 9}
        }
    }))
    .unwrap();

    let response = engine.execute_sql(&request).await.unwrap();
    assert!(response.success);
    assert_eq!(response.affected_rows, 1);
    assert_eq!(
        statements.lock()[0],
        "UPDATE items SET name = :param_1 WHERE id = :param_2"
    );
}
