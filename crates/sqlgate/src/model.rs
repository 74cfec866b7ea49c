//! Wire data model for the SQL endpoints.
//!
//! Request attribute maps use `serde_json::Map`, which preserves insertion
//! order (the `preserve_order` build of serde_json). The builder and the
//! raw-parameter binding both rely on that ordering.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

use crate::error::{ErrorPayload, SqlError};

/// Ordered name → scalar mapping used for request parameters and row data.
pub type Params = serde_json::Map<String, Value>;

/// Supported backend databases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseKind {
    Postgres,
    Oracle,
}

impl DatabaseKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DatabaseKind::Postgres => "postgres",
            DatabaseKind::Oracle => "oracle",
        }
    }
}

impl std::fmt::Display for DatabaseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Primary verb of a structured statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Select,
    Insert,
    Update,
    Delete,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Select => "select",
            Action::Insert => "insert",
            Action::Update => "update",
            Action::Delete => "delete",
        }
    }

    /// Permission string checked against the API-key store.
    pub fn permission(self) -> &'static str {
        match self {
            Action::Select => "sql.query",
            Action::Insert => "sql.insert",
            Action::Update => "sql.update",
            Action::Delete => "sql.delete",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    pub fn as_sql(self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ConflictAction {
    Ignore,
    Update,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OrderBy {
    pub field: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<SortOrder>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, ToSchema)]
pub struct Pagination {
    pub page: u32,
    pub page_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Sort {
    pub sort_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_order: Option<SortOrder>,
}

/// JSON description of a statement, translated to SQL by the builder.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StructuredQuery {
    pub table: String,
    pub action: Action,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<String>,
    #[serde(default, rename = "where", skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Object)]
    pub filter: Option<Params>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Object)]
    pub data: Option<Params>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub group_by: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Object)]
    pub having: Option<Params>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub order_by: Vec<OrderBy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
}

/// Single-statement request: exactly one of `sql` or `query`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SqlRequest {
    pub database_type: DatabaseKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<StructuredQuery>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Object)]
    pub params: Option<Params>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pagination: Option<Pagination>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<Sort>,
}

impl SqlRequest {
    /// Verb of the request, derived from the structured action or the first
    /// token of the raw statement. `WITH` counts as a read.
    pub fn action_kind(&self) -> Option<ActionKind> {
        if let Some(sql) = &self.sql {
            let first = sql.split_whitespace().next()?.to_ascii_lowercase();
            return match first.as_str() {
                "select" | "with" => Some(ActionKind::Query),
                "insert" => Some(ActionKind::Insert),
                "update" => Some(ActionKind::Update),
                "delete" => Some(ActionKind::Delete),
                _ => None,
            };
        }
        self.query.as_ref().map(|query| match query.action {
            Action::Select => ActionKind::Query,
            Action::Insert => ActionKind::Insert,
            Action::Update => ActionKind::Update,
            Action::Delete => ActionKind::Delete,
        })
    }

    pub fn is_read(&self) -> bool {
        matches!(self.action_kind(), Some(ActionKind::Query))
    }
}

/// Request verb as seen by the permission layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Query,
    Insert,
    Update,
    Delete,
}

impl ActionKind {
    pub fn permission(self) -> &'static str {
        match self {
            ActionKind::Query => "sql.query",
            ActionKind::Insert => "sql.insert",
            ActionKind::Update => "sql.update",
            ActionKind::Delete => "sql.delete",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct BatchSqlRequest {
    pub database_type: DatabaseKind,
    pub operations: Vec<SqlRequest>,
    #[serde(default)]
    pub transactional: bool,
    #[serde(default)]
    pub continue_on_error: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct InsertRequest {
    pub database_type: DatabaseKind,
    pub table: String,
    #[schema(value_type = Object)]
    pub data: Params,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_conflict: Option<ConflictAction>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub return_fields: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct BatchInsertRequest {
    pub database_type: DatabaseKind,
    pub table: String,
    #[schema(value_type = Vec<Object>)]
    pub data: Vec<Params>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_conflict: Option<ConflictAction>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub return_fields: Vec<String>,
}

/// Response envelope for the single-statement and insert endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SqlResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schema(value_type = Vec<Object>)]
    pub data: Vec<Params>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub columns: Vec<String>,
    pub total: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_size: Option<u32>,
    pub affected_rows: u64,
    pub execution_time_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
    pub timestamp: DateTime<Utc>,
}

impl SqlResponse {
    pub fn success(data: Vec<Params>, columns: Vec<String>, affected_rows: u64) -> Self {
        let total = data.len() as u64;
        Self {
            success: true,
            message: None,
            data,
            columns,
            total,
            page: None,
            page_size: None,
            affected_rows,
            execution_time_ms: 0.0,
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn failure(error: &SqlError) -> Self {
        Self {
            success: false,
            message: None,
            data: Vec::new(),
            columns: Vec::new(),
            total: 0,
            page: None,
            page_size: None,
            affected_rows: 0,
            execution_time_ms: 0.0,
            error: Some(ErrorPayload::from(error)),
            timestamp: Utc::now(),
        }
    }
}

/// Per-slot outcome inside a batch response.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OperationResult {
    pub index: usize,
    pub success: bool,
    pub affected_rows: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
    pub execution_time_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct BatchSqlResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub results: Vec<OperationResult>,
    pub total_affected_rows: u64,
    pub executed_count: usize,
    pub failed_count: usize,
    pub execution_time_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
    pub timestamp: DateTime<Utc>,
}

impl BatchSqlResponse {
    /// Aggregates per-slot results; `success` iff nothing failed.
    pub fn from_results(results: Vec<OperationResult>) -> Self {
        let executed_count = results.iter().filter(|r| r.success).count();
        let failed_count = results.len() - executed_count;
        let total_affected_rows = results
            .iter()
            .filter(|r| r.success)
            .map(|r| r.affected_rows)
            .sum();
        Self {
            success: failed_count == 0,
            message: None,
            results,
            total_affected_rows,
            executed_count,
            failed_count,
            execution_time_ms: 0.0,
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn failure(error: &SqlError) -> Self {
        Self {
            success: false,
            message: None,
            results: Vec::new(),
            total_affected_rows: 0,
            executed_count: 0,
            failed_count: 0,
            execution_time_ms: 0.0,
            error: Some(ErrorPayload::from(error)),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_deserializes_with_where_keyword() {
        let req: SqlRequest = serde_json::from_value(json!({
            "database_type": "postgres",
            "query": {
                "table": "items",
                "action": "select",
                "fields": ["id", "name"],
                "where": {"active": true}
            },
            "pagination": {"page": 2, "page_size": 10},
            "sort": {"sort_by": "created_at", "sort_order": "desc"}
        }))
        .unwrap();

        let query = req.query.as_ref().unwrap();
        assert_eq!(query.action, Action::Select);
        assert_eq!(query.filter.as_ref().unwrap().len(), 1);
        assert_eq!(req.pagination.unwrap().page, 2);
        assert!(req.is_read());
    }

    #[test]
    fn action_kind_from_raw_sql() {
        let req: SqlRequest = serde_json::from_value(json!({
            "database_type": "oracle",
            "sql": "WITH recent AS (SELECT 1) SELECT * FROM recent"
        }))
        .unwrap();
        assert_eq!(req.action_kind(), Some(ActionKind::Query));

        let req: SqlRequest = serde_json::from_value(json!({
            "database_type": "postgres",
            "sql": "UPDATE items SET name = $1"
        }))
        .unwrap();
        assert_eq!(req.action_kind().unwrap().permission(), "sql.update");
    }

    #[test]
    fn unknown_database_type_is_rejected() {
        let result = serde_json::from_value::<SqlRequest>(json!({
            "database_type": "mysql",
            "sql": "SELECT 1"
        }));
        assert!(result.is_err());
    }

    #[test]
    fn batch_response_aggregates_counts() {
        let results = vec![
            OperationResult {
                index: 0,
                success: true,
                affected_rows: 2,
                error: None,
                execution_time_ms: 0.1,
            },
            OperationResult {
                index: 1,
                success: false,
                affected_rows: 0,
                error: Some(ErrorPayload::from(&SqlError::syntax("bad"))),
                execution_time_ms: 0.1,
            },
        ];
        let response = BatchSqlResponse::from_results(results);
        assert!(!response.success);
        assert_eq!(response.executed_count, 1);
        assert_eq!(response.failed_count, 1);
        assert_eq!(response.total_affected_rows, 2);
    }
}
