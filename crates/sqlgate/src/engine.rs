//! Execution engine: the deadlined heart of the pipeline.
//!
//! Every public entry derives one absolute deadline from the configured
//! per-query budget and holds it across validation, execution, commit and
//! rollback. Pre-validation time is not free: the executor still enforces
//! the original budget.

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::time::{timeout_at, Instant as TokioInstant};

use crate::builder::QueryBuilder;
use crate::classify::ErrorClassifier;
use crate::config::{ConfigError, SqlConfig};
use crate::driver::{PoolStats, SqlDriver};
use crate::error::{ErrorPayload, SqlError};
use crate::model::{
    BatchInsertRequest, BatchSqlRequest, BatchSqlResponse, DatabaseKind, InsertRequest,
    OperationResult, Params, SortOrder, SqlRequest, SqlResponse,
};
use crate::monitor::QueryMonitor;
use crate::security::{effective_action, is_read_statement, SecurityValidator};
use crate::structure::StructureValidator;

const MAX_BATCH_OPERATIONS: usize = 100;
const MAX_BATCH_INSERT_ROWS: usize = 1_000;

pub struct SqlEngine {
    driver: Arc<dyn SqlDriver>,
    kind: DatabaseKind,
    config: SqlConfig,
    security: SecurityValidator,
    structure: StructureValidator,
    builder: QueryBuilder,
    classifier: ErrorClassifier,
    monitor: QueryMonitor,
}

impl SqlEngine {
    pub fn new(
        driver: Arc<dyn SqlDriver>,
        kind: DatabaseKind,
        config: SqlConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            security: SecurityValidator::new(&config),
            structure: StructureValidator::new(),
            builder: QueryBuilder::new(kind),
            classifier: ErrorClassifier::new(kind),
            monitor: QueryMonitor::new(config.slow_query_threshold()),
            driver,
            kind,
            config,
        })
    }

    pub fn database_kind(&self) -> DatabaseKind {
        self.kind
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.driver.pool_stats()
    }

    /// Read path: structured or raw SELECT with optional pagination/sort.
    pub async fn execute_query(&self, req: &SqlRequest) -> Result<SqlResponse, SqlError> {
        let started = Instant::now();
        let deadline = self.deadline();

        validate_request(req)?;
        let (sql, params) = self.prepare(req)?;

        let span = self.monitor.start(self.kind, "select", &sql);

        if let Err(err) = self
            .structure
            .validate(&sql)
            .and_then(|()| self.security.validate(&sql, &params))
        {
            span.finish_err(&err);
            return Err(err);
        }

        if !is_read_statement(&sql) {
            let err = SqlError::syntax("only SELECT statements are accepted on the query path");
            span.finish_err(&err);
            return Err(err);
        }

        let sql = self.apply_pagination_and_sort(sql, req);
        let args: Vec<Value> = params.values().cloned().collect();

        let rows = match timeout_at(deadline, self.driver.query(&sql, &args)).await {
            Err(_) => {
                let err = self.budget_exhausted();
                span.finish_err(&err);
                return Err(err);
            }
            Ok(Err(driver_err)) => {
                let err = self.classifier.classify(&driver_err);
                span.finish_err(&err);
                return Err(err);
            }
            Ok(Ok(rows)) => rows,
        };

        // The cap refuses the whole result; no partial data leaves here.
        if rows.rows.len() > self.config.max_result_size_rows {
            let err = SqlError::result_size(format!(
                "{} rows exceed the configured cap of {}",
                rows.rows.len(),
                self.config.max_result_size_rows
            ));
            span.finish_err(&err);
            return Err(err);
        }

        span.finish_ok(0, rows.rows.len() as u64);

        let mut response = SqlResponse::success(rows.rows, rows.columns, 0);
        response.message = Some("query executed successfully".to_string());
        if let Some(pagination) = req.pagination {
            response.page = Some(pagination.page);
            response.page_size = Some(pagination.page_size);
        }
        response.execution_time_ms = elapsed_ms(started);
        Ok(response)
    }

    /// Write path for INSERT / UPDATE / DELETE statements.
    pub async fn execute_sql(&self, req: &SqlRequest) -> Result<SqlResponse, SqlError> {
        let started = Instant::now();
        let deadline = self.deadline();

        validate_request(req)?;
        if req.sql.is_some() && !self.config.enable_raw_sql {
            return Err(SqlError::permission("raw SQL execution is disabled"));
        }

        let (sql, params) = self.prepare(req)?;
        let action = effective_action(&sql.to_ascii_lowercase()).unwrap_or("execute");
        self.run_write(started, deadline, sql, params, action, false)
            .await
    }

    /// Convenience insert; `return_fields` switches to the query path so
    /// generated values come back in `data`.
    pub async fn execute_insert(&self, req: &InsertRequest) -> Result<SqlResponse, SqlError> {
        let started = Instant::now();
        let deadline = self.deadline();

        if req.table.trim().is_empty() {
            return Err(SqlError::params("table name is required"));
        }
        if req.data.is_empty() {
            return Err(SqlError::params("data is required for insert"));
        }

        let (sql, params) = self.builder.build_insert_request(req)?;
        self.run_write(
            started,
            deadline,
            sql,
            params,
            "insert",
            !req.return_fields.is_empty(),
        )
        .await
    }

    pub async fn execute_batch_insert(
        &self,
        req: &BatchInsertRequest,
    ) -> Result<SqlResponse, SqlError> {
        let started = Instant::now();
        let deadline = self.deadline();

        if req.table.trim().is_empty() {
            return Err(SqlError::params("table name is required"));
        }
        if req.data.is_empty() {
            return Err(SqlError::params("data is required for batch insert"));
        }
        if req.data.len() > MAX_BATCH_INSERT_ROWS {
            return Err(SqlError::params(format!(
                "batch insert size {} exceeds the limit of {MAX_BATCH_INSERT_ROWS}",
                req.data.len()
            )));
        }

        let (sql, params) = self.builder.build_batch_insert(req)?;
        self.run_write(
            started,
            deadline,
            sql,
            params,
            "insert",
            !req.return_fields.is_empty(),
        )
        .await
    }

    /// Ordered batch of operations, optionally all-or-nothing.
    pub async fn execute_batch(
        &self,
        req: &BatchSqlRequest,
    ) -> Result<BatchSqlResponse, SqlError> {
        let started = Instant::now();
        let deadline = self.deadline();

        if !self.config.enable_batch {
            return Err(SqlError::permission("batch operations are disabled"));
        }
        if req.operations.is_empty() {
            return Err(SqlError::params("batch contains no operations"));
        }
        if req.operations.len() > MAX_BATCH_OPERATIONS {
            return Err(SqlError::params(format!(
                "batch size {} exceeds the limit of {MAX_BATCH_OPERATIONS}",
                req.operations.len()
            )));
        }
        if req.transactional && !self.config.enable_transactions {
            return Err(SqlError::params("transactional batches are disabled"));
        }

        // Every operation is built and security-checked before the first one
        // executes; a trivially rejectable batch never touches the database.
        let mut statements = Vec::with_capacity(req.operations.len());
        for (index, operation) in req.operations.iter().enumerate() {
            let prepared = validate_request(operation)
                .and_then(|()| self.prepare(operation))
                .and_then(|(sql, params)| {
                    self.security.validate(&sql, &params)?;
                    Ok((sql, params))
                });
            let (sql, params) = prepared.map_err(|err| at_operation(index, err))?;
            let args: Vec<Value> = params.values().cloned().collect();
            statements.push((sql, args));
        }

        let mut response = if req.transactional {
            self.run_transactional(deadline, &statements).await?
        } else {
            self.run_sequential(deadline, &statements, req.continue_on_error)
                .await
        };
        response.execution_time_ms = elapsed_ms(started);
        Ok(response)
    }

    async fn run_write(
        &self,
        started: Instant,
        deadline: TokioInstant,
        sql: String,
        params: Params,
        action: &str,
        returning: bool,
    ) -> Result<SqlResponse, SqlError> {
        let span = self.monitor.start(self.kind, action, &sql);

        if let Err(err) = self
            .structure
            .validate(&sql)
            .and_then(|()| self.security.validate(&sql, &params))
        {
            span.finish_err(&err);
            return Err(err);
        }

        let args: Vec<Value> = params.values().cloned().collect();

        let mut response = if returning {
            match timeout_at(deadline, self.driver.query(&sql, &args)).await {
                Err(_) => {
                    let err = self.budget_exhausted();
                    span.finish_err(&err);
                    return Err(err);
                }
                Ok(Err(driver_err)) => {
                    let err = self.classifier.classify(&driver_err);
                    span.finish_err(&err);
                    return Err(err);
                }
                Ok(Ok(rows)) => {
                    let affected = rows.rows.len() as u64;
                    span.finish_ok(affected, affected);
                    SqlResponse::success(rows.rows, rows.columns, affected)
                }
            }
        } else {
            match timeout_at(deadline, self.driver.execute(&sql, &args)).await {
                Err(_) => {
                    let err = self.budget_exhausted();
                    span.finish_err(&err);
                    return Err(err);
                }
                Ok(Err(driver_err)) => {
                    let err = self.classifier.classify(&driver_err);
                    span.finish_err(&err);
                    return Err(err);
                }
                Ok(Ok(affected)) => {
                    span.finish_ok(affected, 0);
                    SqlResponse::success(Vec::new(), Vec::new(), affected)
                }
            }
        };

        response.message = Some("statement executed successfully".to_string());
        response.execution_time_ms = elapsed_ms(started);
        Ok(response)
    }

    /// BEGIN → EXEC(i)… → COMMIT, with any error or deadline rolling the
    /// whole batch back.
    async fn run_transactional(
        &self,
        deadline: TokioInstant,
        statements: &[(String, Vec<Value>)],
    ) -> Result<BatchSqlResponse, SqlError> {
        let mut tx = match timeout_at(deadline, self.driver.begin()).await {
            Err(_) => return Err(self.budget_exhausted()),
            Ok(Err(driver_err)) => return Err(self.classifier.classify(&driver_err)),
            Ok(Ok(tx)) => tx,
        };

        let mut results = Vec::with_capacity(statements.len());
        for (index, (sql, args)) in statements.iter().enumerate() {
            let op_started = Instant::now();
            let span = self.monitor.start(self.kind, "batch", sql);

            let outcome = match timeout_at(deadline, tx.execute(sql, args)).await {
                Err(_) => Err(self.budget_exhausted()),
                Ok(Err(driver_err)) => Err(self.classifier.classify(&driver_err)),
                Ok(Ok(affected)) => Ok(affected),
            };

            match outcome {
                Ok(affected) => {
                    span.finish_ok(affected, 0);
                    results.push(OperationResult {
                        index,
                        success: true,
                        affected_rows: affected,
                        error: None,
                        execution_time_ms: elapsed_ms(op_started),
                    });
                }
                Err(classified) => {
                    span.finish_err(&classified);
                    let _ = tx.rollback().await;
                    let err = transactional_failure(index, classified);
                    return Ok(rolled_back_response(statements.len(), Some(index), err));
                }
            }
        }

        match timeout_at(deadline, tx.commit()).await {
            Err(_) => Ok(rolled_back_response(
                statements.len(),
                None,
                self.budget_exhausted(),
            )),
            Ok(Err(driver_err)) => {
                let classified = self.classifier.classify(&driver_err);
                let err = SqlError::transaction(format!(
                    "commit failed: {}",
                    classified.details().unwrap_or("unknown driver error")
                ));
                Ok(rolled_back_response(statements.len(), None, err))
            }
            Ok(Ok(())) => {
                let mut response = BatchSqlResponse::from_results(results);
                response.message = Some("batch executed successfully".to_string());
                Ok(response)
            }
        }
    }

    /// Independent execution per slot. Committed work stays committed even
    /// when a later slot fails.
    async fn run_sequential(
        &self,
        deadline: TokioInstant,
        statements: &[(String, Vec<Value>)],
        continue_on_error: bool,
    ) -> BatchSqlResponse {
        let mut results = Vec::with_capacity(statements.len());
        let mut abort: Option<SqlError> = None;

        for (index, (sql, args)) in statements.iter().enumerate() {
            let op_started = Instant::now();
            let span = self.monitor.start(self.kind, "batch", sql);

            let outcome = match timeout_at(deadline, self.driver.execute(sql, args)).await {
                Err(_) => Err(self.budget_exhausted()),
                Ok(Err(driver_err)) => Err(self.classifier.classify(&driver_err)),
                Ok(Ok(affected)) => Ok(affected),
            };

            match outcome {
                Ok(affected) => {
                    span.finish_ok(affected, 0);
                    results.push(OperationResult {
                        index,
                        success: true,
                        affected_rows: affected,
                        error: None,
                        execution_time_ms: elapsed_ms(op_started),
                    });
                }
                Err(err) => {
                    span.finish_err(&err);
                    let timed_out = matches!(err, SqlError::Timeout { .. });
                    results.push(OperationResult {
                        index,
                        success: false,
                        affected_rows: 0,
                        error: Some(ErrorPayload::from(&err)),
                        execution_time_ms: elapsed_ms(op_started),
                    });
                    // The deadline is the authoritative kill switch; nothing
                    // after it may run even with continue_on_error.
                    if !continue_on_error || timed_out {
                        abort = Some(at_operation(index, err));
                        break;
                    }
                }
            }
        }

        let mut response = BatchSqlResponse::from_results(results);
        if let Some(err) = abort {
            response.success = false;
            response.error = Some(ErrorPayload::from(&err));
        }
        response
    }

    fn prepare(&self, req: &SqlRequest) -> Result<(String, Params), SqlError> {
        if let Some(sql) = &req.sql {
            // Raw statements already carry backend-native placeholders;
            // params bind positionally in insertion order.
            return Ok((sql.clone(), req.params.clone().unwrap_or_default()));
        }
        if let Some(query) = &req.query {
            return self.builder.build(query);
        }
        Err(SqlError::params("either sql or query must be provided"))
    }

    fn apply_pagination_and_sort(&self, mut sql: String, req: &SqlRequest) -> String {
        let dialect = self.kind.dialect();
        if let Some(sort) = &req.sort {
            if !sort.sort_by.is_empty() {
                sql = dialect.apply_sort(
                    &sql,
                    &sort.sort_by,
                    sort.sort_order.unwrap_or(SortOrder::Asc),
                );
            }
        }
        if let Some(pagination) = req.pagination {
            let offset = u64::from(pagination.page.saturating_sub(1))
                * u64::from(pagination.page_size);
            sql = dialect.apply_pagination(&sql, offset, pagination.page_size.into());
        }
        sql
    }

    fn deadline(&self) -> TokioInstant {
        TokioInstant::now() + self.config.max_query_time()
    }

    fn budget_exhausted(&self) -> SqlError {
        SqlError::timeout(format!(
            "query exceeded the {}s budget",
            self.config.max_query_time_seconds
        ))
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1_000.0
}

/// Request-shape validation; everything here is a 4002.
fn validate_request(req: &SqlRequest) -> Result<(), SqlError> {
    match (&req.sql, &req.query) {
        (Some(_), Some(_)) => {
            return Err(SqlError::params("provide either sql or query, not both"))
        }
        (None, None) => return Err(SqlError::params("either sql or query must be provided")),
        _ => {}
    }

    if let Some(pagination) = req.pagination {
        if pagination.page < 1 {
            return Err(SqlError::params("page must be at least 1"));
        }
        if !(1..=1_000).contains(&pagination.page_size) {
            return Err(SqlError::params("page_size must be within 1..=1000"));
        }
    }

    if let Some(query) = &req.query {
        if query.table.trim().is_empty() {
            return Err(SqlError::params("table name is required"));
        }
        let filled = |map: &Option<Params>| map.as_ref().is_some_and(|map| !map.is_empty());
        match query.action {
            crate::model::Action::Select => {
                if filled(&query.data) {
                    return Err(SqlError::params("data must be absent for select"));
                }
            }
            crate::model::Action::Insert => {
                if !filled(&query.data) {
                    return Err(SqlError::params("data is required for insert"));
                }
                if filled(&query.filter) || !query.group_by.is_empty() || filled(&query.having) {
                    return Err(SqlError::params(
                        "where, group_by and having must be absent for insert",
                    ));
                }
            }
            crate::model::Action::Update => {
                if !filled(&query.data) {
                    return Err(SqlError::params("data is required for update"));
                }
            }
            crate::model::Action::Delete => {
                if !filled(&query.filter) {
                    return Err(SqlError::params("a where condition is required for delete"));
                }
            }
        }
    }
    Ok(())
}

/// Rewrites an error's details to carry the failing slot index, preserving
/// the kind.
fn at_operation(index: usize, error: SqlError) -> SqlError {
    let details = match error.details() {
        Some(details) => format!("operation {index}: {details}"),
        None => format!("operation {index}"),
    };
    match error {
        SqlError::Syntax { sql_state, .. } => SqlError::Syntax {
            details: Some(details),
            sql_state,
        },
        SqlError::Params { .. } => SqlError::Params {
            details: Some(details),
        },
        SqlError::Permission { .. } => SqlError::Permission {
            details: Some(details),
        },
        SqlError::Connection { sql_state, .. } => SqlError::Connection {
            details: Some(details),
            sql_state,
        },
        SqlError::Transaction { sql_state, .. } => SqlError::Transaction {
            details: Some(details),
            sql_state,
        },
        SqlError::Timeout { .. } => SqlError::Timeout {
            details: Some(details),
        },
        SqlError::ResultSize { .. } => SqlError::ResultSize {
            details: Some(details),
        },
    }
}

/// A rolled-back batch surfaces as a transaction failure, except when the
/// deadline fired first.
fn transactional_failure(index: usize, classified: SqlError) -> SqlError {
    if matches!(classified, SqlError::Timeout { .. }) {
        return at_operation(index, classified);
    }
    let details = match classified.details() {
        Some(details) => format!("operation {index}: {classified} ({details})"),
        None => format!("operation {index}: {classified}"),
    };
    let state = classified.sql_state().map(str::to_owned);
    let err = SqlError::transaction(details);
    match state {
        Some(state) => err.with_sql_state(state),
        None => err,
    }
}

fn rolled_back_response(
    total: usize,
    failed_index: Option<usize>,
    error: SqlError,
) -> BatchSqlResponse {
    let payload = ErrorPayload::from(&error);
    let results = (0..total)
        .map(|index| OperationResult {
            index,
            success: false,
            affected_rows: 0,
            error: (Some(index) == failed_index).then(|| payload.clone()),
            execution_time_ms: 0.0,
        })
        .collect();

    let mut response = BatchSqlResponse::from_results(results);
    response.success = false;
    response.total_affected_rows = 0;
    response.executed_count = 0;
    response.failed_count = total;
    response.error = Some(payload);
    response
}
