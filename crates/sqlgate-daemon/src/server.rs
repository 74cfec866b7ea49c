use std::{collections::HashMap, env, net::SocketAddr, str::FromStr, sync::Arc};

use anyhow::{bail, Context, Result};
use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use utoipa::{IntoParams, Modify, OpenApi};

use sqlgate::{
    mask_api_key, BatchInsertRequest, BatchSqlRequest, BatchSqlResponse, DatabaseKind,
    InsertRequest, SqlConfig, SqlEngine, SqlError, SqlRequest, SqlResponse, SqlxDriver,
};

use crate::auth::ApiKeyManager;
use crate::middleware::ip_allowlist::{ip_allowlist_layer, IpAllowlist};

pub async fn run() -> Result<()> {
    let config = AppConfig::from_env()?;
    config.sql.validate().context("invalid SQL configuration")?;

    let driver = SqlxDriver::connect(&config.database_url)
        .await
        .context("failed to open the database pool")?;
    let engine = SqlEngine::new(Arc::new(driver), config.database_kind, config.sql.clone())?;

    let mut engines = HashMap::new();
    engines.insert(config.database_kind, Arc::new(engine));

    if config.api_keys.is_empty() {
        warn!("no API keys configured; every request will be rejected");
    }

    let state = Arc::new(AppState {
        engines,
        auth: config.api_keys.clone(),
    });

    let app = build_router(state)
        .layer(ip_allowlist_layer(config.ip_allowlist.clone()))
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listen socket")?;

    info!(
        addr = %config.listen_addr,
        database = %config.database_kind,
        "sqlgate-daemon listening"
    );
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("HTTP server exited")?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/v1/openapi.json", get(openapi_json))
        .route("/api/v1/sql", post(handle_sql))
        .route("/api/v1/sql/batch", post(handle_batch))
        .route("/api/v1/sql/insert", post(handle_insert))
        .route("/api/v1/sql/batch-insert", post(handle_batch_insert))
        .with_state(state)
}

struct AppState {
    engines: HashMap<DatabaseKind, Arc<SqlEngine>>,
    auth: ApiKeyManager,
}

#[derive(Debug, Clone)]
struct AppConfig {
    listen_addr: SocketAddr,
    database_url: String,
    database_kind: DatabaseKind,
    sql: SqlConfig,
    api_keys: ApiKeyManager,
    ip_allowlist: IpAllowlist,
}

impl AppConfig {
    fn from_env() -> Result<Self> {
        let listen_addr = env::var("SQLGATE_LISTEN_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
            .parse()
            .context("invalid SQLGATE_LISTEN_ADDR")?;

        let database_url = env::var("SQLGATE_DATABASE_URL")
            .or_else(|_| env::var("DATABASE_URL"))
            .context("SQLGATE_DATABASE_URL or DATABASE_URL must be configured")?;

        let database_kind = match env::var("SQLGATE_DATABASE_KIND")
            .unwrap_or_else(|_| "postgres".to_string())
            .to_ascii_lowercase()
            .as_str()
        {
            "postgres" | "postgresql" => DatabaseKind::Postgres,
            "oracle" => bail!(
                "the bundled sqlx driver does not serve Oracle; embed the sqlgate crate \
                 with an external SqlDriver implementation instead"
            ),
            other => bail!("unsupported SQLGATE_DATABASE_KIND: {other}"),
        };

        let defaults = SqlConfig::default();
        let sql = SqlConfig {
            enabled: bool_env("SQLGATE_SQL_ENABLED").unwrap_or(true),
            allowed_tables: parse_string_list_env("SQLGATE_ALLOWED_TABLES").unwrap_or_default(),
            allowed_actions: parse_string_list_env("SQLGATE_ALLOWED_ACTIONS")
                .unwrap_or(defaults.allowed_actions),
            max_query_time_seconds: parsed_env(
                "SQLGATE_MAX_QUERY_TIME_SECONDS",
                defaults.max_query_time_seconds,
            ),
            max_result_size_rows: parsed_env(
                "SQLGATE_MAX_RESULT_SIZE_ROWS",
                defaults.max_result_size_rows,
            ),
            enable_raw_sql: bool_env("SQLGATE_ENABLE_RAW_SQL").unwrap_or(true),
            enable_batch: bool_env("SQLGATE_ENABLE_BATCH").unwrap_or(true),
            enable_transactions: bool_env("SQLGATE_ENABLE_TRANSACTIONS").unwrap_or(true),
        };

        let api_keys = match env::var("SQLGATE_API_KEYS") {
            Ok(spec) => ApiKeyManager::parse(&spec).context("invalid SQLGATE_API_KEYS")?,
            Err(_) => ApiKeyManager::default(),
        };

        let ip_allowlist = IpAllowlist::parse(
            &parse_string_list_env("SQLGATE_IP_ALLOWLIST").unwrap_or_default(),
        )
        .context("invalid SQLGATE_IP_ALLOWLIST")?;

        Ok(Self {
            listen_addr,
            database_url,
            database_kind,
            sql,
            api_keys,
            ip_allowlist,
        })
    }
}

#[derive(Debug, Deserialize, IntoParams)]
struct ApiKeyQuery {
    #[serde(default)]
    api_key: Option<String>,
}

#[utoipa::path(
    get,
    path = "/healthz",
    responses((status = 200, description = "Service is healthy"))
)]
async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn openapi_json() -> impl IntoResponse {
    Json(docs::ApiDoc::openapi())
}

#[utoipa::path(
    post,
    path = "/api/v1/sql",
    params(ApiKeyQuery),
    request_body = SqlRequest,
    responses(
        (status = 200, description = "Statement executed", body = SqlResponse),
        (status = 400, description = "Invalid request or rejected statement", body = SqlResponse),
        (status = 403, description = "Permission denied", body = SqlResponse),
        (status = 408, description = "Query timeout", body = SqlResponse),
        (status = 413, description = "Result set too large", body = SqlResponse),
        (status = 503, description = "Backend unavailable", body = SqlResponse)
    ),
    security(("apiKey" = []))
)]
async fn handle_sql(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ApiKeyQuery>,
    payload: Result<Json<SqlRequest>, JsonRejection>,
) -> Response {
    let req = match payload {
        Ok(Json(req)) => req,
        Err(rejection) => {
            return sql_failure(&SqlError::params(rejection.body_text()), true);
        }
    };
    let is_read = req.is_read();

    let Some(action) = req.action_kind() else {
        return sql_failure(&SqlError::params("unable to determine the SQL action"), is_read);
    };
    if let Err(err) = authorize(&state, &headers, &query, action.permission()) {
        return sql_failure(&err, is_read);
    }

    let engine = match engine_for(&state, req.database_type) {
        Ok(engine) => engine,
        Err(err) => return sql_failure(&err, is_read),
    };

    let result = if is_read {
        engine.execute_query(&req).await
    } else {
        engine.execute_sql(&req).await
    };

    match result {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(err) => sql_failure(&err, is_read),
    }
}

#[utoipa::path(
    post,
    path = "/api/v1/sql/batch",
    params(ApiKeyQuery),
    request_body = BatchSqlRequest,
    responses(
        (status = 200, description = "Batch executed", body = BatchSqlResponse),
        (status = 400, description = "Invalid request", body = BatchSqlResponse),
        (status = 403, description = "Permission denied", body = BatchSqlResponse),
        (status = 500, description = "Batch failed and rolled back", body = BatchSqlResponse)
    ),
    security(("apiKey" = []))
)]
async fn handle_batch(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ApiKeyQuery>,
    payload: Result<Json<BatchSqlRequest>, JsonRejection>,
) -> Response {
    let req = match payload {
        Ok(Json(req)) => req,
        Err(rejection) => {
            return batch_failure(&SqlError::params(rejection.body_text()));
        }
    };

    if let Err(err) = authorize(&state, &headers, &query, "sql.batch") {
        return batch_failure(&err);
    }
    for (index, operation) in req.operations.iter().enumerate() {
        let Some(action) = operation.action_kind() else {
            return batch_failure(&SqlError::params(format!(
                "operation {index}: unable to determine the SQL action"
            )));
        };
        if let Err(err) = authorize(&state, &headers, &query, action.permission()) {
            return batch_failure(&SqlError::permission(format!(
                "operation {index}: {}",
                err.details().unwrap_or("permission denied")
            )));
        }
    }

    let engine = match engine_for(&state, req.database_type) {
        Ok(engine) => engine,
        Err(err) => return batch_failure(&err),
    };

    match engine.execute_batch(&req).await {
        Ok(response) => {
            let status = if response.success {
                StatusCode::OK
            } else {
                response
                    .error
                    .as_ref()
                    .map(|error| status_for(error.code, false))
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            };
            (status, Json(response)).into_response()
        }
        Err(err) => batch_failure(&err),
    }
}

#[utoipa::path(
    post,
    path = "/api/v1/sql/insert",
    params(ApiKeyQuery),
    request_body = InsertRequest,
    responses(
        (status = 201, description = "Row inserted", body = SqlResponse),
        (status = 400, description = "Invalid request", body = SqlResponse),
        (status = 403, description = "Permission denied", body = SqlResponse)
    ),
    security(("apiKey" = []))
)]
async fn handle_insert(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ApiKeyQuery>,
    payload: Result<Json<InsertRequest>, JsonRejection>,
) -> Response {
    let req = match payload {
        Ok(Json(req)) => req,
        Err(rejection) => {
            return sql_failure(&SqlError::params(rejection.body_text()), false);
        }
    };

    if let Err(err) = authorize(&state, &headers, &query, "sql.insert") {
        return sql_failure(&err, false);
    }
    let engine = match engine_for(&state, req.database_type) {
        Ok(engine) => engine,
        Err(err) => return sql_failure(&err, false),
    };

    match engine.execute_insert(&req).await {
        Ok(response) => (StatusCode::CREATED, Json(response)).into_response(),
        Err(err) => sql_failure(&err, false),
    }
}

#[utoipa::path(
    post,
    path = "/api/v1/sql/batch-insert",
    params(ApiKeyQuery),
    request_body = BatchInsertRequest,
    responses(
        (status = 201, description = "Rows inserted", body = SqlResponse),
        (status = 400, description = "Invalid request", body = SqlResponse),
        (status = 403, description = "Permission denied", body = SqlResponse)
    ),
    security(("apiKey" = []))
)]
async fn handle_batch_insert(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ApiKeyQuery>,
    payload: Result<Json<BatchInsertRequest>, JsonRejection>,
) -> Response {
    let req = match payload {
        Ok(Json(req)) => req,
        Err(rejection) => {
            return sql_failure(&SqlError::params(rejection.body_text()), false);
        }
    };

    if let Err(err) = authorize(&state, &headers, &query, "sql.insert") {
        return sql_failure(&err, false);
    }
    let engine = match engine_for(&state, req.database_type) {
        Ok(engine) => engine,
        Err(err) => return sql_failure(&err, false),
    };

    match engine.execute_batch_insert(&req).await {
        Ok(response) => (StatusCode::CREATED, Json(response)).into_response(),
        Err(err) => sql_failure(&err, false),
    }
}

fn authorize(
    state: &AppState,
    headers: &HeaderMap,
    query: &ApiKeyQuery,
    permission: &str,
) -> Result<(), SqlError> {
    let Some(key) = api_key(headers, query) else {
        return Err(SqlError::permission("missing API key"));
    };
    if !state.auth.has_permission(key, permission) {
        warn!(api_key = %mask_api_key(key), permission, "permission denied");
        return Err(SqlError::permission(format!(
            "API key lacks the '{permission}' permission"
        )));
    }
    Ok(())
}

fn api_key<'a>(headers: &'a HeaderMap, query: &'a ApiKeyQuery) -> Option<&'a str> {
    headers
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .or(query.api_key.as_deref())
}

fn engine_for(state: &AppState, kind: DatabaseKind) -> Result<Arc<SqlEngine>, SqlError> {
    state
        .engines
        .get(&kind)
        .cloned()
        .ok_or_else(|| SqlError::connection(format!("backend '{kind}' is not configured")))
}

/// Error code → HTTP status. Syntax and transaction failures are client
/// errors on reads but server errors on writes.
fn status_for(code: u16, is_read: bool) -> StatusCode {
    match code {
        4002 => StatusCode::BAD_REQUEST,
        4003 => StatusCode::FORBIDDEN,
        4004 => StatusCode::SERVICE_UNAVAILABLE,
        4006 => StatusCode::REQUEST_TIMEOUT,
        4007 => StatusCode::PAYLOAD_TOO_LARGE,
        4001 | 4005 => {
            if is_read {
                StatusCode::BAD_REQUEST
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn sql_failure(error: &SqlError, is_read: bool) -> Response {
    (
        status_for(error.code(), is_read),
        Json(SqlResponse::failure(error)),
    )
        .into_response()
}

fn batch_failure(error: &SqlError) -> Response {
    (
        status_for(error.code(), false),
        Json(BatchSqlResponse::failure(error)),
    )
        .into_response()
}

fn bool_env(key: &str) -> Option<bool> {
    env::var(key)
        .ok()
        .and_then(|value| match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        })
}

fn parse_string_list_env(key: &str) -> Option<Vec<String>> {
    env::var(key).ok().map(|value| {
        value
            .split(',')
            .filter_map(|item| {
                let trimmed = item.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(trimmed.to_string())
                }
            })
            .collect()
    })
}

fn parsed_env<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}

pub mod docs {
    use super::*;
    use sqlgate::{
        Action, ConflictAction, ErrorPayload, OperationResult, OrderBy, Pagination, Sort,
        SortOrder, StructuredQuery,
    };
    use utoipa::openapi::security::{ApiKey, ApiKeyValue, SecurityScheme};

    #[derive(OpenApi)]
    #[openapi(
        info(title = "sqlgate API", version = "0.1.0"),
        paths(
            healthz,
            handle_sql,
            handle_batch,
            handle_insert,
            handle_batch_insert
        ),
        components(schemas(
            SqlRequest,
            StructuredQuery,
            OrderBy,
            Pagination,
            Sort,
            SortOrder,
            Action,
            ConflictAction,
            DatabaseKind,
            BatchSqlRequest,
            InsertRequest,
            BatchInsertRequest,
            SqlResponse,
            BatchSqlResponse,
            OperationResult,
            ErrorPayload
        )),
        modifiers(&SecurityAddon)
    )]
    pub struct ApiDoc;

    struct SecurityAddon;

    impl Modify for SecurityAddon {
        fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
            if let Some(components) = openapi.components.as_mut() {
                components.add_security_scheme(
                    "apiKey",
                    SecurityScheme::ApiKey(ApiKey::Header(ApiKeyValue::new("X-API-Key"))),
                );
            }
        }
    }
}
