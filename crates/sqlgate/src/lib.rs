//! SQL request pipeline exposing a relational backend as typed operations.
//!
//! A request enters the [`engine::SqlEngine`] as either a raw parameterized
//! statement or a structured query description. The structure validator
//! gates shape, the security validator gates safety and table/action
//! authorization, the builder translates structured queries through the
//! active [`dialect::Dialect`], and the engine executes under an absolute
//! per-request deadline, classifying any driver error onto the stable
//! 4001..4007 taxonomy.

pub mod builder;
pub mod classify;
pub mod config;
pub mod dialect;
pub mod driver;
pub mod engine;
pub mod error;
pub mod model;
pub mod monitor;
pub mod security;
pub mod structure;

pub use builder::QueryBuilder;
pub use classify::ErrorClassifier;
pub use config::{ConfigError, SqlConfig};
pub use dialect::{Dialect, OracleDialect, PostgresDialect};
pub use driver::{DriverError, DriverTransaction, PoolStats, RowSet, SqlDriver, SqlxDriver};
pub use engine::SqlEngine;
pub use error::{ErrorPayload, SqlError};
pub use model::{
    Action, ActionKind, BatchInsertRequest, BatchSqlRequest, BatchSqlResponse, ConflictAction,
    DatabaseKind, InsertRequest, OperationResult, OrderBy, Pagination, Params, Sort, SortOrder,
    SqlRequest, SqlResponse, StructuredQuery,
};
pub use monitor::{mask_api_key, scrub_sql, QueryMonitor};
pub use security::SecurityValidator;
pub use structure::StructureValidator;
