//! Per-backend SQL dialect adapters.
//!
//! Adapters are pure string operations; they never execute anything. Every
//! dialect-specific choice in the pipeline lives behind one method here.

use crate::model::{ConflictAction, DatabaseKind, SortOrder};

/// Strategy for placeholder syntax, pagination, sort merging and the
/// conflict/returning fragments of one backend.
pub trait Dialect: Send + Sync {
    /// 1-based positional placeholder.
    fn placeholder(&self, index: usize) -> String;

    /// Appends pagination to a statement. A non-positive limit leaves the
    /// statement untouched.
    fn apply_pagination(&self, sql: &str, offset: u64, limit: u64) -> String;

    /// Appends a sort column, merging into an existing `ORDER BY` when the
    /// statement already has one.
    fn apply_sort(&self, sql: &str, field: &str, order: SortOrder) -> String;

    /// Row-limit fragment used by the builder for structured `limit`.
    fn limit_fragment(&self, limit: u64) -> String;

    /// Conflict-handling fragment for inserts. Empty when the backend has no
    /// supported rendering.
    fn on_conflict_fragment(&self, mode: ConflictAction, fields: &[String]) -> String;

    /// RETURNING fragment for inserts. Empty when unsupported.
    fn returning_fragment(&self, fields: &[String]) -> String;
}

impl DatabaseKind {
    pub fn dialect(self) -> &'static dyn Dialect {
        match self {
            DatabaseKind::Postgres => &PostgresDialect,
            DatabaseKind::Oracle => &OracleDialect,
        }
    }
}

/// Drops surrounding whitespace and one trailing semicolon before fragments
/// are appended.
fn trim_statement(sql: &str) -> &str {
    let sql = sql.trim();
    sql.strip_suffix(';').map(str::trim_end).unwrap_or(sql)
}

fn merge_sort(sql: &str, field: &str, order: SortOrder) -> String {
    let sql = trim_statement(sql);
    if sql.to_ascii_lowercase().contains("order by") {
        format!("{sql}, {field} {}", order.as_sql())
    } else {
        format!("{sql} ORDER BY {field} {}", order.as_sql())
    }
}

pub struct PostgresDialect;

impl Dialect for PostgresDialect {
    fn placeholder(&self, index: usize) -> String {
        format!("${index}")
    }

    fn apply_pagination(&self, sql: &str, offset: u64, limit: u64) -> String {
        if limit == 0 {
            return sql.to_string();
        }
        let sql = trim_statement(sql);
        if offset > 0 {
            format!("{sql} LIMIT {limit} OFFSET {offset}")
        } else {
            format!("{sql} LIMIT {limit}")
        }
    }

    fn apply_sort(&self, sql: &str, field: &str, order: SortOrder) -> String {
        merge_sort(sql, field, order)
    }

    fn limit_fragment(&self, limit: u64) -> String {
        format!("LIMIT {limit}")
    }

    fn on_conflict_fragment(&self, mode: ConflictAction, fields: &[String]) -> String {
        match mode {
            ConflictAction::Ignore => " ON CONFLICT DO NOTHING".to_string(),
            ConflictAction::Update => {
                let assignments: Vec<String> = fields
                    .iter()
                    .map(|field| format!("{field} = EXCLUDED.{field}"))
                    .collect();
                format!(" ON CONFLICT DO UPDATE SET {}", assignments.join(", "))
            }
        }
    }

    fn returning_fragment(&self, fields: &[String]) -> String {
        if fields.is_empty() {
            return String::new();
        }
        format!(" RETURNING {}", fields.join(", "))
    }
}

pub struct OracleDialect;

impl Dialect for OracleDialect {
    fn placeholder(&self, index: usize) -> String {
        format!(":param_{index}")
    }

    fn apply_pagination(&self, sql: &str, offset: u64, limit: u64) -> String {
        if limit == 0 {
            return sql.to_string();
        }
        let sql = trim_statement(sql);
        if offset > 0 {
            format!("{sql} OFFSET {offset} ROWS FETCH NEXT {limit} ROWS ONLY")
        } else {
            format!("{sql} FETCH FIRST {limit} ROWS ONLY")
        }
    }

    fn apply_sort(&self, sql: &str, field: &str, order: SortOrder) -> String {
        merge_sort(sql, field, order)
    }

    fn limit_fragment(&self, limit: u64) -> String {
        format!("FETCH FIRST {limit} ROWS ONLY")
    }

    // Oracle upsert would need MERGE; documented as unsupported.
    fn on_conflict_fragment(&self, _mode: ConflictAction, _fields: &[String]) -> String {
        String::new()
    }

    fn returning_fragment(&self, fields: &[String]) -> String {
        if fields.is_empty() {
            return String::new();
        }
        let binds = vec![":out"; fields.len()].join(", ");
        format!(" RETURNING {} INTO {}", fields.join(", "), binds)
    }
}
