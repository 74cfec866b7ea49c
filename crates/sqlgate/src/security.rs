//! Security validator: defense-in-depth atop parameterized execution.
//!
//! Advisory-fast string scans, not a SQL parser. Rejections classify as
//! syntax (keyword/pattern), permission (table/action) or params
//! (parameter-value) failures.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::config::SqlConfig;
use crate::error::SqlError;
use crate::model::Params;

const MAX_STATEMENT_LENGTH: usize = 10_000;
const MAX_PARAMETERS: usize = 100;
const MAX_PARAMETER_STRING_LENGTH: usize = 10_000;

/// Forbidden keyword families: DDL, privilege management, procedural
/// execution, system catalogs. Word-boundary matched so identifiers like
/// `created_at` pass.
static FORBIDDEN_KEYWORDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b(?:drop|truncate|alter|create|grant|revoke|exec|execute|information_schema|mysql|sys|master)\b|\b(?:sp_|xp_|fn_|pg_)",
    )
    .expect("forbidden keyword pattern")
});

/// Classical injection motifs.
static INJECTION_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r"(?i)\bunion\s+select\b", "UNION SELECT"),
        (r"(?i)\bor\s+1\s*=\s*1\b", "OR 1=1"),
        (r"(?i)\band\s+1\s*=\s*1\b", "AND 1=1"),
        (
            r"(?i)\b(?:benchmark|sleep|waitfor|delay)\s*\(",
            "time-delay function",
        ),
        (
            r"(?i)\bload_file\b|\binto\s+(?:outfile|dumpfile)\b",
            "file access",
        ),
        (r"@@", "system variable"),
    ]
    .into_iter()
    .map(|(pattern, label)| (Regex::new(pattern).expect("injection pattern"), label))
    .collect()
});

static SQL_KEYWORDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "select", "from", "where", "and", "or", "order", "by", "group", "having", "limit",
        "offset", "join", "inner", "left", "right", "full", "outer", "on", "as", "distinct",
        "count", "sum", "avg", "max", "min",
    ]
    .into_iter()
    .collect()
});

/// True when the statement's first significant token makes it a read.
pub fn is_read_statement(sql: &str) -> bool {
    matches!(
        sql.split_whitespace()
            .next()
            .map(str::to_ascii_lowercase)
            .as_deref(),
        Some("select") | Some("with")
    )
}

pub struct SecurityValidator {
    allowed_tables: HashSet<String>,
    allowed_actions: HashSet<String>,
}

impl SecurityValidator {
    pub fn new(config: &SqlConfig) -> Self {
        Self {
            allowed_tables: config
                .allowed_tables
                .iter()
                .map(|table| table.to_ascii_lowercase())
                .collect(),
            allowed_actions: config
                .allowed_actions
                .iter()
                .map(|action| action.to_ascii_lowercase())
                .collect(),
        }
    }

    /// Full gate: statement shape, keyword families, injection motifs,
    /// action and table allow-lists, then the parameter map.
    pub fn validate(&self, sql: &str, params: &Params) -> Result<(), SqlError> {
        let trimmed = sql.trim();
        if trimmed.is_empty() {
            return Err(SqlError::syntax("statement is empty"));
        }
        if trimmed.len() > MAX_STATEMENT_LENGTH {
            return Err(SqlError::syntax(format!(
                "statement length {} exceeds the {MAX_STATEMENT_LENGTH} character limit",
                trimmed.len()
            )));
        }

        let lowered = trimmed.to_ascii_lowercase();

        if let Some(found) = FORBIDDEN_KEYWORDS.find(&lowered) {
            return Err(SqlError::syntax(format!(
                "forbidden keyword '{}'",
                found.as_str()
            )));
        }

        if let Some(label) = match_injection(trimmed) {
            return Err(SqlError::syntax(format!("injection pattern: {label}")));
        }

        let action = effective_action(&lowered)
            .ok_or_else(|| SqlError::syntax("statement must begin with SELECT, INSERT, UPDATE, DELETE or WITH"))?;
        if !self.allowed_actions.contains(action) {
            return Err(SqlError::permission(format!(
                "action '{action}' is not allowed"
            )));
        }

        for table in referenced_tables(&lowered) {
            if !self.allowed_tables.contains(&table) {
                return Err(SqlError::permission(format!(
                    "access to table '{table}' is not allowed"
                )));
            }
        }

        self.validate_params(params)
    }

    fn validate_params(&self, params: &Params) -> Result<(), SqlError> {
        if params.len() > MAX_PARAMETERS {
            return Err(SqlError::params(format!(
                "too many parameters: {} (max {MAX_PARAMETERS})",
                params.len()
            )));
        }

        for (key, value) in params {
            if key.is_empty() {
                return Err(SqlError::params("parameter key cannot be empty"));
            }
            if let Value::String(text) = value {
                if text.len() > MAX_PARAMETER_STRING_LENGTH {
                    return Err(SqlError::params(format!(
                        "parameter '{key}' exceeds the {MAX_PARAMETER_STRING_LENGTH} character limit"
                    )));
                }
                if let Some(label) = match_injection(text) {
                    return Err(SqlError::params(format!(
                        "parameter '{key}' contains an injection pattern: {label}"
                    )));
                }
            }
        }
        Ok(())
    }
}

fn match_injection(text: &str) -> Option<&'static str> {
    INJECTION_PATTERNS
        .iter()
        .find(|(pattern, _)| pattern.is_match(text))
        .map(|(_, label)| *label)
}

/// Primary verb of the statement. For CTEs the first enclosed operation
/// token wins; a CTE without one defaults to select.
pub fn effective_action(lowered: &str) -> Option<&'static str> {
    let mut tokens = lowered.split_whitespace();
    match tokens.next()? {
        "select" => Some("select"),
        "insert" => Some("insert"),
        "update" => Some("update"),
        "delete" => Some("delete"),
        "with" => {
            for token in tokens.take(10) {
                let token = token.trim_matches(|c: char| !c.is_ascii_alphanumeric());
                match token {
                    "select" => return Some("select"),
                    "insert" => return Some("insert"),
                    "update" => return Some("update"),
                    "delete" => return Some("delete"),
                    _ => {}
                }
            }
            Some("select")
        }
        _ => None,
    }
}

/// Identifiers following FROM / JOIN / INTO / UPDATE, with known SQL
/// keywords filtered out. A statement with no extractable tables (e.g.
/// `SELECT 1`) yields nothing and passes the allow-list check.
fn referenced_tables(lowered: &str) -> Vec<String> {
    let tokens: Vec<&str> = lowered.split_whitespace().collect();
    let mut tables = Vec::new();
    for window in tokens.windows(2) {
        if matches!(window[0], "from" | "join" | "into" | "update") {
            let candidate = window[1].trim_matches(|c| matches!(c, '(' | ')' | ',' | ';'));
            if !candidate.is_empty() && !SQL_KEYWORDS.contains(candidate) {
                tables.push(candidate.to_string());
            }
        }
    }
    tables
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator(tables: &[&str], actions: &[&str]) -> SecurityValidator {
        SecurityValidator::new(&SqlConfig {
            allowed_tables: tables.iter().map(|t| t.to_string()).collect(),
            allowed_actions: actions.iter().map(|a| a.to_string()).collect(),
            ..SqlConfig::default()
        })
    }

    fn all_actions() -> Vec<&'static str> {
        vec!["select", "insert", "update", "delete"]
    }

    #[test]
    fn accepts_a_plain_select_on_an_allowed_table() {
        let v = validator(&["items"], &all_actions());
        assert!(v
            .validate("SELECT id, name FROM items WHERE active = $1", &Params::new())
            .is_ok());
    }

    #[test]
    fn column_names_embedding_keywords_pass() {
        let v = validator(&["items"], &all_actions());
        // created_at contains "create"; the scan is word-boundary based.
        assert!(v
            .validate(
                "SELECT id FROM items ORDER BY created_at DESC",
                &Params::new()
            )
            .is_ok());
    }

    #[test]
    fn rejects_ddl_and_privilege_keywords() {
        let v = validator(&["items"], &all_actions());
        for sql in [
            "DROP TABLE items",
            "TRUNCATE items",
            "GRANT ALL ON items TO public",
            "SELECT * FROM items; EXEC sp_helptext",
        ] {
            let err = v.validate(sql, &Params::new()).unwrap_err();
            assert_eq!(err.code(), 4001, "{sql}");
        }
    }

    #[test]
    fn rejects_system_catalog_access() {
        let v = validator(&["items"], &all_actions());
        let err = v
            .validate("SELECT * FROM information_schema.tables", &Params::new())
            .unwrap_err();
        assert_eq!(err.code(), 4001);
        let err = v
            .validate("SELECT * FROM pg_catalog.pg_tables", &Params::new())
            .unwrap_err();
        assert_eq!(err.code(), 4001);
    }

    #[test]
    fn rejects_injection_motifs() {
        let v = validator(&["items"], &all_actions());
        for sql in [
            "SELECT * FROM items UNION SELECT password FROM accounts",
            "SELECT * FROM items WHERE id = 1 OR 1=1",
            "SELECT * FROM items WHERE id = 1 AND 1 = 1",
            "SELECT * FROM items WHERE name = '' INTO OUTFILE '/tmp/x'",
            "SELECT @@version",
        ] {
            let err = v.validate(sql, &Params::new()).unwrap_err();
            assert_eq!(err.code(), 4001, "{sql}");
        }
    }

    #[test]
    fn denied_action_classifies_as_permission() {
        let v = validator(&["items"], &["select"]);
        let err = v
            .validate("DELETE FROM items WHERE id = $1", &Params::new())
            .unwrap_err();
        assert_eq!(err.code(), 4003);
    }

    #[test]
    fn denied_table_names_the_table_in_details() {
        let v = validator(&["items"], &all_actions());
        let err = v.validate("SELECT * FROM users", &Params::new()).unwrap_err();
        assert_eq!(err.code(), 4003);
        assert!(err.details().unwrap().contains("users"));
    }

    #[test]
    fn joins_check_every_referenced_table() {
        let v = validator(&["items"], &all_actions());
        let err = v
            .validate(
                "SELECT i.id FROM items i JOIN orders o ON o.item_id = i.id",
                &Params::new(),
            )
            .unwrap_err();
        assert!(err.details().unwrap().contains("orders"));
    }

    #[test]
    fn statements_without_tables_skip_the_allow_list() {
        let v = validator(&[], &all_actions());
        assert!(v.validate("SELECT 1", &Params::new()).is_ok());
    }

    #[test]
    fn cte_uses_the_enclosed_operation_as_action() {
        assert_eq!(
            effective_action("with recent as (select 1) delete from items"),
            Some("delete")
        );
        assert_eq!(effective_action("with recent as materialized"), Some("select"));
    }

    #[test]
    fn parameter_map_limits() {
        let v = validator(&["items"], &all_actions());

        let mut params = Params::new();
        for i in 0..101 {
            params.insert(format!("p{i}"), serde_json::json!(i));
        }
        let err = v.validate("SELECT * FROM items", &params).unwrap_err();
        assert_eq!(err.code(), 4002);

        let mut params = Params::new();
        params.insert(String::new(), serde_json::json!(1));
        let err = v.validate("SELECT * FROM items", &params).unwrap_err();
        assert_eq!(err.code(), 4002);

        let mut params = Params::new();
        params.insert("blob".into(), serde_json::json!("x".repeat(10_001)));
        let err = v.validate("SELECT * FROM items", &params).unwrap_err();
        assert_eq!(err.code(), 4002);
    }

    #[test]
    fn string_parameter_with_injection_is_rejected() {
        let v = validator(&["items"], &all_actions());
        let mut params = Params::new();
        params.insert("name".into(), serde_json::json!("x' UNION SELECT secret"));
        let err = v.validate("SELECT * FROM items", &params).unwrap_err();
        assert_eq!(err.code(), 4002);
    }

    #[test]
    fn benign_string_parameters_pass() {
        let v = validator(&["items"], &all_actions());
        let mut params = Params::new();
        params.insert("name".into(), serde_json::json!("O'Brien & Sons"));
        assert!(v.validate("SELECT * FROM items", &params).is_ok());
    }

    #[test]
    fn read_statement_detection() {
        assert!(is_read_statement("  SELECT 1"));
        assert!(is_read_statement("WITH x AS (SELECT 1) SELECT * FROM x"));
        assert!(!is_read_statement("UPDATE items SET a = 1"));
    }
}
