//! Structural validation: shape checks that run before the security gate.
//!
//! Length and complexity caps, balanced quoting, a valid leading keyword and
//! a function allow-list. Everything here classifies as a syntax failure.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::SqlError;

const MAX_STATEMENT_LENGTH: usize = 10_000;
const MAX_COMPLEXITY: u32 = 100;

/// Aggregate, string, math, date and conditional functions a statement may
/// call. Anything else identifier-adjacent to `(` is rejected.
static ALLOWED_FUNCTIONS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        // aggregates
        "count", "sum", "avg", "max", "min",
        // string
        "upper", "lower", "trim", "length", "substr", "substring", "concat", "replace",
        // math
        "abs", "round", "ceil", "floor", "mod",
        // date
        "now", "current_date", "current_time", "current_timestamp", "date", "time", "year",
        "month", "day",
        // conditional
        "case", "when", "then", "else", "end", "coalesce", "nullif", "isnull", "ifnull",
    ]
    .into_iter()
    .collect()
});

/// Keywords excluded from function-call detection.
static SQL_KEYWORDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "select", "from", "where", "and", "or", "order", "by", "group", "having", "limit",
        "offset", "join", "inner", "left", "right", "full", "outer", "on", "as", "distinct",
        "union", "all", "exists", "in", "not", "is", "null", "like", "between", "case", "when",
        "then", "else", "end", "with", "values",
    ]
    .into_iter()
    .collect()
});

static FUNCTION_CALL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\w+)\(").expect("function call pattern"));

static AGGREGATE_CALL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(?:count|sum|avg|max|min)\s*\(").expect("aggregate pattern"));

/// `SELECT 1`, `SELECT NOW()`, `SELECT 'literal'` and friends do not need a
/// FROM clause.
static SIMPLE_EXPRESSIONS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"^select\s+\d+",
        r"^select\s+now\(\)",
        r"^select\s+'[^']*'",
        r#"^select\s+"[^"]*""#,
        r"^select\s+current_",
    ]
    .into_iter()
    .map(|pattern| Regex::new(pattern).expect("simple expression pattern"))
    .collect()
});

#[derive(Debug, Default)]
pub struct StructureValidator;

impl StructureValidator {
    pub fn new() -> Self {
        Self
    }

    pub fn validate(&self, sql: &str) -> Result<(), SqlError> {
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

        let complexity = complexity_score(&lowered);
        if complexity > MAX_COMPLEXITY {
            return Err(SqlError::syntax(format!(
                "query complexity {complexity} overflows the maximum of {MAX_COMPLEXITY}"
            )));
        }

        check_parentheses(trimmed)?;
        check_quotes(trimmed)?;
        check_leading_keyword(&lowered)?;
        check_functions(&lowered)?;
        Ok(())
    }
}

/// Weighted token count. Word tokens only, so `brand` does not score as
/// `and`.
fn complexity_score(lowered: &str) -> u32 {
    let tokens: Vec<&str> = lowered
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|token| !token.is_empty())
        .collect();

    let count_token = |word: &str| tokens.iter().filter(|t| **t == word).count() as u32;
    let count_pair = |first: &str, second: &str| {
        tokens
            .windows(2)
            .filter(|pair| pair[0] == first && pair[1] == second)
            .count() as u32
    };

    let mut score = 1;
    score += count_token("join") * 5;
    score += count_token("select").saturating_sub(1) * 3; // nested selects
    score += count_token("where") * 2;
    score += count_token("or") * 2;
    score += count_token("and");
    score += count_pair("group", "by") * 3;
    score += count_pair("order", "by") * 2;
    score += count_token("having") * 3;
    score += count_token("union") * 5;
    score += count_token("with") * 4;
    score += AGGREGATE_CALL.find_iter(lowered).count() as u32 * 2;
    score
}

fn check_parentheses(sql: &str) -> Result<(), SqlError> {
    let mut depth: i32 = 0;
    for c in sql.chars() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return Err(SqlError::syntax("unmatched closing parenthesis"));
                }
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(SqlError::syntax("unmatched opening parenthesis"));
    }
    Ok(())
}

fn check_quotes(sql: &str) -> Result<(), SqlError> {
    let chars: Vec<char> = sql.chars().collect();
    let mut in_single = false;
    let mut in_double = false;

    for (i, c) in chars.iter().enumerate() {
        let escaped = i > 0 && chars[i - 1] == '\\';
        match c {
            '\'' if !in_double && !escaped => in_single = !in_single,
            '"' if !in_single && !escaped => in_double = !in_double,
            _ => {}
        }
    }

    if in_single {
        return Err(SqlError::syntax("unmatched single quote"));
    }
    if in_double {
        return Err(SqlError::syntax("unmatched double quote"));
    }
    Ok(())
}

fn check_leading_keyword(lowered: &str) -> Result<(), SqlError> {
    let starter = lowered.split_whitespace().next().unwrap_or_default();
    if !matches!(starter, "select" | "insert" | "update" | "delete" | "with") {
        return Err(SqlError::syntax(
            "statement must begin with SELECT, INSERT, UPDATE, DELETE or WITH",
        ));
    }

    if starter == "select"
        && !lowered.contains("from")
        && !SIMPLE_EXPRESSIONS.iter().any(|p| p.is_match(lowered))
    {
        return Err(SqlError::syntax(
            "SELECT must include a FROM clause or be a simple expression",
        ));
    }
    Ok(())
}

fn check_functions(lowered: &str) -> Result<(), SqlError> {
    for capture in FUNCTION_CALL.captures_iter(lowered) {
        let name = &capture[1];
        if SQL_KEYWORDS.contains(name) {
            continue;
        }
        if !ALLOWED_FUNCTIONS.contains(name) {
            return Err(SqlError::syntax(format!("function '{name}' is not allowed")));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_typical_statements() {
        let v = StructureValidator::new();
        for sql in [
            "SELECT id, name FROM items WHERE active = $1",
            "INSERT INTO items (sku, name) VALUES ($1, $2)",
            "UPDATE items SET name = $1 WHERE id = $2",
            "DELETE FROM items WHERE id = $1",
            "SELECT count(*) FROM items GROUP BY category HAVING count(*) > $1",
            "SELECT 1",
            "SELECT NOW()",
            "SELECT 'ping'",
        ] {
            assert!(v.validate(sql).is_ok(), "{sql}");
        }
    }

    #[test]
    fn rejects_non_statements() {
        let v = StructureValidator::new();
        assert!(v.validate("").is_err());
        assert!(v.validate("EXPLAIN SELECT 1").is_err());
        assert!(v.validate("SELECT id").is_err());
    }

    #[test]
    fn rejects_over_long_statements() {
        let v = StructureValidator::new();
        let sql = format!("SELECT * FROM items WHERE name = '{}'", "x".repeat(10_000));
        let err = v.validate(&sql).unwrap_err();
        assert!(err.details().unwrap().contains("character limit"));
    }

    #[test]
    fn complexity_overflow_names_the_score() {
        let v = StructureValidator::new();
        let joins = "JOIN items i ON i.id = o.id ".repeat(25);
        let sql = format!("SELECT * FROM orders o {joins}");
        let err = v.validate(&sql).unwrap_err();
        assert_eq!(err.code(), 4001);
        assert!(err.details().unwrap().contains("complexity"));
    }

    #[test]
    fn complexity_counts_tokens_not_substrings() {
        // "brand" must not score as "and", nor "android" as "and"/"or".
        let simple = complexity_score("select * from items where brand = $1");
        let with_and = complexity_score("select * from items where brand = $1 and x = $2");
        assert_eq!(with_and, simple + 1);
    }

    #[test]
    fn unbalanced_parentheses_are_rejected() {
        let v = StructureValidator::new();
        assert!(v.validate("SELECT count( FROM items").is_err());
        assert!(v.validate("SELECT * FROM items WHERE id IN (1, 2))").is_err());
    }

    #[test]
    fn unbalanced_quotes_are_rejected() {
        let v = StructureValidator::new();
        assert!(v.validate("SELECT * FROM items WHERE name = 'abc").is_err());
        assert!(v.validate(r#"SELECT * FROM items WHERE name = "abc"#).is_err());
    }

    #[test]
    fn escaped_quotes_inside_literals_are_skipped() {
        let v = StructureValidator::new();
        assert!(v
            .validate(r"SELECT * FROM items WHERE name = 'O\'Brien'")
            .is_ok());
    }

    #[test]
    fn disallowed_functions_are_rejected() {
        let v = StructureValidator::new();
        let err = v
            .validate("SELECT pg_read_file('/etc/passwd') FROM items")
            .unwrap_err();
        assert!(err.details().unwrap().contains("pg_read_file"));
    }

    #[test]
    fn allowed_function_families_pass() {
        let v = StructureValidator::new();
        assert!(v
            .validate("SELECT upper(name), round(price) FROM items WHERE coalesce(flag, 0) = 1")
            .is_ok());
    }
}
