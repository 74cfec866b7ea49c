//! Driver-error classification onto the stable taxonomy.
//!
//! Matching order: known backend-specific codes first, then regex families
//! over the lower-cased message text, then the 4001 default with the
//! original text preserved in `details`.

use std::sync::LazyLock;

use regex::Regex;

use crate::driver::DriverError;
use crate::error::SqlError;
use crate::model::DatabaseKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Syntax,
    Params,
    Permission,
    Connection,
    Transaction,
    Timeout,
    ResultSize,
}

impl Kind {
    fn build(self, details: String) -> SqlError {
        match self {
            Kind::Syntax => SqlError::syntax(details),
            Kind::Params => SqlError::params(details),
            Kind::Permission => SqlError::permission(details),
            Kind::Connection => SqlError::connection(details),
            Kind::Transaction => SqlError::transaction(details),
            Kind::Timeout => SqlError::timeout(details),
            Kind::ResultSize => SqlError::result_size(details),
        }
    }
}

/// Message-text families shared by both backends, in matching order.
static MESSAGE_FAMILIES: LazyLock<Vec<(Regex, Kind)>> = LazyLock::new(|| {
    [
        (r"syntax|parse|invalid statement", Kind::Syntax),
        (r"privilege|permission|denied", Kind::Permission),
        (r"connection|tns|network|unreachable", Kind::Connection),
        (r"deadlock|serialization|transaction", Kind::Transaction),
        (r"timeout|deadline", Kind::Timeout),
        (r"too large|limit exceeded", Kind::ResultSize),
        (r"parameter|argument|missing value", Kind::Params),
    ]
    .into_iter()
    .map(|(pattern, kind)| (Regex::new(pattern).expect("family pattern"), kind))
    .collect()
});

static PG_SQLSTATE_IN_MESSAGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"sqlstate:?\s*([0-9a-z]{5})").expect("sqlstate pattern"));

static ORA_CODE_IN_MESSAGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"ora-(\d{5})").expect("ora code pattern"));

fn postgres_code_kind(code: &str) -> Option<Kind> {
    match code {
        "42601" => Some(Kind::Syntax),
        "42501" => Some(Kind::Permission),
        "08000" | "08003" | "08006" => Some(Kind::Connection),
        "40001" | "40P01" | "40p01" => Some(Kind::Transaction),
        "57014" => Some(Kind::Timeout),
        _ => None,
    }
}

fn oracle_code_kind(code: &str) -> Option<Kind> {
    match code {
        "ora-00900" | "ora-00901" | "ora-00902" | "ora-00903" | "ora-00904" | "ora-00955" => {
            Some(Kind::Syntax)
        }
        "ora-00942" | "ora-01017" | "ora-01031" => Some(Kind::Permission),
        "ora-01034" | "ora-01089" | "ora-03113" | "ora-03114" | "ora-12154" => {
            Some(Kind::Connection)
        }
        "ora-12170" | "ora-12571" => Some(Kind::Timeout),
        "ora-00060" | "ora-08177" => Some(Kind::Transaction),
        _ => None,
    }
}

pub struct ErrorClassifier {
    kind: DatabaseKind,
}

impl ErrorClassifier {
    pub fn new(kind: DatabaseKind) -> Self {
        Self { kind }
    }

    /// Maps a driver error onto the taxonomy, attaching the extracted
    /// backend state code where one is present.
    pub fn classify(&self, error: &DriverError) -> SqlError {
        let details = error.message.clone();
        let lowered = error.message.to_ascii_lowercase();
        let state = self.sql_state(error, &lowered);

        if let Some(kind) = self.code_kind(error, &lowered) {
            let classified = kind.build(details);
            return match &state {
                Some(state) => classified.with_sql_state(state.clone()),
                None => classified,
            };
        }

        for (pattern, kind) in MESSAGE_FAMILIES.iter() {
            if pattern.is_match(&lowered) {
                let classified = kind.build(details);
                return match &state {
                    Some(state) => classified.with_sql_state(state.clone()),
                    None => classified,
                };
            }
        }

        let fallback = SqlError::syntax(details);
        match state {
            Some(state) => fallback.with_sql_state(state),
            None => fallback,
        }
    }

    fn code_kind(&self, error: &DriverError, lowered_message: &str) -> Option<Kind> {
        match self.kind {
            DatabaseKind::Postgres => {
                if let Some(code) = &error.code {
                    if let Some(kind) = postgres_code_kind(&code.to_ascii_lowercase()) {
                        return Some(kind);
                    }
                }
                PG_SQLSTATE_IN_MESSAGE
                    .captures(lowered_message)
                    .and_then(|captures| postgres_code_kind(&captures[1]))
            }
            DatabaseKind::Oracle => {
                let from_code = error
                    .code
                    .as_deref()
                    .map(normalize_oracle_code)
                    .and_then(|code| oracle_code_kind(&code));
                if from_code.is_some() {
                    return from_code;
                }
                ORA_CODE_IN_MESSAGE
                    .captures(lowered_message)
                    .and_then(|captures| oracle_code_kind(&format!("ora-{}", &captures[1])))
            }
        }
    }

    /// Backend state string surfaced alongside the taxonomy code.
    fn sql_state(&self, error: &DriverError, lowered_message: &str) -> Option<String> {
        match self.kind {
            DatabaseKind::Postgres => error
                .code
                .clone()
                .or_else(|| {
                    PG_SQLSTATE_IN_MESSAGE
                        .captures(lowered_message)
                        .map(|captures| captures[1].to_string())
                })
                .map(|state| state.to_uppercase()),
            DatabaseKind::Oracle => error
                .code
                .as_deref()
                .map(normalize_oracle_code)
                .or_else(|| {
                    ORA_CODE_IN_MESSAGE
                        .captures(lowered_message)
                        .map(|captures| format!("ora-{}", &captures[1]))
                })
                .map(|code| code.to_uppercase()),
        }
    }
}

fn normalize_oracle_code(code: &str) -> String {
    let lowered = code.to_ascii_lowercase();
    if lowered.starts_with("ora-") {
        lowered
    } else {
        format!("ora-{lowered}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn postgres() -> ErrorClassifier {
        ErrorClassifier::new(DatabaseKind::Postgres)
    }

    fn oracle() -> ErrorClassifier {
        ErrorClassifier::new(DatabaseKind::Oracle)
    }

    #[test]
    fn postgres_sqlstate_codes_win_over_message_text() {
        let err = DriverError::with_code("canceling statement due to user request", "57014");
        let classified = postgres().classify(&err);
        assert_eq!(classified.code(), 4006);
        assert_eq!(classified.sql_state(), None); // timeout carries no state

        let err = DriverError::with_code("deadlock detected", "40P01");
        let classified = postgres().classify(&err);
        assert_eq!(classified.code(), 4005);
        assert_eq!(classified.sql_state(), Some("40P01"));
    }

    #[test]
    fn postgres_sqlstate_embedded_in_message_is_used() {
        let err = DriverError::new("ERROR: SQLSTATE: 42601 at character 12");
        let classified = postgres().classify(&err);
        assert_eq!(classified.code(), 4001);
        assert_eq!(classified.sql_state(), Some("42601"));
    }

    #[test]
    fn oracle_codes_map_to_the_taxonomy() {
        let cases = [
            ("ORA-00904: invalid identifier", 4001),
            ("ORA-00942: table or view does not exist", 4003),
            ("ORA-12154: TNS could not resolve", 4004),
            ("ORA-12170: TNS connect timeout occurred", 4006),
            ("ORA-00060: deadlock detected while waiting", 4005),
        ];
        for (message, expected) in cases {
            let classified = oracle().classify(&DriverError::new(message));
            assert_eq!(classified.code(), expected, "{message}");
        }
    }

    #[test]
    fn message_families_cover_common_surfaces() {
        let cases = [
            ("syntax error at or near \"selct\"", 4001),
            ("permission denied for table items", 4003),
            ("could not connect to server: network unreachable", 4004),
            ("serialization failure during concurrent update", 4005),
            ("canceling statement due to statement timeout", 4006),
            ("result set too large to materialize", 4007),
            ("bind message supplies 0 parameters", 4002),
        ];
        for (message, expected) in cases {
            let classified = postgres().classify(&DriverError::new(message));
            assert_eq!(classified.code(), expected, "{message}");
        }
    }

    #[test]
    fn unknown_errors_default_to_syntax_with_original_text() {
        let err = DriverError::new("splines failed to reticulate");
        let classified = postgres().classify(&err);
        assert_eq!(classified.code(), 4001);
        assert_eq!(classified.details(), Some("splines failed to reticulate"));

        let classified = oracle().classify(&err);
        assert_eq!(classified.code(), 4001);
    }

    #[test]
    fn classification_is_total_over_a_corpus() {
        let corpus = [
            "duplicate key value violates unique constraint",
            "ORA-99999: unknown",
            "pool timed out while waiting for an open connection",
            "terminating connection due to administrator command",
            "value too long for type character varying(10)",
            "",
        ];
        for message in corpus {
            let code = postgres().classify(&DriverError::new(message)).code();
            assert!((4001..=4007).contains(&code), "{message} -> {code}");
            let code = oracle().classify(&DriverError::new(message)).code();
            assert!((4001..=4007).contains(&code), "{message} -> {code}");
        }
    }
}
