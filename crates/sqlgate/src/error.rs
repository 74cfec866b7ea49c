//! Stable error taxonomy for the SQL pipeline.
//!
//! Every failure in the pipeline resolves to one [`SqlError`] variant. The
//! numeric codes are part of the wire contract and never change; conversion
//! into the JSON payload happens once, at the HTTP boundary, via
//! [`ErrorPayload`].

use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

/// Closed sum of pipeline failure kinds. `code()` projects onto the stable
/// numeric taxonomy (4001..4007).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SqlError {
    #[error("SQL syntax error")]
    Syntax {
        details: Option<String>,
        sql_state: Option<String>,
    },
    #[error("Invalid request parameters")]
    Params { details: Option<String> },
    #[error("Permission denied")]
    Permission { details: Option<String> },
    #[error("Database connection error")]
    Connection {
        details: Option<String>,
        sql_state: Option<String>,
    },
    #[error("Transaction failed")]
    Transaction {
        details: Option<String>,
        sql_state: Option<String>,
    },
    #[error("Query timeout")]
    Timeout { details: Option<String> },
    #[error("Result set too large")]
    ResultSize { details: Option<String> },
}

impl SqlError {
    pub fn syntax(details: impl Into<String>) -> Self {
        SqlError::Syntax {
            details: Some(details.into()),
            sql_state: None,
        }
    }

    pub fn params(details: impl Into<String>) -> Self {
        SqlError::Params {
            details: Some(details.into()),
        }
    }

    pub fn permission(details: impl Into<String>) -> Self {
        SqlError::Permission {
            details: Some(details.into()),
        }
    }

    pub fn connection(details: impl Into<String>) -> Self {
        SqlError::Connection {
            details: Some(details.into()),
            sql_state: None,
        }
    }

    pub fn transaction(details: impl Into<String>) -> Self {
        SqlError::Transaction {
            details: Some(details.into()),
            sql_state: None,
        }
    }

    pub fn timeout(details: impl Into<String>) -> Self {
        SqlError::Timeout {
            details: Some(details.into()),
        }
    }

    pub fn result_size(details: impl Into<String>) -> Self {
        SqlError::ResultSize {
            details: Some(details.into()),
        }
    }

    /// Stable numeric code of this error kind.
    pub fn code(&self) -> u16 {
        match self {
            SqlError::Syntax { .. } => 4001,
            SqlError::Params { .. } => 4002,
            SqlError::Permission { .. } => 4003,
            SqlError::Connection { .. } => 4004,
            SqlError::Transaction { .. } => 4005,
            SqlError::Timeout { .. } => 4006,
            SqlError::ResultSize { .. } => 4007,
        }
    }

    pub fn details(&self) -> Option<&str> {
        match self {
            SqlError::Syntax { details, .. }
            | SqlError::Params { details }
            | SqlError::Permission { details }
            | SqlError::Connection { details, .. }
            | SqlError::Transaction { details, .. }
            | SqlError::Timeout { details }
            | SqlError::ResultSize { details } => details.as_deref(),
        }
    }

    pub fn sql_state(&self) -> Option<&str> {
        match self {
            SqlError::Syntax { sql_state, .. }
            | SqlError::Connection { sql_state, .. }
            | SqlError::Transaction { sql_state, .. } => sql_state.as_deref(),
            _ => None,
        }
    }

    /// Attaches a backend-specific state code where the variant carries one.
    pub fn with_sql_state(mut self, state: impl Into<String>) -> Self {
        match &mut self {
            SqlError::Syntax { sql_state, .. }
            | SqlError::Connection { sql_state, .. }
            | SqlError::Transaction { sql_state, .. } => *sql_state = Some(state.into()),
            _ => {}
        }
        self
    }
}

/// Wire representation of an [`SqlError`], embedded in response envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ErrorPayload {
    pub code: u16,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql_state: Option<String>,
}

impl From<&SqlError> for ErrorPayload {
    fn from(error: &SqlError) -> Self {
        Self {
            code: error.code(),
            message: error.to_string(),
            details: error.details().map(str::to_owned),
            sql_state: error.sql_state().map(str::to_owned),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_cover_the_taxonomy() {
        let errors = [
            SqlError::syntax("x"),
            SqlError::params("x"),
            SqlError::permission("x"),
            SqlError::connection("x"),
            SqlError::transaction("x"),
            SqlError::timeout("x"),
            SqlError::result_size("x"),
        ];
        let codes: Vec<u16> = errors.iter().map(SqlError::code).collect();
        assert_eq!(codes, vec![4001, 4002, 4003, 4004, 4005, 4006, 4007]);
    }

    #[test]
    fn messages_are_short_and_classifier_derived() {
        let err = SqlError::syntax("unexpected token at position 14");
        assert_eq!(err.to_string(), "SQL syntax error");
        assert_eq!(err.details(), Some("unexpected token at position 14"));
    }

    #[test]
    fn payload_carries_sql_state_when_present() {
        let err = SqlError::transaction("deadlock detected").with_sql_state("40P01");
        let payload = ErrorPayload::from(&err);
        assert_eq!(payload.code, 4005);
        assert_eq!(payload.sql_state.as_deref(), Some("40P01"));
    }

    #[test]
    fn sql_state_is_ignored_on_kinds_without_one() {
        let err = SqlError::timeout("budget exhausted").with_sql_state("57014");
        assert_eq!(err.sql_state(), None);
    }
}
