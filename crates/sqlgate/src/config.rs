//! Engine configuration.
//!
//! Range violations are configuration errors surfaced at load time, never as
//! request-time failures.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Feature toggles and limits consumed by the execution engine and the
/// security validator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqlConfig {
    pub enabled: bool,
    pub allowed_tables: Vec<String>,
    pub allowed_actions: Vec<String>,
    pub max_query_time_seconds: u64,
    pub max_result_size_rows: usize,
    pub enable_raw_sql: bool,
    pub enable_batch: bool,
    pub enable_transactions: bool,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("SQL functionality is disabled")]
    Disabled,
    #[error("max_query_time_seconds must be within 1..=300, got {0}")]
    QueryTimeOutOfRange(u64),
    #[error("max_result_size_rows must be within 1..=10000, got {0}")]
    ResultSizeOutOfRange(usize),
}

impl SqlConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.enabled {
            return Err(ConfigError::Disabled);
        }
        if !(1..=300).contains(&self.max_query_time_seconds) {
            return Err(ConfigError::QueryTimeOutOfRange(self.max_query_time_seconds));
        }
        if !(1..=10_000).contains(&self.max_result_size_rows) {
            return Err(ConfigError::ResultSizeOutOfRange(self.max_result_size_rows));
        }
        Ok(())
    }

    pub fn max_query_time(&self) -> Duration {
        Duration::from_secs(self.max_query_time_seconds)
    }

    /// Slow-query threshold: half of the per-query budget.
    pub fn slow_query_threshold(&self) -> Duration {
        self.max_query_time() / 2
    }
}

impl Default for SqlConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allowed_tables: Vec::new(),
            allowed_actions: vec![
                "select".to_string(),
                "insert".to_string(),
                "update".to_string(),
                "delete".to_string(),
            ],
            max_query_time_seconds: 30,
            max_result_size_rows: 1_000,
            enable_raw_sql: true,
            enable_batch: true,
            enable_transactions: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(SqlConfig::default().validate().is_ok());
    }

    #[test]
    fn out_of_range_budget_is_a_load_time_error() {
        let config = SqlConfig {
            max_query_time_seconds: 301,
            ..SqlConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::QueryTimeOutOfRange(301))
        ));

        let config = SqlConfig {
            max_query_time_seconds: 0,
            ..SqlConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn out_of_range_result_cap_is_rejected() {
        let config = SqlConfig {
            max_result_size_rows: 10_001,
            ..SqlConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ResultSizeOutOfRange(10_001))
        ));
    }

    #[test]
    fn slow_query_threshold_is_half_the_budget() {
        let config = SqlConfig {
            max_query_time_seconds: 30,
            ..SqlConfig::default()
        };
        assert_eq!(config.slow_query_threshold(), Duration::from_secs(15));
    }
}
