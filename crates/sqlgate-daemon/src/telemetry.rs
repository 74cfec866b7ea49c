//! Logging bootstrap.
//!
//! The monitor's records travel over `tracing`; this module wires the
//! subscriber with an `EnvFilter` and the configured output format.

use std::env;

use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Initializes the global subscriber from `SQLGATE_LOG_FORMAT` (`text` or
/// `json`) and the standard `RUST_LOG` filter.
pub fn init_from_env() {
    let (format, warning) = parse_log_format(env::var("SQLGATE_LOG_FORMAT").ok().as_deref());
    init(format);
    if let Some(message) = warning {
        warn!("{message}");
    }
}

pub fn init(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }
}

pub fn parse_log_format(raw: Option<&str>) -> (LogFormat, Option<String>) {
    match raw {
        None => (LogFormat::Text, None),
        Some(value) => match value.trim().to_ascii_lowercase().as_str() {
            "" => (
                LogFormat::Text,
                Some("SQLGATE_LOG_FORMAT is empty; defaulting to text".to_string()),
            ),
            "text" => (LogFormat::Text, None),
            "json" => (LogFormat::Json, None),
            other => (
                LogFormat::Text,
                Some(format!(
                    "SQLGATE_LOG_FORMAT='{other}' is not one of text|json; defaulting to text"
                )),
            ),
        },
    }
}
