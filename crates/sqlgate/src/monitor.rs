//! Query monitoring: ids, timing, scrubbed previews, slow-query records.
//!
//! Output is the structured log stream; nothing is aggregated in memory.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::{debug, error, info, warn};

use crate::error::SqlError;
use crate::model::DatabaseKind;

const PREVIEW_LIMIT: usize = 200;

pub struct QueryMonitor {
    slow_query: Duration,
    sequence: AtomicU64,
}

impl QueryMonitor {
    pub fn new(slow_query: Duration) -> Self {
        Self {
            slow_query,
            sequence: AtomicU64::new(0),
        }
    }

    /// Opens a span for one execution attempt.
    pub fn start(&self, database: DatabaseKind, action: &str, sql: &str) -> QuerySpan {
        let id = self.next_query_id();
        let preview = scrub_sql(sql);
        debug!(
            target: "sqlgate::monitor",
            query_id = %id,
            database = %database,
            action,
            sql = %preview,
            "query started"
        );
        QuerySpan {
            id,
            database,
            action: action.to_string(),
            preview,
            started: Instant::now(),
            slow_query: self.slow_query,
        }
    }

    fn next_query_id(&self) -> String {
        let epoch_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        format!("sql_{epoch_ns}_{seq}")
    }
}

pub struct QuerySpan {
    pub id: String,
    database: DatabaseKind,
    action: String,
    preview: String,
    started: Instant,
    slow_query: Duration,
}

impl QuerySpan {
    pub fn elapsed_ms(&self) -> f64 {
        self.started.elapsed().as_secs_f64() * 1_000.0
    }

    pub fn finish_ok(self, affected_rows: u64, result_rows: u64) {
        let duration_ms = self.elapsed_ms();
        info!(
            target: "sqlgate::monitor",
            query_id = %self.id,
            database = %self.database,
            action = %self.action,
            duration_ms,
            affected_rows,
            result_rows,
            "query completed"
        );
        self.record_slow(duration_ms);
    }

    pub fn finish_err(self, error: &SqlError) {
        let duration_ms = self.elapsed_ms();
        error!(
            target: "sqlgate::monitor",
            query_id = %self.id,
            database = %self.database,
            action = %self.action,
            duration_ms,
            error_code = error.code(),
            error = %error,
            "query failed"
        );
        self.record_slow(duration_ms);
    }

    fn record_slow(self, duration_ms: f64) {
        if self.started.elapsed() > self.slow_query {
            warn!(
                target: "sqlgate::monitor",
                query_id = %self.id,
                database = %self.database,
                action = %self.action,
                duration_ms,
                sql = %self.preview,
                "SLOW QUERY"
            );
        }
    }
}

/// Preview-safe rendition of a statement: string literals collapse to `?`
/// and the result is capped at 200 characters.
pub fn scrub_sql(sql: &str) -> String {
    let mut scrubbed = String::with_capacity(sql.len().min(PREVIEW_LIMIT + 3));
    let mut chars = sql.chars();

    while let Some(c) = chars.next() {
        if c == '\'' {
            scrubbed.push('?');
            let mut previous = c;
            for inner in chars.by_ref() {
                if inner == '\'' && previous != '\\' {
                    break;
                }
                previous = inner;
            }
        } else {
            scrubbed.push(c);
        }
    }

    if scrubbed.len() > PREVIEW_LIMIT {
        let mut cut = PREVIEW_LIMIT;
        while !scrubbed.is_char_boundary(cut) {
            cut -= 1;
        }
        scrubbed.truncate(cut);
        scrubbed.push_str("...");
    }
    scrubbed
}

/// API keys never appear whole in records: `first4****last4`.
pub fn mask_api_key(key: &str) -> String {
    if key.is_empty() {
        return String::new();
    }
    if key.len() <= 8 {
        return "****".to_string();
    }
    format!("{}****{}", &key[..4], &key[key.len() - 4..])
}
