//! API-key permission store.
//!
//! Keys and their permission sets come from configuration; the daemon never
//! inspects key material beyond the lookup, and keys appear in logs only in
//! masked form.

use std::collections::HashMap;

use sqlgate::mask_api_key;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid API key entry '{0}': expected key=permission|permission")]
    InvalidEntry(String),
}

#[derive(Debug, Clone, Default)]
pub struct ApiKeyManager {
    keys: HashMap<String, Vec<String>>,
}

impl ApiKeyManager {
    pub fn new(keys: HashMap<String, Vec<String>>) -> Self {
        Self { keys }
    }

    /// Parses `key=sql.query|sql.insert;other=sql.*` style specs.
    pub fn parse(spec: &str) -> Result<Self, AuthError> {
        let mut keys = HashMap::new();
        for entry in spec.split(';') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let (key, permissions) = entry
                .split_once('=')
                .ok_or_else(|| AuthError::InvalidEntry(entry.to_string()))?;
            let key = key.trim();
            if key.is_empty() {
                return Err(AuthError::InvalidEntry(entry.to_string()));
            }
            let permissions: Vec<String> = permissions
                .split('|')
                .map(str::trim)
                .filter(|permission| !permission.is_empty())
                .map(str::to_string)
                .collect();
            if permissions.is_empty() {
                return Err(AuthError::InvalidEntry(entry.to_string()));
            }
            keys.insert(key.to_string(), permissions);
        }
        Ok(Self { keys })
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Permission check with a trailing-`*` wildcard (`sql.*`, `*`).
    pub fn has_permission(&self, key: &str, permission: &str) -> bool {
        let Some(granted) = self.keys.get(key) else {
            warn!(api_key = %mask_api_key(key), "unknown API key");
            return false;
        };
        granted
            .iter()
            .any(|entry| permission_matches(entry, permission))
    }
}

fn permission_matches(granted: &str, requested: &str) -> bool {
    if granted == requested {
        return true;
    }
    match granted.strip_suffix('*') {
        Some(prefix) => requested.starts_with(prefix),
        None => false,
    }
}
