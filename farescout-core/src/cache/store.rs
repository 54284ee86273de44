use std::path::PathBuf;
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("invalid cache key {key:?}: keys must match ^[\\w-]+$")]
    InvalidKey { key: String },
    #[error("cache store path not configured")]
    MissingPath,
    #[error("failed to open cache database {path}: {source}")]
    Open {
        source: rusqlite::Error,
        path: PathBuf,
    },
    #[error("cache storage unavailable after {attempts} attempts: {source}")]
    Unavailable {
        attempts: u32,
        source: rusqlite::Error,
    },
    #[error("cache storage operation failed: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("cache file {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("failed to serialize cache record: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// Contract shared by the SQLite and filesystem backends. Reads of expired
/// entries behave as misses and reclaim the entry as a side effect; the batch
/// purge exists for out-of-band maintenance only.
pub trait CacheStore: Send + Sync {
    fn get(&self, key: &str) -> CacheResult<Option<Value>>;
    fn set(&self, key: &str, value: &Value, ttl: Duration) -> CacheResult<()>;
    fn purge_expired(&self) -> CacheResult<u64>;
    fn purge_all(&self) -> CacheResult<u64>;
    fn stats(&self) -> CacheResult<CacheStats>;
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CacheStats {
    pub entries: u64,
    pub expired: u64,
}

/// Rejects keys before any I/O happens. The pattern doubles as the path
/// traversal guard for the filesystem backend, where the key is the filename.
pub fn validate_key(key: &str) -> CacheResult<()> {
    let pattern = Regex::new(r"^[\w-]+$").expect("valid regex");
    if pattern.is_match(key) {
        Ok(())
    } else {
        Err(CacheError::InvalidKey {
            key: key.to_string(),
        })
    }
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub(crate) fn expiry_from_ttl(now: i64, ttl: Duration) -> i64 {
    let ttl_ms = ttl.as_millis().min(i64::MAX as u128) as i64;
    now.saturating_add(ttl_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_identifier_keys() {
        for key in ["flight-LIS-GIG", "a", "UPPER_lower_0", "2024-09-01"] {
            assert!(validate_key(key).is_ok(), "expected {key:?} to validate");
        }
    }

    #[test]
    fn rejects_non_identifier_keys() {
        for key in ["", "a b", "a/b", "../escape", "key.json", "ключ!"] {
            assert!(
                matches!(validate_key(key), Err(CacheError::InvalidKey { .. })),
                "expected {key:?} to be rejected"
            );
        }
    }

    #[test]
    fn expiry_saturates_on_huge_ttl() {
        let expiry = expiry_from_ttl(i64::MAX - 1, Duration::from_secs(3600));
        assert_eq!(expiry, i64::MAX);
    }
}
