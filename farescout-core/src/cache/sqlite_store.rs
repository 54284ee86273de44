use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde_json::Value;
use tracing::debug;

use crate::config::CacheSection;
use crate::sqlite::configure_connection;

use super::backoff::StorageRetryPolicy;
use super::store::{
    expiry_from_ttl, now_ms, validate_key, CacheError, CacheResult, CacheStats, CacheStore,
};

const CACHE_SCHEMA: &str = include_str!("../../../sql/cache.sql");

#[derive(Debug, Clone)]
pub struct SqliteCacheStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
    busy_timeout_ms: u32,
    retry: StorageRetryPolicy,
}

impl Default for SqliteCacheStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
            busy_timeout_ms: 5000,
            retry: StorageRetryPolicy::default(),
        }
    }
}

impl SqliteCacheStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn busy_timeout_ms(mut self, value: u32) -> Self {
        self.busy_timeout_ms = value;
        self
    }

    pub fn retry(mut self, policy: StorageRetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn build(self) -> CacheResult<SqliteCacheStore> {
        let path = self.path.ok_or(CacheError::MissingPath)?;
        let mut flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };
        if !self.read_only && self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        Ok(SqliteCacheStore {
            path,
            flags,
            busy_timeout_ms: self.busy_timeout_ms,
            retry: self.retry,
        })
    }
}

/// Primary cache backend: one `cache` table with epoch-ms expiry, opened per
/// operation so concurrent processes coordinate purely through SQLite's own
/// locking.
#[derive(Debug, Clone)]
pub struct SqliteCacheStore {
    path: PathBuf,
    flags: OpenFlags,
    busy_timeout_ms: u32,
    retry: StorageRetryPolicy,
}

impl SqliteCacheStore {
    pub fn builder() -> SqliteCacheStoreBuilder {
        SqliteCacheStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> CacheResult<Self> {
        let store = SqliteCacheStoreBuilder::new().path(path).build()?;
        store.initialize()?;
        Ok(store)
    }

    pub fn from_config(section: &CacheSection) -> CacheResult<Self> {
        let store = SqliteCacheStoreBuilder::new()
            .path(&section.db_path)
            .busy_timeout_ms(section.busy_timeout_ms)
            .retry(StorageRetryPolicy::from_config(section))
            .build()?;
        store.initialize()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn initialize(&self) -> CacheResult<()> {
        let conn = self.open().map_err(|source| CacheError::Open {
            source,
            path: self.path.clone(),
        })?;
        conn.execute_batch(CACHE_SCHEMA)?;
        Ok(())
    }

    fn open(&self) -> rusqlite::Result<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags)?;
        configure_connection(&conn, self.busy_timeout_ms)?;
        Ok(conn)
    }
}

impl CacheStore for SqliteCacheStore {
    fn get(&self, key: &str) -> CacheResult<Option<Value>> {
        validate_key(key)?;
        let raw = self.retry.run(|| {
            let conn = self.open()?;
            let now = now_ms();
            let row: Option<(String, i64)> = conn
                .query_row(
                    "SELECT value, expires_at FROM cache WHERE key = ?1",
                    params![key],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            match row {
                Some((_, expires_at)) if expires_at <= now => {
                    conn.execute("DELETE FROM cache WHERE key = ?1", params![key])?;
                    debug!(key, "cache entry expired, reclaimed on read");
                    Ok(None)
                }
                Some((raw, _)) => Ok(Some(raw)),
                None => Ok(None),
            }
        })?;
        raw.map(|text| serde_json::from_str(&text))
            .transpose()
            .map_err(CacheError::from)
    }

    fn set(&self, key: &str, value: &Value, ttl: Duration) -> CacheResult<()> {
        validate_key(key)?;
        let raw = serde_json::to_string(value)?;
        let expires_at = expiry_from_ttl(now_ms(), ttl);
        self.retry.run(|| {
            let conn = self.open()?;
            conn.execute(
                "INSERT INTO cache (key, value, expires_at) VALUES (?1, ?2, ?3)\n\
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
                params![key, raw, expires_at],
            )?;
            Ok(())
        })
    }

    fn purge_expired(&self) -> CacheResult<u64> {
        self.retry.run(|| {
            let conn = self.open()?;
            let removed = conn.execute(
                "DELETE FROM cache WHERE expires_at <= ?1",
                params![now_ms()],
            )?;
            Ok(removed as u64)
        })
    }

    fn purge_all(&self) -> CacheResult<u64> {
        self.retry.run(|| {
            let conn = self.open()?;
            let removed = conn.execute("DELETE FROM cache", [])?;
            Ok(removed as u64)
        })
    }

    fn stats(&self) -> CacheResult<CacheStats> {
        self.retry.run(|| {
            let conn = self.open()?;
            let entries: i64 =
                conn.query_row("SELECT COUNT(*) FROM cache", [], |row| row.get(0))?;
            let expired: i64 = conn.query_row(
                "SELECT COUNT(*) FROM cache WHERE expires_at <= ?1",
                params![now_ms()],
                |row| row.get(0),
            )?;
            Ok(CacheStats {
                entries: entries as u64,
                expired: expired as u64,
            })
        })
    }
}
