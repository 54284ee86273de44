use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::config::CacheSection;

use super::store::{
    expiry_from_ttl, now_ms, validate_key, CacheError, CacheResult, CacheStats, CacheStore,
};

#[derive(Debug, Serialize, Deserialize)]
struct FileRecord {
    value: Value,
    expiration: i64,
}

/// Filesystem cache backend: one JSON file per key, filename equal to the
/// key. Key validation is the only thing standing between a caller-supplied
/// key and the filesystem, so it happens before any path is built.
#[derive(Debug, Clone)]
pub struct FileCacheStore {
    dir: PathBuf,
}

impl FileCacheStore {
    pub fn new(dir: impl AsRef<Path>) -> CacheResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|source| CacheError::Io {
            source,
            path: dir.clone(),
        })?;
        Ok(Self { dir })
    }

    pub fn from_config(section: &CacheSection) -> CacheResult<Self> {
        Self::new(&section.file_dir)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }

    /// Batch sweep for out-of-band maintenance. Unreadable records count as
    /// expired; individual failures are logged and do not stop the sweep.
    pub fn clean_up_expired_keys(&self) -> CacheResult<u64> {
        let now = now_ms();
        let entries = fs::read_dir(&self.dir).map_err(|source| CacheError::Io {
            source,
            path: self.dir.clone(),
        })?;
        let mut removed = 0u64;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            if validate_key(name).is_err() {
                continue;
            }
            let expired = match read_record(&path) {
                Ok(record) => record.expiration <= now,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "discarding unreadable cache record");
                    true
                }
            };
            if expired {
                match fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    Err(err) => {
                        warn!(path = %path.display(), error = %err, "failed to remove expired cache record");
                    }
                }
            }
        }
        Ok(removed)
    }
}

fn read_record(path: &Path) -> CacheResult<FileRecord> {
    let raw = fs::read_to_string(path).map_err(|source| CacheError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    Ok(serde_json::from_str(&raw)?)
}

impl CacheStore for FileCacheStore {
    fn get(&self, key: &str) -> CacheResult<Option<Value>> {
        validate_key(key)?;
        let path = self.entry_path(key);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(CacheError::Io { source, path }),
        };
        let record: FileRecord = match serde_json::from_str(&raw) {
            Ok(record) => record,
            Err(err) => {
                // A record we cannot parse can never be served again.
                warn!(key, error = %err, "discarding unreadable cache record");
                remove_quietly(&path);
                return Ok(None);
            }
        };
        if record.expiration <= now_ms() {
            remove_quietly(&path);
            return Ok(None);
        }
        Ok(Some(record.value))
    }

    fn set(&self, key: &str, value: &Value, ttl: Duration) -> CacheResult<()> {
        validate_key(key)?;
        let record = FileRecord {
            value: value.clone(),
            expiration: expiry_from_ttl(now_ms(), ttl),
        };
        let raw = serde_json::to_string(&record)?;
        let path = self.entry_path(key);
        fs::write(&path, raw).map_err(|source| CacheError::Io { source, path })
    }

    fn purge_expired(&self) -> CacheResult<u64> {
        self.clean_up_expired_keys()
    }

    fn purge_all(&self) -> CacheResult<u64> {
        let entries = fs::read_dir(&self.dir).map_err(|source| CacheError::Io {
            source,
            path: self.dir.clone(),
        })?;
        let mut removed = 0u64;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            if validate_key(name).is_err() {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "failed to remove cache record");
                }
            }
        }
        Ok(removed)
    }

    fn stats(&self) -> CacheResult<CacheStats> {
        let now = now_ms();
        let entries = fs::read_dir(&self.dir).map_err(|source| CacheError::Io {
            source,
            path: self.dir.clone(),
        })?;
        let mut stats = CacheStats::default();
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            if validate_key(name).is_err() {
                continue;
            }
            stats.entries += 1;
            if let Ok(record) = read_record(&path) {
                if record.expiration <= now {
                    stats.expired += 1;
                }
            }
        }
        Ok(stats)
    }
}

fn remove_quietly(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %err, "failed to remove cache record");
        }
    }
}
