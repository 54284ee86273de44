use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::CacheSection;

use super::store::CacheStore;

/// Memoizes an expensive asynchronous operation behind the cache contract.
/// Storage trouble degrades to recomputation: the producer's result is always
/// returned to the caller, cached or not.
#[derive(Clone)]
pub struct ResultCache {
    store: Arc<dyn CacheStore>,
    enabled: bool,
    ttl: Duration,
}

impl ResultCache {
    pub fn new(store: Arc<dyn CacheStore>, enabled: bool, ttl: Duration) -> Self {
        Self {
            store,
            enabled,
            ttl,
        }
    }

    pub fn from_config(section: &CacheSection, store: Arc<dyn CacheStore>) -> Self {
        Self::new(
            store,
            section.enabled,
            Duration::from_secs(section.ttl_seconds),
        )
    }

    pub fn is_active(&self) -> bool {
        self.enabled && !self.ttl.is_zero()
    }

    pub async fn run_and_cache<T, E, F, Fut>(&self, key: &str, producer: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.is_active() {
            return producer().await;
        }

        if let Some(value) = self.lookup(key).await {
            match serde_json::from_value(value) {
                Ok(decoded) => {
                    debug!(key, "serving cached result");
                    return Ok(decoded);
                }
                Err(err) => {
                    warn!(key, error = %err, "cached result does not decode, recomputing");
                }
            }
        }

        let produced = producer().await?;
        self.persist(key, &produced).await;
        Ok(produced)
    }

    async fn lookup(&self, key: &str) -> Option<Value> {
        let store = Arc::clone(&self.store);
        let key = key.to_string();
        let fetched = tokio::task::spawn_blocking(move || store.get(&key)).await;
        match fetched {
            Ok(Ok(value)) => value,
            Ok(Err(err)) => {
                warn!(error = %err, "cache lookup failed, treating as miss");
                None
            }
            Err(err) => {
                warn!(error = %err, "cache lookup task failed, treating as miss");
                None
            }
        }
    }

    async fn persist<T: Serialize>(&self, key: &str, value: &T) {
        let encoded = match serde_json::to_value(value) {
            Ok(encoded) => encoded,
            Err(err) => {
                warn!(key, error = %err, "result does not encode, skipping cache store");
                return;
            }
        };
        let store = Arc::clone(&self.store);
        let key_owned = key.to_string();
        let ttl = self.ttl;
        let stored =
            tokio::task::spawn_blocking(move || store.set(&key_owned, &encoded, ttl)).await;
        match stored {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(key, error = %err, "cache store failed, result not memoized"),
            Err(err) => warn!(key, error = %err, "cache store task failed, result not memoized"),
        }
    }
}

impl std::fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCache")
            .field("enabled", &self.enabled)
            .field("ttl", &self.ttl)
            .finish()
    }
}

/// Derives a content-addressed cache key from a scraper name and its query:
/// the canonical JSON of the query is hashed so any query shape maps to a key
/// that passes the identifier check.
pub fn query_cache_key<Q: Serialize>(scraper: &str, query: &Q) -> Option<String> {
    let payload = match serde_json::to_string(query) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(scraper, error = %err, "query does not encode, cannot derive cache key");
            return None;
        }
    };
    let digest = Sha256::digest(payload.as_bytes());
    let hex = hex::encode(digest);
    let scraper: String = scraper
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    Some(format!("{scraper}-{}", &hex[..16]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheError, CacheResult, CacheStats, FileCacheStore, SqliteCacheStore};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    struct BrokenStore;

    impl CacheStore for BrokenStore {
        fn get(&self, _key: &str) -> CacheResult<Option<Value>> {
            Err(CacheError::MissingPath)
        }

        fn set(&self, _key: &str, _value: &Value, _ttl: Duration) -> CacheResult<()> {
            Err(CacheError::MissingPath)
        }

        fn purge_expired(&self) -> CacheResult<u64> {
            Err(CacheError::MissingPath)
        }

        fn purge_all(&self) -> CacheResult<u64> {
            Err(CacheError::MissingPath)
        }

        fn stats(&self) -> CacheResult<CacheStats> {
            Err(CacheError::MissingPath)
        }
    }

    async fn produce_counted(
        counter: &AtomicUsize,
    ) -> Result<serde_json::Value, std::convert::Infallible> {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(json!({"total": 42}))
    }

    #[tokio::test]
    async fn producer_runs_once_per_ttl_window() {
        let dir = tempdir().expect("tempdir");
        let store = SqliteCacheStore::new(dir.path().join("cache.db")).expect("store");
        let cache = ResultCache::new(Arc::new(store), true, Duration::from_secs(60));
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let value = cache
                .run_and_cache("itinerary", || produce_counted(&calls))
                .await
                .expect("run");
            assert_eq!(value, json!({"total": 42}));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_entry_recomputes() {
        let dir = tempdir().expect("tempdir");
        let store = FileCacheStore::new(dir.path()).expect("store");
        let cache = ResultCache::new(Arc::new(store), true, Duration::from_millis(10));
        let calls = AtomicUsize::new(0);

        cache
            .run_and_cache("itinerary", || produce_counted(&calls))
            .await
            .expect("first run");
        tokio::time::sleep(Duration::from_millis(30)).await;
        cache
            .run_and_cache("itinerary", || produce_counted(&calls))
            .await
            .expect("second run");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn disabled_cache_always_invokes_producer() {
        let dir = tempdir().expect("tempdir");
        let store = SqliteCacheStore::new(dir.path().join("cache.db")).expect("store");
        let cache = ResultCache::new(Arc::new(store), false, Duration::from_secs(60));
        let calls = AtomicUsize::new(0);

        for _ in 0..2 {
            cache
                .run_and_cache("itinerary", || produce_counted(&calls))
                .await
                .expect("run");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn zero_ttl_bypasses_the_store() {
        let cache = ResultCache::new(Arc::new(BrokenStore), true, Duration::ZERO);
        let calls = AtomicUsize::new(0);
        cache
            .run_and_cache("itinerary", || produce_counted(&calls))
            .await
            .expect("run");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn storage_failures_never_block_the_result() {
        let cache = ResultCache::new(Arc::new(BrokenStore), true, Duration::from_secs(60));
        let calls = AtomicUsize::new(0);
        let value = cache
            .run_and_cache("itinerary", || produce_counted(&calls))
            .await
            .expect("run");
        assert_eq!(value, json!({"total": 42}));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn query_keys_are_stable_and_valid() {
        #[derive(Serialize)]
        struct Query<'a> {
            origin: &'a str,
            destination: &'a str,
        }

        let a = query_cache_key(
            "sky scan!",
            &Query {
                origin: "LIS",
                destination: "GIG",
            },
        )
        .expect("key");
        let b = query_cache_key(
            "sky scan!",
            &Query {
                origin: "LIS",
                destination: "GIG",
            },
        )
        .expect("key");
        assert_eq!(a, b);
        assert!(a.starts_with("sky-scan--"));
        crate::cache::validate_key(&a).expect("derived keys must validate");
    }
}
