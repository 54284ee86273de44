mod backoff;
mod file_store;
mod result;
mod sqlite_store;
mod store;

use std::sync::Arc;

use crate::config::{CacheBackend, CacheSection};

pub use backoff::StorageRetryPolicy;
pub use file_store::FileCacheStore;
pub use result::{query_cache_key, ResultCache};
pub use sqlite_store::{SqliteCacheStore, SqliteCacheStoreBuilder};
pub use store::{validate_key, CacheError, CacheResult, CacheStats, CacheStore};

/// Builds the backend the `[cache]` section selects.
pub fn store_from_config(section: &CacheSection) -> CacheResult<Arc<dyn CacheStore>> {
    match section.backend {
        CacheBackend::Sqlite => Ok(Arc::new(SqliteCacheStore::from_config(section)?)),
        CacheBackend::File => Ok(Arc::new(FileCacheStore::from_config(section)?)),
    }
}
