pub mod cache;
pub mod config;
pub mod error;
pub mod session;
pub mod sqlite;

pub use cache::{
    query_cache_key, store_from_config, CacheError, CacheResult, CacheStats, CacheStore,
    FileCacheStore, ResultCache, SqliteCacheStore, SqliteCacheStoreBuilder, StorageRetryPolicy,
};
pub use config::{
    load_scraper_config, CacheBackend, CacheSection, ChromiumSection, FingerprintSection,
    FlagsSection, ObservabilitySection, ProxySection, RetrySection, ScraperConfig,
    UserAgentSection, ViewportSection,
};
pub use error::{ConfigError, ConfigResult};
pub use session::{
    AttemptDiagnostics, AttemptLog, FailureRecord, FingerprintMasker, FlightQuery,
    InterceptStage, MatchedOutcome, MetricsSnapshot, OutcomeSet, ProxyPools, ProxySelection,
    ProxySelector, RequestInterceptor, ResumeAction, RuleCallback, RunError, RunPolicy, RunSuccess,
    ScrapeOutcome, ScrapeSession, Scraper, SessionError, SessionEvent, SessionFactory,
    SessionLauncher, SessionMetrics, SessionResult, SessionRunner, TelemetryLog, Transaction,
};
