use std::thread;
use std::time::Duration;

use rand::Rng;
use rusqlite::ErrorCode;
use tracing::warn;

use crate::config::CacheSection;

use super::store::{CacheError, CacheResult};

/// Retry policy for storage calls that can fail transiently under lock
/// contention. One instance parameterizes every operation of a store.
#[derive(Debug, Clone)]
pub struct StorageRetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    jitter: Duration,
}

impl Default for StorageRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(50),
            jitter: Duration::from_millis(25),
        }
    }
}

impl StorageRetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, jitter: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            jitter,
        }
    }

    pub fn from_config(section: &CacheSection) -> Self {
        Self::new(
            section.retry_attempts,
            Duration::from_millis(section.retry_base_delay_ms),
            Duration::from_millis(section.retry_jitter_ms),
        )
    }

    /// Runs `op`, retrying busy/locked failures with exponential backoff.
    /// Any other storage failure propagates immediately; exhausting the
    /// budget surfaces `CacheError::Unavailable` rather than a silent miss.
    pub fn run<T, F>(&self, mut op: F) -> CacheResult<T>
    where
        F: FnMut() -> rusqlite::Result<T>,
    {
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(source) if is_contended(&source) => {
                    if attempt >= self.max_attempts {
                        return Err(CacheError::Unavailable {
                            attempts: attempt,
                            source,
                        });
                    }
                    let delay = self.delay_for(attempt);
                    warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "cache storage busy, backing off"
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(source) => return Err(CacheError::Storage(source)),
            }
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(10);
        let base = self.base_delay.saturating_mul(1u32 << shift);
        if self.jitter.is_zero() {
            return base;
        }
        let jitter_ms = rand::thread_rng().gen_range(0..=self.jitter.as_millis() as u64);
        base + Duration::from_millis(jitter_ms)
    }
}

fn is_contended(error: &rusqlite::Error) -> bool {
    match error {
        rusqlite::Error::SqliteFailure(inner, _) => matches!(
            inner.code,
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
        ),
        _ => false,
    }
}
