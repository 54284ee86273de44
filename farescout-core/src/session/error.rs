use thiserror::Error;

use crate::cache::CacheError;

pub type SessionResult<T> = Result<T, SessionError>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("chromium launch failed: {0}")]
    Launch(String),
    #[error("cdp error: {0}")]
    Cdp(#[from] chromiumoxide::error::CdpError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no outcome matched within {waited_ms}ms")]
    WaitTimeout { waited_ms: u64 },
    #[error("interception protocol violation: {0}")]
    Protocol(String),
    #[error("proxy error: {0}")]
    Proxy(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("scrape logic failed: {0}")]
    Scrape(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl From<tokio::task::JoinError> for SessionError {
    fn from(err: tokio::task::JoinError) -> Self {
        SessionError::Unexpected(err.to_string())
    }
}

impl SessionError {
    /// Attempt-loop classification. Anything that can be cured by a fresh
    /// session and proxy identity retries; programming and configuration
    /// mistakes do not.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            SessionError::Configuration(_) | SessionError::Cache(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_retry_but_configuration_does_not() {
        assert!(SessionError::WaitTimeout { waited_ms: 500 }.is_retryable());
        assert!(SessionError::Scrape("boom".into()).is_retryable());
        assert!(!SessionError::Configuration("bad policy".into()).is_retryable());
        assert!(!SessionError::Cache(CacheError::InvalidKey { key: "a b".into() }).is_retryable());
    }
}
