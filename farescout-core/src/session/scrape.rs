use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::query_cache_key;

use super::error::SessionResult;
use super::interceptor::{InterceptStage, RuleCallback};
use super::outcome::{MatchedOutcome, OutcomeSet};

/// Route and departure date one scrape answers. Codes are normalized to
/// upper case so equal queries always produce equal cache keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlightQuery {
    pub origin: String,
    pub destination: String,
    pub departure_date: NaiveDate,
}

impl FlightQuery {
    pub fn new(
        origin: impl Into<String>,
        destination: impl Into<String>,
        departure_date: NaiveDate,
    ) -> Self {
        Self {
            origin: origin.into().trim().to_uppercase(),
            destination: destination.into().trim().to_uppercase(),
            departure_date,
        }
    }

    /// Content-addressed cache key for this query under the given scraper.
    pub fn cache_key(&self, scraper: &str) -> Option<String> {
        query_cache_key(scraper, self)
    }
}

impl std::fmt::Display for FlightQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}-{} {}",
            self.origin, self.destination, self.departure_date
        )
    }
}

/// What one scrape attempt produced.
#[derive(Debug, Clone, PartialEq)]
pub enum ScrapeOutcome {
    /// Structured result ready for the caller (and the cache).
    Complete(Value),
    /// A declared warning outcome matched (anti-bot wall, sold-out page).
    /// The attempt loop decides whether it warrants another attempt.
    Blocked { outcome: String },
}

impl ScrapeOutcome {
    pub fn blocked(outcome: impl Into<String>) -> Self {
        ScrapeOutcome::Blocked {
            outcome: outcome.into(),
        }
    }
}

/// Live session surface scrape logic drives. Implemented by the chromium
/// session handle, and by scripted fakes in tests.
#[async_trait]
pub trait ScrapeSession: Send + Sync {
    async fn goto(&self, url: &str) -> SessionResult<()>;
    async fn wait_for(
        &self,
        outcomes: OutcomeSet,
        timeout: Duration,
    ) -> SessionResult<MatchedOutcome>;
    async fn content(&self) -> SessionResult<String>;
    fn add_rule(&self, pattern: Regex, stage: InterceptStage, callback: Box<RuleCallback>);
    fn log(&self, message: &str);
    /// Tears the session down: interception disabled, browser closed.
    /// Idempotent; the attempt loop calls it between attempts.
    async fn shutdown(&self) -> SessionResult<()>;
}

/// Per-site scrape logic, invoked once per attempt with a fresh session.
#[async_trait]
pub trait Scraper: Send + Sync {
    fn name(&self) -> &str;
    async fn scrape(
        &self,
        session: &dyn ScrapeSession,
        query: &FlightQuery,
    ) -> SessionResult<ScrapeOutcome>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query() -> FlightQuery {
        FlightQuery::new(
            " gru ",
            "lis",
            NaiveDate::from_ymd_opt(2026, 9, 14).expect("date"),
        )
    }

    #[test]
    fn codes_are_normalized_on_construction() {
        let q = query();
        assert_eq!(q.origin, "GRU");
        assert_eq!(q.destination, "LIS");
        assert_eq!(q.to_string(), "GRU-LIS 2026-09-14");
    }

    #[test]
    fn equal_queries_share_a_cache_key() {
        let a = query().cache_key("latam").expect("key");
        let b = FlightQuery::new("GRU", "LIS", NaiveDate::from_ymd_opt(2026, 9, 14).expect("date"))
            .cache_key("latam")
            .expect("key");
        assert_eq!(a, b);
        assert!(a.starts_with("latam-"));
    }

    #[test]
    fn different_dates_produce_different_keys() {
        let a = query().cache_key("latam").expect("key");
        let b = FlightQuery::new("GRU", "LIS", NaiveDate::from_ymd_opt(2026, 9, 15).expect("date"))
            .cache_key("latam")
            .expect("key");
        assert_ne!(a, b);
    }
}
