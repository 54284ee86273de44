use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::Rng;
use serde_json::Value;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RetrySection;

use super::diagnostics::{
    write_trace_artifact, AttemptDiagnostics, AttemptLog, FailureRecord, TelemetryLog,
};
use super::error::SessionError;
use super::launcher::{LaunchSpec, SessionFactory};
use super::metrics::SessionMetrics;
use super::proxy::ProxySelector;
use super::scrape::{FlightQuery, ScrapeOutcome, Scraper};

/// Attempt budget and backoff for one run, plus the declared set of warning
/// outcomes worth another attempt. With no declared set every warning
/// retries; with one, an unlisted warning ends the run at once.
#[derive(Debug, Clone)]
pub struct RunPolicy {
    max_attempts: usize,
    schedule: Vec<Duration>,
    jitter_seconds: u64,
    retryable_outcomes: Option<HashSet<String>>,
    hold_before_teardown: Option<Duration>,
}

impl RunPolicy {
    pub fn new(max_attempts: usize, schedule: Vec<Duration>) -> Self {
        let schedule = if schedule.is_empty() {
            vec![Duration::from_secs(2), Duration::from_secs(5)]
        } else {
            schedule
        };
        Self {
            max_attempts: max_attempts.max(1),
            schedule,
            jitter_seconds: 0,
            retryable_outcomes: None,
            hold_before_teardown: None,
        }
    }

    pub fn from_config(section: &RetrySection) -> Self {
        let schedule = section
            .delay_seconds
            .iter()
            .map(|seconds| Duration::from_secs(*seconds))
            .collect();
        let mut policy = Self::new(section.max_attempts, schedule);
        policy.jitter_seconds = section.jitter_seconds;
        policy.retryable_outcomes = section
            .retryable_outcomes
            .as_ref()
            .map(|names| names.iter().cloned().collect());
        policy
    }

    pub fn with_retryable_outcomes<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.retryable_outcomes = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Debug affordance: keep the failed session alive this long before
    /// teardown so an operator can attach to it.
    pub fn with_hold_before_teardown(mut self, hold: Duration) -> Self {
        self.hold_before_teardown = Some(hold);
        self
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    fn outcome_is_retryable(&self, name: &str) -> bool {
        match &self.retryable_outcomes {
            None => true,
            Some(names) => names.contains(name),
        }
    }

    /// Delay observed before `attempt` (2-based); the schedule's last entry
    /// repeats once exhausted.
    fn delay_before(&self, attempt: usize) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let base = self
            .schedule
            .get(attempt - 2)
            .or_else(|| self.schedule.last())
            .copied()
            .unwrap_or(Duration::ZERO);
        if self.jitter_seconds == 0 {
            return base;
        }
        let jitter = rand::thread_rng().gen_range(0..=self.jitter_seconds);
        base + Duration::from_secs(jitter)
    }
}

/// A finished run that produced a value. `last_failure` keeps the most
/// recent failed attempt's diagnostics when earlier attempts were retried.
#[derive(Debug)]
pub struct RunSuccess {
    pub value: Value,
    pub attempts: usize,
    pub last_failure: Option<AttemptDiagnostics>,
}

/// The run's terminal failure: what ended the final attempt plus its
/// captured event log. Intermediate retried attempts surface only through
/// telemetry, never as errors.
#[derive(Debug, Error)]
#[error("scrape failed after {attempts} attempt(s): {reason}")]
pub struct RunError {
    pub attempts: usize,
    pub reason: String,
    /// Set when a declared warning outcome ended the run.
    pub outcome: Option<String>,
    #[source]
    pub source: Option<SessionError>,
    pub diagnostics: AttemptDiagnostics,
}

enum AttemptEnd {
    Success(Value),
    Warning(String),
    Failed(SessionError),
}

/// Drives the attempt state machine: fresh proxy, fresh session and fresh
/// interception per attempt, full teardown in between.
pub struct SessionRunner {
    factory: Arc<dyn SessionFactory>,
    proxies: ProxySelector,
    policy: RunPolicy,
    metrics: Arc<SessionMetrics>,
    telemetry: Option<Arc<TelemetryLog>>,
    trace_dir: Option<PathBuf>,
}

impl SessionRunner {
    pub fn new(factory: Arc<dyn SessionFactory>, proxies: ProxySelector, policy: RunPolicy) -> Self {
        Self {
            factory,
            proxies,
            policy,
            metrics: Arc::new(SessionMetrics::default()),
            telemetry: None,
            trace_dir: None,
        }
    }

    pub fn with_telemetry(mut self, telemetry: Arc<TelemetryLog>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn with_trace_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.trace_dir = Some(dir.into());
        self
    }

    pub fn metrics(&self) -> Arc<SessionMetrics> {
        Arc::clone(&self.metrics)
    }

    pub async fn run(
        &self,
        scraper: &dyn Scraper,
        query: &FlightQuery,
    ) -> Result<RunSuccess, RunError> {
        let run_id = Uuid::new_v4();
        info!(
            run_id = %run_id,
            scraper = scraper.name(),
            query = %query,
            max_attempts = self.policy.max_attempts(),
            "starting scrape run"
        );
        let mut last_failure: Option<AttemptDiagnostics> = None;

        for attempt in 1..=self.policy.max_attempts() {
            if attempt > 1 {
                let delay = self.policy.delay_before(attempt);
                if !delay.is_zero() {
                    debug!(attempt, delay_ms = delay.as_millis() as u64, "waiting before retry");
                    sleep(delay).await;
                }
            }
            self.metrics.record_attempt_started();
            let log = AttemptLog::new();
            let started_at = Utc::now();
            let started = Instant::now();

            let (end, proxy_group) = self.run_attempt(scraper, query, attempt, &log).await;
            let duration_ms = started.elapsed().as_millis() as i64;

            match end {
                AttemptEnd::Success(value) => {
                    info!(run_id = %run_id, attempt, duration_ms, "scrape run succeeded");
                    return Ok(RunSuccess {
                        value,
                        attempts: attempt,
                        last_failure,
                    });
                }
                AttemptEnd::Warning(name) => {
                    self.metrics.record_attempt_failed();
                    let retryable = self.policy.outcome_is_retryable(&name);
                    warn!(
                        run_id = %run_id,
                        attempt,
                        outcome = %name,
                        retryable,
                        "attempt ended in a warning outcome"
                    );
                    let diagnostics = self.finish_failed_attempt(
                        run_id,
                        scraper.name(),
                        attempt,
                        &name,
                        format!("warning outcome: {name}"),
                        proxy_group,
                        started_at,
                        duration_ms,
                        &log,
                    );
                    if retryable && attempt < self.policy.max_attempts() {
                        last_failure = Some(diagnostics);
                        continue;
                    }
                    return Err(RunError {
                        attempts: attempt,
                        reason: name.clone(),
                        outcome: Some(name),
                        source: None,
                        diagnostics,
                    });
                }
                AttemptEnd::Failed(err) => {
                    self.metrics.record_attempt_failed();
                    let retryable = err.is_retryable();
                    warn!(
                        run_id = %run_id,
                        attempt,
                        error = %err,
                        retryable,
                        "attempt failed"
                    );
                    let diagnostics = self.finish_failed_attempt(
                        run_id,
                        scraper.name(),
                        attempt,
                        "error",
                        err.to_string(),
                        proxy_group,
                        started_at,
                        duration_ms,
                        &log,
                    );
                    if retryable && attempt < self.policy.max_attempts() {
                        last_failure = Some(diagnostics);
                        continue;
                    }
                    return Err(RunError {
                        attempts: attempt,
                        reason: err.to_string(),
                        outcome: None,
                        source: Some(err),
                        diagnostics,
                    });
                }
            }
        }
        unreachable!("attempt loop always terminates through a branch above")
    }

    async fn run_attempt(
        &self,
        scraper: &dyn Scraper,
        query: &FlightQuery,
        attempt: usize,
        log: &AttemptLog,
    ) -> (AttemptEnd, Option<String>) {
        let selection = match self.proxies.select(scraper.name()) {
            Ok(selection) => selection,
            Err(err) => return (AttemptEnd::Failed(err), None),
        };
        let proxy_group = selection
            .record
            .as_ref()
            .map(|record| record.group().to_string());
        log.record(format!("attempt {attempt} started for {query}"));

        let session = match self
            .factory
            .launch(LaunchSpec {
                scraper: scraper.name().to_string(),
                proxy: selection,
                log: log.clone(),
                metrics: Arc::clone(&self.metrics),
            })
            .await
        {
            Ok(session) => session,
            Err(err) => return (AttemptEnd::Failed(err), proxy_group),
        };

        let end = match scraper.scrape(session.as_ref(), query).await {
            Ok(ScrapeOutcome::Complete(value)) => AttemptEnd::Success(value),
            Ok(ScrapeOutcome::Blocked { outcome }) => AttemptEnd::Warning(outcome),
            Err(err) => AttemptEnd::Failed(err),
        };

        if !matches!(end, AttemptEnd::Success(_)) {
            if let Some(hold) = self.policy.hold_before_teardown {
                debug!(attempt, hold_ms = hold.as_millis() as u64, "holding session before teardown");
                sleep(hold).await;
            }
        }
        if let Err(err) = session.shutdown().await {
            warn!(attempt, error = %err, "session teardown failed");
        }
        (end, proxy_group)
    }

    #[allow(clippy::too_many_arguments)]
    fn finish_failed_attempt(
        &self,
        run_id: Uuid,
        scraper: &str,
        attempt: usize,
        outcome_label: &str,
        error_text: String,
        proxy_group: Option<String>,
        started_at: chrono::DateTime<Utc>,
        duration_ms: i64,
        log: &AttemptLog,
    ) -> AttemptDiagnostics {
        let lines = log.snapshot();
        let trace_path = self.trace_dir.as_ref().and_then(|dir| {
            match write_trace_artifact(dir, run_id, attempt, &lines) {
                Ok(path) => Some(path),
                Err(err) => {
                    warn!(error = %err, "trace artifact write failed");
                    None
                }
            }
        });
        if let Some(telemetry) = &self.telemetry {
            let record = FailureRecord {
                timestamp: Utc::now(),
                run_id,
                scraper: scraper.to_string(),
                attempt,
                outcome: outcome_label.to_string(),
                error: error_text,
                proxy_group,
                duration_ms,
            };
            if let Err(err) = telemetry.record_failure(&record) {
                warn!(error = %err, "failure telemetry write failed");
            }
        }
        AttemptDiagnostics {
            attempt,
            outcome: outcome_label.to_string(),
            started_at,
            duration_ms,
            lines,
            trace_path,
        }
    }
}
