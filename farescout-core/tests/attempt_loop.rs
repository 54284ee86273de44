use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use regex::Regex;
use serde_json::json;
use tokio::sync::Mutex;

use farescout_core::session::{
    AttemptLog, FlightQuery, InterceptStage, LaunchSpec, MatchedOutcome, OutcomeSet, ProxyPools,
    ProxySelector, RuleCallback, RunPolicy, ScrapeOutcome, ScrapeSession, Scraper, SessionError,
    SessionFactory, SessionResult, SessionRunner, TelemetryLog,
};

enum AttemptScript {
    Complete(serde_json::Value),
    Blocked(&'static str),
    Fail(SessionError),
}

struct ScriptedScraper {
    script: Mutex<VecDeque<AttemptScript>>,
}

impl ScriptedScraper {
    fn new(script: Vec<AttemptScript>) -> Self {
        Self {
            script: Mutex::new(script.into()),
        }
    }
}

#[async_trait]
impl Scraper for ScriptedScraper {
    fn name(&self) -> &str {
        "latam"
    }

    async fn scrape(
        &self,
        session: &dyn ScrapeSession,
        query: &FlightQuery,
    ) -> SessionResult<ScrapeOutcome> {
        session.log(&format!("scraping {query}"));
        let step = self
            .script
            .lock()
            .await
            .pop_front()
            .expect("script exhausted");
        match step {
            AttemptScript::Complete(value) => Ok(ScrapeOutcome::Complete(value)),
            AttemptScript::Blocked(name) => Ok(ScrapeOutcome::blocked(name)),
            AttemptScript::Fail(err) => Err(err),
        }
    }
}

struct FakeSession {
    log: AttemptLog,
    shutdowns: Arc<AtomicUsize>,
}

#[async_trait]
impl ScrapeSession for FakeSession {
    async fn goto(&self, _url: &str) -> SessionResult<()> {
        Ok(())
    }

    async fn wait_for(
        &self,
        _outcomes: OutcomeSet,
        _timeout: Duration,
    ) -> SessionResult<MatchedOutcome> {
        Err(SessionError::Protocol("wait_for is not scripted".into()))
    }

    async fn content(&self) -> SessionResult<String> {
        Ok(String::new())
    }

    fn add_rule(&self, _pattern: Regex, _stage: InterceptStage, _callback: Box<RuleCallback>) {}

    fn log(&self, message: &str) {
        self.log.record(message.to_string());
    }

    async fn shutdown(&self) -> SessionResult<()> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FakeFactory {
    launches: AtomicUsize,
    shutdowns: Arc<AtomicUsize>,
    launch_failures: AtomicUsize,
}

impl FakeFactory {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            launches: AtomicUsize::new(0),
            shutdowns: Arc::new(AtomicUsize::new(0)),
            launch_failures: AtomicUsize::new(0),
        })
    }

    fn failing_first(failures: usize) -> Arc<Self> {
        let factory = Self::new();
        factory.launch_failures.store(failures, Ordering::SeqCst);
        factory
    }

    fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionFactory for FakeFactory {
    async fn launch(&self, spec: LaunchSpec) -> SessionResult<Box<dyn ScrapeSession>> {
        if self
            .launch_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                left.checked_sub(1)
            })
            .is_ok()
        {
            return Err(SessionError::Launch("chromium refused to start".into()));
        }
        self.launches.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSession {
            log: spec.log,
            shutdowns: Arc::clone(&self.shutdowns),
        }))
    }
}

fn no_proxies() -> ProxySelector {
    ProxySelector::new(Arc::new(ProxyPools::default()), false)
}

fn instant_policy(max_attempts: usize) -> RunPolicy {
    RunPolicy::new(max_attempts, vec![Duration::ZERO])
}

fn query() -> FlightQuery {
    FlightQuery::new(
        "GRU",
        "LIS",
        NaiveDate::from_ymd_opt(2026, 9, 14).expect("valid date"),
    )
}

#[tokio::test]
async fn test_blocked_every_attempt_exhausts_the_budget() {
    let factory = FakeFactory::new();
    let runner = SessionRunner::new(factory.clone(), no_proxies(), instant_policy(3));
    let scraper = ScriptedScraper::new(vec![
        AttemptScript::Blocked("captcha"),
        AttemptScript::Blocked("captcha"),
        AttemptScript::Blocked("captcha"),
    ]);

    let err = runner.run(&scraper, &query()).await.unwrap_err();
    assert_eq!(err.attempts, 3);
    assert_eq!(err.outcome.as_deref(), Some("captcha"));
    assert!(err.source.is_none());
    assert_eq!(err.diagnostics.attempt, 3);
    assert_eq!(factory.launches(), 3);
    assert_eq!(factory.shutdowns(), 3);

    let metrics = runner.metrics().snapshot();
    assert_eq!(metrics.attempts_started, 3);
    assert_eq!(metrics.attempts_failed, 3);
}

#[tokio::test]
async fn test_success_on_second_attempt_keeps_prior_diagnostics() {
    let factory = FakeFactory::new();
    let runner = SessionRunner::new(factory.clone(), no_proxies(), instant_policy(3));
    let scraper = ScriptedScraper::new(vec![
        AttemptScript::Blocked("captcha"),
        AttemptScript::Complete(json!({"fares": [{"price": 412.90}]})),
    ]);

    let success = runner.run(&scraper, &query()).await.unwrap();
    assert_eq!(success.attempts, 2);
    assert_eq!(success.value["fares"][0]["price"], json!(412.90));
    let failure = success.last_failure.expect("first attempt diagnostics");
    assert_eq!(failure.attempt, 1);
    assert_eq!(failure.outcome, "captcha");
    assert!(!failure.lines.is_empty());
    assert_eq!(factory.shutdowns(), 2);
}

#[tokio::test]
async fn test_unlisted_warning_ends_the_run_immediately() {
    let factory = FakeFactory::new();
    let policy = instant_policy(3).with_retryable_outcomes(["captcha"]);
    let runner = SessionRunner::new(factory.clone(), no_proxies(), policy);
    let scraper = ScriptedScraper::new(vec![AttemptScript::Blocked("sold_out")]);

    let err = runner.run(&scraper, &query()).await.unwrap_err();
    assert_eq!(err.attempts, 1);
    assert_eq!(err.outcome.as_deref(), Some("sold_out"));
    assert_eq!(factory.launches(), 1);
    assert_eq!(factory.shutdowns(), 1);
}

#[tokio::test]
async fn test_configuration_errors_never_retry() {
    let factory = FakeFactory::new();
    let runner = SessionRunner::new(factory.clone(), no_proxies(), instant_policy(3));
    let scraper = ScriptedScraper::new(vec![AttemptScript::Fail(SessionError::Configuration(
        "outcome name registered twice".into(),
    ))]);

    let err = runner.run(&scraper, &query()).await.unwrap_err();
    assert_eq!(err.attempts, 1);
    assert!(err.outcome.is_none());
    assert!(matches!(err.source, Some(SessionError::Configuration(_))));
    assert_eq!(factory.launches(), 1);
}

#[tokio::test]
async fn test_retryable_errors_consume_the_budget() {
    let factory = FakeFactory::new();
    let runner = SessionRunner::new(factory.clone(), no_proxies(), instant_policy(2));
    let scraper = ScriptedScraper::new(vec![
        AttemptScript::Fail(SessionError::WaitTimeout { waited_ms: 100 }),
        AttemptScript::Fail(SessionError::WaitTimeout { waited_ms: 100 }),
    ]);

    let err = runner.run(&scraper, &query()).await.unwrap_err();
    assert_eq!(err.attempts, 2);
    assert!(err.outcome.is_none());
    assert!(matches!(err.source, Some(SessionError::WaitTimeout { .. })));
}

#[tokio::test]
async fn test_launch_failure_still_counts_an_attempt() {
    let factory = FakeFactory::failing_first(1);
    let runner = SessionRunner::new(factory.clone(), no_proxies(), instant_policy(3));
    let scraper = ScriptedScraper::new(vec![AttemptScript::Complete(json!({"fares": []}))]);

    let success = runner.run(&scraper, &query()).await.unwrap();
    assert_eq!(success.attempts, 2);
    assert_eq!(factory.launches(), 1);
    assert_eq!(factory.shutdowns(), 1);
}

#[tokio::test]
async fn test_failure_telemetry_records_each_failed_attempt() {
    let dir = tempfile::tempdir().expect("temp dir");
    let log_path = dir.path().join("failures.jsonl");
    let telemetry = Arc::new(TelemetryLog::new(&log_path).expect("telemetry log"));

    let factory = FakeFactory::new();
    let runner = SessionRunner::new(factory.clone(), no_proxies(), instant_policy(2))
        .with_telemetry(telemetry);
    let scraper = ScriptedScraper::new(vec![
        AttemptScript::Blocked("captcha"),
        AttemptScript::Fail(SessionError::WaitTimeout { waited_ms: 500 }),
    ]);

    runner.run(&scraper, &query()).await.unwrap_err();

    let raw = std::fs::read_to_string(&log_path).expect("failure log");
    let records: Vec<serde_json::Value> = raw
        .lines()
        .map(|line| serde_json::from_str(line).expect("jsonl record"))
        .collect();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["scraper"], json!("latam"));
    assert_eq!(records[0]["attempt"], json!(1));
    assert_eq!(records[0]["outcome"], json!("captcha"));
    assert_eq!(records[1]["attempt"], json!(2));
    assert_eq!(records[1]["outcome"], json!("error"));
    assert_eq!(records[0]["run_id"], records[1]["run_id"]);
}

#[tokio::test]
async fn test_trace_artifacts_written_for_failed_attempts() {
    let dir = tempfile::tempdir().expect("temp dir");
    let factory = FakeFactory::new();
    let runner = SessionRunner::new(factory.clone(), no_proxies(), instant_policy(2))
        .with_trace_dir(dir.path());
    let scraper = ScriptedScraper::new(vec![
        AttemptScript::Blocked("captcha"),
        AttemptScript::Blocked("captcha"),
    ]);

    let err = runner.run(&scraper, &query()).await.unwrap_err();
    let trace = err.diagnostics.trace_path.expect("trace artifact");
    assert!(trace.exists());
    assert!(trace
        .file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.contains("attempt2"))
        .unwrap_or(false));

    let traces = std::fs::read_dir(dir.path())
        .expect("trace dir")
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().ends_with(".json.gz"))
        .count();
    assert_eq!(traces, 2);
}

#[tokio::test(start_paused = true)]
async fn test_backoff_delay_observed_between_attempts() {
    let factory = FakeFactory::new();
    let policy = RunPolicy::new(2, vec![Duration::from_secs(2)]);
    let runner = SessionRunner::new(factory.clone(), no_proxies(), policy);
    let scraper = ScriptedScraper::new(vec![
        AttemptScript::Blocked("captcha"),
        AttemptScript::Blocked("captcha"),
    ]);

    let started = tokio::time::Instant::now();
    runner.run(&scraper, &query()).await.unwrap_err();
    assert!(started.elapsed() >= Duration::from_secs(2));
}
