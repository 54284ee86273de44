mod diagnostics;
mod error;
mod fingerprint;
mod interceptor;
mod launcher;
mod metrics;
mod outcome;
mod proxy;
mod runner;
mod scrape;

pub use diagnostics::{
    write_trace_artifact, AttemptDiagnostics, AttemptLog, FailureRecord, LogLine, TelemetryLog,
};
pub use error::{SessionError, SessionResult};
pub use fingerprint::FingerprintMasker;
pub use interceptor::{
    AbortReason, ContinueOverrides, InterceptRule, InterceptStage, RequestInterceptor,
    ResumeAction, RuleCallback, SessionEvent, Transaction,
};
pub use launcher::{
    LaunchSpec, PageDriver, SessionFactory, SessionHandle, SessionLauncher, ViewportSpec,
};
pub use metrics::{MetricsSnapshot, SessionMetrics};
pub use outcome::{MatchedOutcome, MatchedTransaction, OutcomeCondition, OutcomeSet};
pub use proxy::{
    AuthChallengeSnapshot, AuthDecision, AuthResponder, AuthSource, ProxyPools, ProxyRecord,
    ProxySelection, ProxySelector,
};
pub use runner::{RunError, RunPolicy, RunSuccess, SessionRunner};
pub use scrape::{FlightQuery, ScrapeOutcome, ScrapeSession, Scraper};
