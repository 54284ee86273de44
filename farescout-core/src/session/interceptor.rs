use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chromiumoxide::cdp::browser_protocol::fetch::{
    AuthChallengeResponse, AuthChallengeResponseResponse, AuthChallengeSource,
    ContinueRequestParams, ContinueResponseParams, ContinueWithAuthParams, DisableParams,
    EnableParams, EventAuthRequired, EventRequestPaused, FailRequestParams, FulfillRequestParams,
    HeaderEntry, RequestId, RequestPattern, RequestStage,
};
use chromiumoxide::cdp::browser_protocol::network::ErrorReason;
use chromiumoxide::Page;
use futures::StreamExt;
use regex::Regex;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::diagnostics::AttemptLog;
use super::error::{SessionError, SessionResult};
use super::metrics::SessionMetrics;
use super::proxy::{AuthChallengeSnapshot, AuthDecision, AuthResponder, AuthSource};

/// Events observed by the interceptor and replayed to every `wait_for` call
/// in flight. Completions carry the status a matcher can assert on.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A network exchange finished (real response continued, or a rule
    /// fulfilled it synthetically).
    ResponseObserved { url: String, status: Option<i64> },
    /// Navigation or another page-level change; content conditions re-check.
    PageActivity,
}

/// First callback error raised inside a spawned consumer, parked until the
/// driving control flow reaches its next suspension point.
#[derive(Debug, Clone, Default)]
pub(crate) struct FaultSlot {
    slot: Arc<Mutex<Option<SessionError>>>,
}

impl FaultSlot {
    pub(crate) fn park(&self, err: SessionError) {
        match self.slot.lock() {
            Ok(mut slot) => {
                if slot.is_none() {
                    *slot = Some(err);
                } else {
                    warn!(error = %err, "session fault already pending, dropping follow-up");
                }
            }
            Err(_) => warn!(error = %err, "fault slot poisoned, dropping error"),
        }
    }

    pub(crate) fn take(&self) -> Option<SessionError> {
        self.slot.lock().ok().and_then(|mut slot| slot.take())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterceptStage {
    Request,
    Response,
}

/// One paused network exchange. Consumed by exactly one resume; the tag is
/// checked before every resume call so a second decision can never reach the
/// browser.
#[derive(Debug)]
pub struct Transaction {
    request_id: RequestId,
    pub url: String,
    pub method: String,
    pub stage: InterceptStage,
    request_headers: Value,
    pub response_status: Option<i64>,
    pub response_headers: Vec<(String, String)>,
    resumed: AtomicBool,
}

impl Transaction {
    fn from_event(event: &EventRequestPaused) -> Self {
        let stage = if event.response_status_code.is_some() || event.response_error_reason.is_some()
        {
            InterceptStage::Response
        } else {
            InterceptStage::Request
        };
        let response_headers = event
            .response_headers
            .as_ref()
            .map(|headers| {
                headers
                    .iter()
                    .map(|h| (h.name.clone(), h.value.clone()))
                    .collect()
            })
            .unwrap_or_default();
        Self {
            request_id: event.request_id.clone(),
            url: event.request.url.clone(),
            method: event.request.method.clone(),
            stage,
            request_headers: serde_json::to_value(&event.request.headers).unwrap_or(Value::Null),
            response_status: event.response_status_code,
            response_headers,
            resumed: AtomicBool::new(false),
        }
    }

    /// Case-insensitive request header lookup.
    pub fn request_header(&self, name: &str) -> Option<&str> {
        self.request_headers
            .as_object()?
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .and_then(|(_, value)| value.as_str())
    }

    pub fn is_resumed(&self) -> bool {
        self.resumed.load(Ordering::Acquire)
    }

    /// Returns true exactly once.
    fn claim(&self) -> bool {
        self.resumed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Network-level failure a rule can signal instead of letting the exchange
/// proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    Failed,
    Aborted,
    TimedOut,
    AccessDenied,
    ConnectionRefused,
    BlockedByClient,
    BlockedByResponse,
}

impl From<AbortReason> for ErrorReason {
    fn from(reason: AbortReason) -> Self {
        match reason {
            AbortReason::Failed => ErrorReason::Failed,
            AbortReason::Aborted => ErrorReason::Aborted,
            AbortReason::TimedOut => ErrorReason::TimedOut,
            AbortReason::AccessDenied => ErrorReason::AccessDenied,
            AbortReason::ConnectionRefused => ErrorReason::ConnectionRefused,
            AbortReason::BlockedByClient => ErrorReason::BlockedByClient,
            AbortReason::BlockedByResponse => ErrorReason::BlockedByResponse,
        }
    }
}

/// Request-stage fields a `Continue` may override. Empty overrides resume the
/// exchange untouched.
#[derive(Debug, Clone, Default)]
pub struct ContinueOverrides {
    pub method: Option<String>,
    pub headers: Option<Vec<(String, String)>>,
    pub body: Option<Vec<u8>>,
}

/// The one decision a rule callback produces for a paused transaction.
#[derive(Debug, Clone)]
pub enum ResumeAction {
    Continue(ContinueOverrides),
    Fulfill {
        status: i64,
        headers: Vec<(String, String)>,
        body: Option<Vec<u8>>,
    },
    Fail {
        reason: AbortReason,
    },
}

impl ResumeAction {
    pub fn pass() -> Self {
        ResumeAction::Continue(ContinueOverrides::default())
    }

    pub fn fulfill_json(status: i64, value: &Value) -> Self {
        ResumeAction::Fulfill {
            status,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: Some(value.to_string().into_bytes()),
        }
    }
}

pub type RuleCallback = dyn Fn(&Transaction) -> SessionResult<ResumeAction> + Send + Sync;

pub struct InterceptRule {
    pattern: Regex,
    stage: InterceptStage,
    callback: Box<RuleCallback>,
}

impl InterceptRule {
    fn matches(&self, tx: &Transaction) -> bool {
        self.stage == tx.stage && self.pattern.is_match(&tx.url)
    }
}

impl std::fmt::Debug for InterceptRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptRule")
            .field("pattern", &self.pattern.as_str())
            .field("stage", &self.stage)
            .finish()
    }
}

/// Ordered, append-only rule list. First match in registration order wins.
#[derive(Debug, Default)]
struct RuleBook {
    rules: RwLock<Vec<Arc<InterceptRule>>>,
}

impl RuleBook {
    fn add(&self, rule: InterceptRule) {
        match self.rules.write() {
            Ok(mut rules) => rules.push(Arc::new(rule)),
            Err(poisoned) => poisoned.into_inner().push(Arc::new(rule)),
        }
    }

    fn find(&self, tx: &Transaction) -> Option<Arc<InterceptRule>> {
        let rules = match self.rules.read() {
            Ok(rules) => rules,
            Err(poisoned) => poisoned.into_inner(),
        };
        rules.iter().find(|rule| rule.matches(tx)).cloned()
    }

    fn clear(&self) {
        match self.rules.write() {
            Ok(mut rules) => rules.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
    }

    fn len(&self) -> usize {
        match self.rules.read() {
            Ok(rules) => rules.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

fn header_entries(headers: &[(String, String)]) -> Vec<HeaderEntry> {
    headers
        .iter()
        .map(|(name, value)| HeaderEntry {
            name: name.clone(),
            value: value.clone(),
        })
        .collect()
}

fn continue_params(request_id: RequestId, overrides: &ContinueOverrides) -> ContinueRequestParams {
    let mut params = ContinueRequestParams::new(request_id);
    if let Some(method) = &overrides.method {
        params.method = Some(method.clone());
    }
    if let Some(headers) = &overrides.headers {
        params.headers = Some(header_entries(headers));
    }
    if let Some(body) = &overrides.body {
        params.post_data = Some(BASE64.encode(body).into());
    }
    params
}

fn fulfill_params(
    request_id: RequestId,
    status: i64,
    headers: &[(String, String)],
    body: Option<&[u8]>,
) -> FulfillRequestParams {
    let mut params = FulfillRequestParams::new(request_id, status);
    if !headers.is_empty() {
        params.response_headers = Some(header_entries(headers));
    }
    if let Some(body) = body {
        params.body = Some(BASE64.encode(body).into());
    }
    params
}

/// Shared by the two event consumer tasks; everything inside is cheap to
/// clone.
#[derive(Clone)]
struct Dispatcher {
    page: Arc<Page>,
    book: Arc<RuleBook>,
    metrics: Arc<SessionMetrics>,
    log: AttemptLog,
    events: broadcast::Sender<SessionEvent>,
    fault: FaultSlot,
    auth: Option<Arc<AuthResponder>>,
}

impl Dispatcher {
    fn publish(&self, event: SessionEvent) {
        // No receivers is normal outside a wait_for call.
        let _ = self.events.send(event);
    }

    async fn on_request_paused(&self, event: &EventRequestPaused) {
        let tx = Transaction::from_event(event);
        self.metrics.record_transaction_paused();
        debug!(url = %tx.url, stage = ?tx.stage, method = %tx.method, "transaction paused");
        match self.book.find(&tx) {
            Some(rule) => {
                self.metrics.record_rule_match();
                match run_callback(&rule, &tx, &self.fault, &self.log) {
                    Some(action) => self.apply(&tx, action).await,
                    None => {
                        // Deliberately not resumed: the parked fault surfaces
                        // at the next suspension point and teardown abandons
                        // the transaction.
                    }
                }
            }
            None => self.fallback_continue(&tx).await,
        }
    }

    async fn apply(&self, tx: &Transaction, action: ResumeAction) {
        if !tx.claim() {
            self.fault.park(SessionError::Protocol(format!(
                "second resume attempted for {}",
                tx.url
            )));
            return;
        }
        let outcome = match action {
            ResumeAction::Continue(overrides) => {
                let result = match tx.stage {
                    InterceptStage::Request => self
                        .page
                        .execute(continue_params(tx.request_id.clone(), &overrides))
                        .await
                        .map(|_| ()),
                    InterceptStage::Response => self
                        .page
                        .execute(ContinueResponseParams::new(tx.request_id.clone()))
                        .await
                        .map(|_| ()),
                };
                if result.is_ok()
                    && tx.stage == InterceptStage::Response
                    && tx.response_status.is_some()
                {
                    self.publish(SessionEvent::ResponseObserved {
                        url: tx.url.clone(),
                        status: tx.response_status,
                    });
                }
                result
            }
            ResumeAction::Fulfill {
                status,
                headers,
                body,
            } => {
                let params =
                    fulfill_params(tx.request_id.clone(), status, &headers, body.as_deref());
                let result = self.page.execute(params).await.map(|_| ());
                if result.is_ok() {
                    self.metrics.record_fulfill();
                    self.log
                        .record(format!("fulfilled {} with status {status}", tx.url));
                    self.publish(SessionEvent::ResponseObserved {
                        url: tx.url.clone(),
                        status: Some(status),
                    });
                }
                result
            }
            ResumeAction::Fail { reason } => {
                let params = FailRequestParams::new(tx.request_id.clone(), ErrorReason::from(reason));
                let result = self.page.execute(params).await.map(|_| ());
                if result.is_ok() {
                    self.metrics.record_fail();
                    self.log
                        .record(format!("failed {} with {reason:?}", tx.url));
                }
                result
            }
        };
        if let Err(err) = outcome {
            self.fault.park(SessionError::Cdp(err));
        }
    }

    /// No rule claimed the transaction: plain continue, errors swallowed. A
    /// teardown racing this resume makes the call fail harmlessly.
    async fn fallback_continue(&self, tx: &Transaction) {
        if !tx.claim() {
            return;
        }
        let result = match tx.stage {
            InterceptStage::Request => self
                .page
                .execute(ContinueRequestParams::new(tx.request_id.clone()))
                .await
                .map(|_| ()),
            InterceptStage::Response => self
                .page
                .execute(ContinueResponseParams::new(tx.request_id.clone()))
                .await
                .map(|_| ()),
        };
        self.metrics.record_fallback_continue();
        if let Err(err) = result {
            warn!(url = %tx.url, error = %err, "fallback resume swallowed");
            self.log
                .record(format!("fallback resume swallowed for {}", tx.url));
            return;
        }
        if tx.stage == InterceptStage::Response && tx.response_status.is_some() {
            self.publish(SessionEvent::ResponseObserved {
                url: tx.url.clone(),
                status: tx.response_status,
            });
        }
    }

    async fn on_auth_required(&self, event: &EventAuthRequired) {
        self.metrics.record_auth_challenge();
        let source = match event.auth_challenge.source {
            Some(AuthChallengeSource::Proxy) => AuthSource::Proxy,
            Some(AuthChallengeSource::Server) => AuthSource::Server,
            None => AuthSource::Unknown,
        };
        let snapshot = AuthChallengeSnapshot {
            source,
            origin: event.auth_challenge.origin.clone(),
        };
        let decision = match &self.auth {
            Some(responder) => responder.decide(event.request_id.as_ref(), &snapshot),
            None => AuthDecision::Ignore,
        };
        let mut response = AuthChallengeResponse::new(AuthChallengeResponseResponse::Default);
        match decision {
            AuthDecision::Provide { username, password } => {
                response.response = AuthChallengeResponseResponse::ProvideCredentials;
                response.username = Some(username);
                response.password = Some(password);
                self.metrics.record_credentials_supplied();
                self.log.record("proxy credentials supplied");
            }
            AuthDecision::Cancel => {
                response.response = AuthChallengeResponseResponse::CancelAuth;
                self.log.record("repeated proxy auth challenge cancelled");
            }
            AuthDecision::Ignore => {}
        }
        let params = ContinueWithAuthParams::new(event.request_id.clone(), response);
        if let Err(err) = self.page.execute(params).await {
            warn!(error = %err, "auth resume swallowed");
        }
    }
}

/// Runs one rule callback; an error is parked for the driving control flow
/// and the transaction stays unresumed.
fn run_callback(
    rule: &InterceptRule,
    tx: &Transaction,
    fault: &FaultSlot,
    log: &AttemptLog,
) -> Option<ResumeAction> {
    log.record(format!(
        "rule {} matched {} ({:?})",
        rule.pattern.as_str(),
        tx.url,
        tx.stage
    ));
    match (rule.callback)(tx) {
        Ok(action) => Some(action),
        Err(err) => {
            log.record(format!("rule callback failed for {}: {err}", tx.url));
            fault.park(err);
            None
        }
    }
}

/// Fetch-domain interception for one page. Listeners are attached before the
/// domain is enabled so no pause event is lost.
pub struct RequestInterceptor {
    dispatcher: Dispatcher,
    enabled: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RequestInterceptor {
    pub(crate) fn new(
        page: Arc<Page>,
        metrics: Arc<SessionMetrics>,
        log: AttemptLog,
        events: broadcast::Sender<SessionEvent>,
        fault: FaultSlot,
        auth: Option<Arc<AuthResponder>>,
    ) -> Self {
        Self {
            dispatcher: Dispatcher {
                page,
                book: Arc::new(RuleBook::default()),
                metrics,
                log,
                events,
                fault,
                auth,
            },
            enabled: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Registers a rule, effective immediately. Order of registration is the
    /// order of evaluation.
    pub fn add<F>(&self, pattern: Regex, stage: InterceptStage, callback: F)
    where
        F: Fn(&Transaction) -> SessionResult<ResumeAction> + Send + Sync + 'static,
    {
        self.dispatcher.book.add(InterceptRule {
            pattern,
            stage,
            callback: Box::new(callback),
        });
    }

    pub fn rule_count(&self) -> usize {
        self.dispatcher.book.len()
    }

    pub async fn enable(&self) -> SessionResult<()> {
        if self.enabled.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut paused = self
            .dispatcher
            .page
            .event_listener::<EventRequestPaused>()
            .await?;
        let mut auth_events = self
            .dispatcher
            .page
            .event_listener::<EventAuthRequired>()
            .await?;
        let patterns = vec![
            RequestPattern::builder()
                .url_pattern("*")
                .request_stage(RequestStage::Request)
                .build(),
            RequestPattern::builder()
                .url_pattern("*")
                .request_stage(RequestStage::Response)
                .build(),
        ];
        let enable = EnableParams::builder()
            .patterns(patterns)
            .handle_auth_requests(true)
            .build();
        self.dispatcher.page.execute(enable).await?;

        let dispatcher = self.dispatcher.clone();
        let pause_task = tokio::spawn(async move {
            while let Some(event) = paused.next().await {
                dispatcher.on_request_paused(event.as_ref()).await;
            }
        });
        let dispatcher = self.dispatcher.clone();
        let auth_task = tokio::spawn(async move {
            while let Some(event) = auth_events.next().await {
                dispatcher.on_auth_required(event.as_ref()).await;
            }
        });
        match self.tasks.lock() {
            Ok(mut tasks) => tasks.extend([pause_task, auth_task]),
            Err(poisoned) => poisoned.into_inner().extend([pause_task, auth_task]),
        }
        debug!("request interception enabled");
        Ok(())
    }

    /// Stops intercepting and clears all rules. Safe to call repeatedly and
    /// before `enable`; a browser already gone only produces a warning.
    pub async fn disable(&self) {
        let tasks: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        for task in tasks {
            task.abort();
        }
        self.dispatcher.book.clear();
        if self.enabled.swap(false, Ordering::SeqCst) {
            if let Err(err) = self.dispatcher.page.execute(DisableParams::default()).await {
                warn!(error = %err, "fetch disable swallowed");
            }
        }
    }
}

impl std::fmt::Debug for RequestInterceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestInterceptor")
            .field("enabled", &self.enabled.load(Ordering::Relaxed))
            .field("rules", &self.dispatcher.book.len())
            .finish()
    }
}
