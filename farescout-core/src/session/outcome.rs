use std::time::Duration;

use regex::Regex;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use super::diagnostics::AttemptLog;
use super::error::{SessionError, SessionResult};
use super::interceptor::SessionEvent;
use super::launcher::PageDriver;

/// Declarative predicate raced against live session events.
#[derive(Debug, Clone)]
pub enum OutcomeCondition {
    /// A completed response whose URL matches; with `status` set, the
    /// response must carry exactly that code.
    UrlMatch {
        pattern: Regex,
        status: Option<i64>,
    },
    /// Rendered page content contains the needle. Checked once per event
    /// against a fresh snapshot, never polled.
    ContentMatch { needle: String },
}

/// Named outcome conditions for one `wait_for` call. Names are unique;
/// evaluation follows insertion order within each event.
#[derive(Debug, Default)]
pub struct OutcomeSet {
    entries: Vec<(String, OutcomeCondition)>,
}

impl OutcomeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn url(
        self,
        name: impl Into<String>,
        pattern: Regex,
        status: Option<i64>,
    ) -> SessionResult<Self> {
        self.push(name.into(), OutcomeCondition::UrlMatch { pattern, status })
    }

    pub fn content(self, name: impl Into<String>, needle: impl Into<String>) -> SessionResult<Self> {
        self.push(
            name.into(),
            OutcomeCondition::ContentMatch {
                needle: needle.into(),
            },
        )
    }

    fn push(mut self, name: String, condition: OutcomeCondition) -> SessionResult<Self> {
        if self.entries.iter().any(|(existing, _)| *existing == name) {
            return Err(SessionError::Configuration(format!(
                "duplicate outcome name: {name}"
            )));
        }
        self.entries.push((name, condition));
        Ok(self)
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn has_content_conditions(&self) -> bool {
        self.entries
            .iter()
            .any(|(_, condition)| matches!(condition, OutcomeCondition::ContentMatch { .. }))
    }

    fn match_content(&self, snapshot: &str) -> Option<MatchedOutcome> {
        for (name, condition) in &self.entries {
            if let OutcomeCondition::ContentMatch { needle } = condition {
                if snapshot.contains(needle.as_str()) {
                    return Some(MatchedOutcome {
                        name: name.clone(),
                        transaction: None,
                    });
                }
            }
        }
        None
    }
}

/// The transaction that satisfied a `UrlMatch` outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedTransaction {
    pub url: String,
    pub status: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedOutcome {
    pub name: String,
    /// `None` for content matches.
    pub transaction: Option<MatchedTransaction>,
}

/// Races every condition in `set` against the session event stream until one
/// matches or the timeout lapses. The page is probed for content at call
/// start and once per relevant event.
pub async fn wait_for(
    events: broadcast::Receiver<SessionEvent>,
    page: &dyn PageDriver,
    set: &OutcomeSet,
    timeout: Duration,
    log: &AttemptLog,
) -> SessionResult<MatchedOutcome> {
    if set.is_empty() {
        return Err(SessionError::Configuration(
            "wait_for requires at least one outcome condition".to_string(),
        ));
    }
    let waited_ms = timeout.as_millis() as u64;
    match tokio::time::timeout(timeout, drive(events, page, set)).await {
        Ok(Ok(outcome)) => {
            log.record(format!("outcome resolved: {}", outcome.name));
            debug!(outcome = %outcome.name, "wait_for resolved");
            Ok(outcome)
        }
        Ok(Err(err)) => Err(err),
        Err(_) => {
            log.record(format!(
                "no outcome within {waited_ms}ms (candidates: {})",
                set.names().join(", ")
            ));
            Err(SessionError::WaitTimeout { waited_ms })
        }
    }
}

async fn drive(
    mut events: broadcast::Receiver<SessionEvent>,
    page: &dyn PageDriver,
    set: &OutcomeSet,
) -> SessionResult<MatchedOutcome> {
    // The page may already satisfy a content condition when the call starts.
    if set.has_content_conditions() {
        let snapshot = page.content().await?;
        if let Some(outcome) = set.match_content(&snapshot) {
            return Ok(outcome);
        }
    }
    loop {
        match events.recv().await {
            Ok(event) => {
                if let Some(outcome) = check_event(&event, page, set).await? {
                    return Ok(outcome);
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "outcome matcher lagged behind session events");
            }
            Err(RecvError::Closed) => {
                return Err(SessionError::Protocol(
                    "session event channel closed during wait_for".to_string(),
                ));
            }
        }
    }
}

/// One event, one pass over the conditions in registration order. At most one
/// content snapshot is taken per event.
async fn check_event(
    event: &SessionEvent,
    page: &dyn PageDriver,
    set: &OutcomeSet,
) -> SessionResult<Option<MatchedOutcome>> {
    let observed = match event {
        SessionEvent::ResponseObserved { url, status } => Some((url, *status)),
        SessionEvent::PageActivity => None,
    };
    let mut snapshot: Option<String> = None;
    for (name, condition) in &set.entries {
        match condition {
            OutcomeCondition::UrlMatch { pattern, status } => {
                if let Some((url, observed_status)) = &observed {
                    let status_ok = match status {
                        Some(want) => *observed_status == Some(*want),
                        None => true,
                    };
                    if status_ok && pattern.is_match(url) {
                        return Ok(Some(MatchedOutcome {
                            name: name.clone(),
                            transaction: Some(MatchedTransaction {
                                url: (*url).clone(),
                                status: *observed_status,
                            }),
                        }));
                    }
                }
            }
            OutcomeCondition::ContentMatch { needle } => {
                if snapshot.is_none() {
                    snapshot = Some(page.content().await?);
                }
                if snapshot
                    .as_deref()
                    .map_or(false, |body| body.contains(needle.as_str()))
                {
                    return Ok(Some(MatchedOutcome {
                        name: name.clone(),
                        transaction: None,
                    }));
                }
            }
        }
    }
    Ok(None)
}
