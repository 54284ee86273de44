use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Counters shared between the scrape control flow and the event tasks, so
/// everything is atomic and incremented through `&self`.
#[derive(Debug, Default)]
pub struct SessionMetrics {
    transactions_paused: AtomicU64,
    rules_matched: AtomicU64,
    fulfilled: AtomicU64,
    failed_by_rule: AtomicU64,
    fallback_continues: AtomicU64,
    outcomes_matched: AtomicU64,
    wait_timeouts: AtomicU64,
    auth_challenges: AtomicU64,
    credentials_supplied: AtomicU64,
    attempts_started: AtomicU64,
    attempts_failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub transactions_paused: u64,
    pub rules_matched: u64,
    pub fulfilled: u64,
    pub failed_by_rule: u64,
    pub fallback_continues: u64,
    pub outcomes_matched: u64,
    pub wait_timeouts: u64,
    pub auth_challenges: u64,
    pub credentials_supplied: u64,
    pub attempts_started: u64,
    pub attempts_failed: u64,
}

impl SessionMetrics {
    pub fn record_transaction_paused(&self) {
        self.transactions_paused.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rule_match(&self) {
        self.rules_matched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fulfill(&self) {
        self.fulfilled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fail(&self) {
        self.failed_by_rule.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fallback_continue(&self) {
        self.fallback_continues.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_outcome_match(&self) {
        self.outcomes_matched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_wait_timeout(&self) {
        self.wait_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_auth_challenge(&self) {
        self.auth_challenges.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_credentials_supplied(&self) {
        self.credentials_supplied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_attempt_started(&self) {
        self.attempts_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_attempt_failed(&self) {
        self.attempts_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            transactions_paused: self.transactions_paused.load(Ordering::Relaxed),
            rules_matched: self.rules_matched.load(Ordering::Relaxed),
            fulfilled: self.fulfilled.load(Ordering::Relaxed),
            failed_by_rule: self.failed_by_rule.load(Ordering::Relaxed),
            fallback_continues: self.fallback_continues.load(Ordering::Relaxed),
            outcomes_matched: self.outcomes_matched.load(Ordering::Relaxed),
            wait_timeouts: self.wait_timeouts.load(Ordering::Relaxed),
            auth_challenges: self.auth_challenges.load(Ordering::Relaxed),
            credentials_supplied: self.credentials_supplied.load(Ordering::Relaxed),
            attempts_started: self.attempts_started.load(Ordering::Relaxed),
            attempts_failed: self.attempts_failed.load(Ordering::Relaxed),
        }
    }
}
