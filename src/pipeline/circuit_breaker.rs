//! Per-source circuit breaker.
//!
//! Isolates a failing upstream so healthy sources keep their schedule.
//!
//! ## States
//!
//! ```text
//! Closed --(failure_threshold consecutive failures)--> Open
//! Open   --(cooldown elapsed, next call)-------------> HalfOpen (one trial)
//! HalfOpen --trial ok--> Closed
//! HalfOpen --trial failed--> Open (cooldown restarts, may grow)
//! ```
//!
//! While Open, or while a HalfOpen trial is running, calls fail with
//! [`AppError::BreakerOpen`] and the wrapped function is never invoked.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

use crate::error::{AppError, Result};
use crate::models::{BreakerConfig, Config, CooldownPolicy};

/// Breaker state of one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Read-only view of one source's breaker, for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    pub source_id: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    /// When the breaker last opened; only set while Open
    pub opened_at: Option<DateTime<Utc>>,
    /// When the wrapped function was last invoked
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Seconds until a trial is allowed; only set while Open
    pub retry_in_secs: Option<u64>,
}

#[derive(Debug)]
struct BreakerEntry {
    state: BreakerState,
    consecutive_failures: u32,
    /// Failed trials since the breaker first opened; drives cooldown growth
    failed_trials: u32,
    opened_at: Option<Instant>,
    opened_at_utc: Option<DateTime<Utc>>,
    last_attempt_at: Option<DateTime<Utc>>,
    trial_in_flight: bool,
}

impl Default for BreakerEntry {
    fn default() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            failed_trials: 0,
            opened_at: None,
            opened_at_utc: None,
            last_attempt_at: None,
            trial_in_flight: false,
        }
    }
}

impl BreakerEntry {
    fn open(&mut self, now: Instant) {
        self.state = BreakerState::Open;
        self.opened_at = Some(now);
        self.opened_at_utc = Some(Utc::now());
        self.trial_in_flight = false;
    }

    fn close(&mut self) {
        self.state = BreakerState::Closed;
        self.consecutive_failures = 0;
        self.failed_trials = 0;
        self.opened_at = None;
        self.opened_at_utc = None;
        self.trial_in_flight = false;
    }
}

enum Permit {
    Normal,
    Trial,
}

/// Releases the HalfOpen trial slot if the trial future is dropped early.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    source_id: &'a str,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut entries = self.breaker.entries();
        if let Some(entry) = entries.get_mut(self.source_id) {
            entry.trial_in_flight = false;
        }
        log::debug!(
            "Circuit breaker [{}]: trial abandoned, slot released",
            self.source_id
        );
    }
}

/// Circuit breakers for every source, keyed by source id.
#[derive(Debug)]
pub struct CircuitBreaker {
    default_policy: BreakerConfig,
    overrides: HashMap<String, BreakerConfig>,
    entries: Mutex<HashMap<String, BreakerEntry>>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitBreaker {
    /// Create a breaker with the default policy.
    pub fn new() -> Self {
        Self::with_config(BreakerConfig::default())
    }

    /// Create a breaker with a custom default policy.
    pub fn with_config(default_policy: BreakerConfig) -> Self {
        Self {
            default_policy,
            overrides: HashMap::new(),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Create a breaker from the application config, including per-source overrides.
    pub fn from_config(config: &Config) -> Self {
        let mut breaker = Self::with_config(config.breaker.clone());
        for source in &config.sources {
            if let Some(policy) = &source.breaker {
                breaker = breaker.with_override(source.id.clone(), policy.clone());
            }
        }
        breaker
    }

    /// Use a different policy for one source.
    pub fn with_override(mut self, source_id: impl Into<String>, policy: BreakerConfig) -> Self {
        self.overrides.insert(source_id.into(), policy);
        self
    }

    fn policy(&self, source_id: &str) -> &BreakerConfig {
        self.overrides
            .get(source_id)
            .unwrap_or(&self.default_policy)
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, BreakerEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cooldown after `failed_trials` failed trial calls.
    fn cooldown(&self, source_id: &str, failed_trials: u32) -> Duration {
        let policy = self.policy(source_id);
        let base = policy.cooldown_secs;
        let secs = match policy.cooldown_policy {
            CooldownPolicy::Fixed => base,
            CooldownPolicy::Linear => base.saturating_mul(u64::from(failed_trials) + 1),
            CooldownPolicy::Exponential => {
                base.saturating_mul(2u64.saturating_pow(failed_trials.min(63)))
            }
        };
        Duration::from_secs(secs.min(policy.max_cooldown_secs.max(base)))
    }

    /// Run `f` for `source_id` under the breaker.
    ///
    /// Returns [`AppError::BreakerOpen`] without calling `f` when the source
    /// is Open or a HalfOpen trial is already running. The outcome of `f` is
    /// recorded before it is returned.
    pub async fn execute<T, F, Fut>(&self, source_id: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let permit = self.acquire(source_id)?;
        let mut guard = TrialGuard {
            breaker: self,
            source_id,
            armed: matches!(permit, Permit::Trial),
        };

        let result = f().await;

        guard.armed = false;
        self.record(source_id, &permit, result.is_ok());
        result
    }

    fn acquire(&self, source_id: &str) -> Result<Permit> {
        let now = Instant::now();
        let mut entries = self.entries();
        let entry = entries.entry(source_id.to_string()).or_default();

        let permit = match entry.state {
            BreakerState::Closed => Permit::Normal,
            BreakerState::Open => {
                let cooldown = self.cooldown(source_id, entry.failed_trials);
                let cooled = entry
                    .opened_at
                    .is_none_or(|opened| now.saturating_duration_since(opened) >= cooldown);
                if !cooled {
                    return Err(self.reject(source_id));
                }
                entry.state = BreakerState::HalfOpen;
                entry.opened_at = None;
                entry.opened_at_utc = None;
                entry.trial_in_flight = true;
                log::info!(
                    "Circuit breaker [{}]: HALF-OPEN after {}s cooldown, allowing one trial",
                    source_id,
                    cooldown.as_secs()
                );
                record_transition(source_id, BreakerState::HalfOpen);
                Permit::Trial
            }
            BreakerState::HalfOpen => {
                if entry.trial_in_flight {
                    return Err(self.reject(source_id));
                }
                entry.trial_in_flight = true;
                Permit::Trial
            }
        };

        entry.last_attempt_at = Some(Utc::now());
        Ok(permit)
    }

    fn reject(&self, source_id: &str) -> AppError {
        log::debug!("Circuit breaker [{}]: OPEN, call short-circuited", source_id);
        metrics::counter!("feedhub_breaker_rejections_total", "source" => source_id.to_string())
            .increment(1);
        AppError::BreakerOpen {
            source_id: source_id.to_string(),
        }
    }

    fn record(&self, source_id: &str, permit: &Permit, success: bool) {
        let now = Instant::now();
        let threshold = self.policy(source_id).failure_threshold;
        let mut entries = self.entries();
        let entry = entries.entry(source_id.to_string()).or_default();

        match (permit, success) {
            (Permit::Trial, true) => {
                entry.close();
                log::info!("Circuit breaker [{}]: CLOSED, trial succeeded", source_id);
                record_transition(source_id, BreakerState::Closed);
            }
            (Permit::Trial, false) => {
                entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
                entry.failed_trials = entry.failed_trials.saturating_add(1);
                entry.open(now);
                log::warn!(
                    "Circuit breaker [{}]: OPEN again, trial failed (next cooldown {}s)",
                    source_id,
                    self.cooldown(source_id, entry.failed_trials).as_secs()
                );
                record_transition(source_id, BreakerState::Open);
            }
            // A normal call that finishes after the breaker left Closed does not
            // touch the Open/HalfOpen bookkeeping.
            (Permit::Normal, _) if entry.state != BreakerState::Closed => {}
            (Permit::Normal, true) => {
                entry.consecutive_failures = 0;
            }
            (Permit::Normal, false) => {
                entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
                if entry.consecutive_failures >= threshold {
                    entry.failed_trials = 0;
                    entry.open(now);
                    log::warn!(
                        "Circuit breaker [{}]: OPEN after {} consecutive failures",
                        source_id,
                        entry.consecutive_failures
                    );
                    record_transition(source_id, BreakerState::Open);
                }
            }
        }
    }

    /// Current state of one source; unknown sources report Closed.
    pub fn snapshot(&self, source_id: &str) -> BreakerSnapshot {
        let entries = self.entries();
        match entries.get(source_id) {
            Some(entry) => self.snapshot_of(source_id, entry),
            None => self.snapshot_of(source_id, &BreakerEntry::default()),
        }
    }

    /// States of every source the breaker has seen, sorted by id.
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let entries = self.entries();
        let mut snapshots: Vec<BreakerSnapshot> = entries
            .iter()
            .map(|(id, entry)| self.snapshot_of(id, entry))
            .collect();
        snapshots.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        snapshots
    }

    fn snapshot_of(&self, source_id: &str, entry: &BreakerEntry) -> BreakerSnapshot {
        let retry_in_secs = match (entry.state, entry.opened_at) {
            (BreakerState::Open, Some(opened)) => {
                let cooldown = self.cooldown(source_id, entry.failed_trials);
                Some(cooldown.saturating_sub(opened.elapsed()).as_secs())
            }
            _ => None,
        };
        BreakerSnapshot {
            source_id: source_id.to_string(),
            state: entry.state,
            consecutive_failures: entry.consecutive_failures,
            opened_at: entry.opened_at_utc,
            last_attempt_at: entry.last_attempt_at,
            retry_in_secs,
        }
    }

    /// Forget all state for a source, closing its breaker.
    pub fn reset(&self, source_id: &str) {
        if self.entries().remove(source_id).is_some() {
            log::info!("Circuit breaker [{}]: reset", source_id);
        }
    }
}

fn record_transition(source_id: &str, to: BreakerState) {
    metrics::counter!(
        "feedhub_breaker_transitions_total",
        "source" => source_id.to_string(),
        "to" => to.as_str()
    )
    .increment(1);
}
