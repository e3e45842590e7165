//! # Exponential Backoff
//!
//! Requeue delays for failed reconciliations. Each resource key keeps its
//! own error count, so one failing resource never slows down the others.
//! The sequence doubles from `initial` and is capped at `max`, which the
//! controllers set to their resync interval.
//!
//! Sequence with the defaults: 5s, 10s, 20s, 40s, 80s, 160s, 300s (max).
//!
//! A deleted resource is never reconciled again, so its entry would never
//! be reset. Entries whose last failure is older than `STALE_AFTER` times
//! the cap are dropped on the next recorded failure, and callers that know
//! the live key set can prune with [`BackoffRegistry::retain`].

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Multiple of the cap after which an idle entry is forgotten
const STALE_AFTER: u32 = 4;

/// Exponential backoff calculator
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    current: Duration,
    max: Duration,
}

impl ExponentialBackoff {
    /// Create a backoff starting at `initial` and capped at `max`
    #[must_use]
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            current: initial.min(max),
            max,
        }
    }

    /// Get the next backoff duration and advance the sequence
    pub fn next_backoff(&mut self) -> Duration {
        let result = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        result
    }

    /// Reset the backoff to the initial state
    pub fn reset(&mut self) {
        self.current = self.initial.min(self.max);
    }

    /// Backoff for a given number of consecutive errors (stateless).
    ///
    /// `error_count` 0 and 1 both yield `initial`.
    #[must_use]
    pub fn calculate_for_error_count(error_count: u32, initial: Duration, max: Duration) -> Duration {
        let doublings = error_count.saturating_sub(1).min(31);
        initial.saturating_mul(1 << doublings).min(max)
    }
}

/// Backoff state for a resource
#[derive(Debug, Clone)]
struct BackoffState {
    backoff: ExponentialBackoff,
    error_count: u32,
    last_failure: Instant,
}

/// Per-resource backoff bookkeeping shared by all reconcile workers
#[derive(Debug)]
pub struct BackoffRegistry {
    initial: Duration,
    max: Duration,
    /// Error count tracking per resource (namespace/name -> BackoffState)
    states: Mutex<HashMap<String, BackoffState>>,
}

impl BackoffRegistry {
    /// Registry whose delays start at `initial` and never exceed `max`
    #[must_use]
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Record a failure of `key` and return how long to wait before retrying
    pub fn record_failure(&self, key: &str) -> Duration {
        let now = Instant::now();
        let stale = self.max.saturating_mul(STALE_AFTER);
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        states.retain(|k, s| k == key || now.duration_since(s.last_failure) <= stale);

        let state = states.entry(key.to_string()).or_insert_with(|| BackoffState {
            backoff: ExponentialBackoff::new(self.initial, self.max),
            error_count: 0,
            last_failure: now,
        });
        state.error_count += 1;
        state.last_failure = now;
        state.backoff.next_backoff()
    }

    /// Keep only the entries whose key passes `keep`
    pub fn retain(&self, keep: impl Fn(&str) -> bool) {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|key, _| keep(key));
    }

    /// Number of keys with recorded failures
    pub fn len(&self) -> usize {
        self.states.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether no key has recorded failures
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget the failures of `key` (on successful reconciliation)
    pub fn reset(&self, key: &str) {
        self.states.lock().unwrap_or_else(PoisonError::into_inner).remove(key);
    }

    /// Consecutive failures recorded for `key`
    pub fn error_count(&self, key: &str) -> u32 {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map_or(0, |s| s.error_count)
    }
}
