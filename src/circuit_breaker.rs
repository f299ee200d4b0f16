//! Per-model circuit breaker.
//!
//! Mirrors the concurrent-map-of-atomics shape used by the spending
//! ledger (see `budget.rs`), except each entry carries two fields that
//! must change together (`consecutive_failures` and `opened_at`), so
//! each entry is a short-lived-lock `Mutex` rather than a pair of
//! independent atomics. `DashMap` already shards the outer map, so the
//! critical section per call is just one entry's fields.
//!
//! The wall clock is injected (defaulting to `Utc::now`) so tests can
//! simulate the passage of time across the open -> half-open boundary
//! without a real sleep.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Mutex;

/// Derived state of a single model's circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct CircuitEntry {
    consecutive_failures: u32,
    opened_at: Option<DateTime<Utc>>,
}

impl CircuitEntry {
    fn new() -> Self {
        Self {
            consecutive_failures: 0,
            opened_at: None,
        }
    }
}

/// Keyed, per-model failure counter with closed/open/half-open states.
pub struct CircuitBreaker {
    entries: DashMap<String, Mutex<CircuitEntry>>,
    failure_threshold: u32,
    reset: chrono::Duration,
    clock: Box<dyn Fn() -> DateTime<Utc> + Send + Sync>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, reset_ms: u64) -> Self {
        Self::with_clock(failure_threshold, reset_ms, Utc::now)
    }

    /// Construct with an injected clock, for deterministic tests.
    pub fn with_clock(
        failure_threshold: u32,
        reset_ms: u64,
        clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static,
    ) -> Self {
        Self {
            entries: DashMap::new(),
            failure_threshold,
            reset: chrono::Duration::milliseconds(reset_ms as i64),
            clock: Box::new(clock),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    fn derive_state(&self, entry: &CircuitEntry) -> CircuitState {
        match entry.opened_at {
            None => CircuitState::Closed,
            Some(opened_at) => {
                if self.now() >= opened_at + self.reset {
                    CircuitState::HalfOpen
                } else {
                    CircuitState::Open
                }
            }
        }
    }

    /// True iff the circuit is currently open (half-open still allows a probe).
    pub fn is_open(&self, model: &str) -> anyhow::Result<bool> {
        match self.entries.get(model) {
            Some(entry) => {
                let guard = entry
                    .lock()
                    .map_err(|e| anyhow::anyhow!("circuit entry lock poisoned: {e}"))?;
                Ok(self.derive_state(&guard) == CircuitState::Open)
            }
            None => Ok(false),
        }
    }

    /// The instant the circuit will transition out of `Open`, if it is currently open.
    pub fn reset_time(&self, model: &str) -> anyhow::Result<Option<DateTime<Utc>>> {
        let Some(entry) = self.entries.get(model) else {
            return Ok(None);
        };
        let guard = entry
            .lock()
            .map_err(|e| anyhow::anyhow!("circuit entry lock poisoned: {e}"))?;
        Ok(match self.derive_state(&guard) {
            CircuitState::Open => guard.opened_at.map(|t| t + self.reset),
            _ => None,
        })
    }

    /// Current derived state, for observability / tests.
    pub fn state(&self, model: &str) -> anyhow::Result<CircuitState> {
        match self.entries.get(model) {
            Some(entry) => {
                let guard = entry
                    .lock()
                    .map_err(|e| anyhow::anyhow!("circuit entry lock poisoned: {e}"))?;
                Ok(self.derive_state(&guard))
            }
            None => Ok(CircuitState::Closed),
        }
    }

    /// Record a failure. Implicitly creates the entry on first failure.
    pub fn record_failure(&self, model: &str) -> anyhow::Result<()> {
        let entry = self
            .entries
            .entry(model.to_string())
            .or_insert_with(|| Mutex::new(CircuitEntry::new()));
        let mut guard = entry
            .lock()
            .map_err(|e| anyhow::anyhow!("circuit entry lock poisoned: {e}"))?;

        let was_half_open = self.derive_state(&guard) == CircuitState::HalfOpen;
        guard.consecutive_failures += 1;

        if was_half_open || guard.consecutive_failures >= self.failure_threshold {
            guard.opened_at = Some(self.now());
        }
        Ok(())
    }

    /// Record a success. Deletes the entry entirely (circuit closed, count reset).
    /// Idempotent: calling this on an already-absent entry is a no-op.
    pub fn record_success(&self, model: &str) {
        self.entries.remove(model);
    }
}
