//! Spending Ledger (C9): durable daily/monthly USD counters with a
//! pre-request check and an atomic post-request increment.
//!
//! Unlike the per-user `BudgetManager` this gateway's ancestor proxy
//! uses (a `DashMap` of independent atomics, one entry per user), this
//! ledger has exactly two counters shared by every call, and the design
//! explicitly calls for one writer lock spanning read-check and
//! write-increment to rule out a double-spend race — so a single
//! `Mutex<LedgerState>` replaces the atomics-per-entry shape here.
//! Persistence reuses the proxy's pattern of a plain `serde_json`
//! blob, just written to a local file instead of reported to a remote
//! budget service.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::GatewayError;
use crate::telemetry::TelemetryLogger;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct Counter {
    amount: f64,
    reset_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Persisted {
    daily: Counter,
    monthly: Counter,
}

struct LedgerState {
    daily: Counter,
    monthly: Counter,
    daily_warned: bool,
    monthly_warned: bool,
}

/// Current status, as exposed by `GET /api/settings/spending`.
#[derive(Debug, Serialize)]
pub struct SpendingStatus {
    pub daily_amount: f64,
    pub daily_cap: f64,
    pub daily_resets_at: DateTime<Utc>,
    pub monthly_amount: f64,
    pub monthly_cap: f64,
    pub monthly_resets_at: DateTime<Utc>,
    pub warn_at_percent: u8,
}

pub struct SpendingLedger {
    state: Mutex<LedgerState>,
    daily_cap: Mutex<f64>,
    monthly_cap: Mutex<f64>,
    warn_at_percent: Mutex<u8>,
    data_dir: PathBuf,
    telemetry: Arc<TelemetryLogger>,
}

fn next_daily_reset(now: DateTime<Utc>) -> DateTime<Utc> {
    let tomorrow = now.date_naive() + chrono::Duration::days(1);
    tomorrow.and_hms_opt(0, 0, 0).expect("midnight is a valid time").and_utc()
}

fn next_monthly_reset(now: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = (now.year(), now.month());
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    chrono::NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .expect("valid first-of-month date")
        .and_hms_opt(0, 0, 0)
        .expect("midnight is a valid time")
        .and_utc()
}

/// Reset `counter` to a fresh zeroed window if `now` has crossed
/// `counter.reset_at`. Returns whether a reset occurred.
fn reset_if_elapsed(counter: &mut Counter, warned: &mut bool, now: DateTime<Utc>, next_reset: fn(DateTime<Utc>) -> DateTime<Utc>) -> bool {
    if now >= counter.reset_at {
        counter.amount = 0.0;
        counter.reset_at = next_reset(now);
        *warned = false;
        true
    } else {
        false
    }
}

impl SpendingLedger {
    /// Load persisted counters from `config.data_dir/spending.json` if
    /// present; otherwise start both windows at zero.
    pub async fn load(config: &Config, telemetry: Arc<TelemetryLogger>) -> Self {
        let data_dir = PathBuf::from(&config.data_dir);
        let path = data_dir.join("spending.json");
        let now = Utc::now();

        let persisted = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<Persisted>(&bytes).ok(),
            Err(_) => None,
        };

        let (daily, monthly) = match persisted {
            Some(p) => (p.daily, p.monthly),
            None => (
                Counter { amount: 0.0, reset_at: next_daily_reset(now) },
                Counter { amount: 0.0, reset_at: next_monthly_reset(now) },
            ),
        };

        Self {
            state: Mutex::new(LedgerState { daily, monthly, daily_warned: false, monthly_warned: false }),
            daily_cap: Mutex::new(config.spending_daily_cap),
            monthly_cap: Mutex::new(config.spending_monthly_cap),
            warn_at_percent: Mutex::new(config.spending_warn_at_percent),
            data_dir,
            telemetry,
        }
    }

    fn lock_poisoned(context: &str) -> GatewayError {
        GatewayError::InternalError { message: format!("spending ledger {context} lock poisoned") }
    }

    fn daily_cap(&self) -> Result<f64, GatewayError> {
        self.daily_cap.lock().map(|g| *g).map_err(|_| Self::lock_poisoned("daily cap"))
    }

    fn monthly_cap(&self) -> Result<f64, GatewayError> {
        self.monthly_cap.lock().map(|g| *g).map_err(|_| Self::lock_poisoned("monthly cap"))
    }

    fn warn_at_percent(&self) -> Result<u8, GatewayError> {
        self.warn_at_percent.lock().map(|g| *g).map_err(|_| Self::lock_poisoned("warn_at_percent"))
    }

    /// Adjust the configured caps/threshold at runtime (`POST /api/settings/spending`).
    pub fn configure(
        &self,
        daily_cap: Option<f64>,
        monthly_cap: Option<f64>,
        warn_at_percent: Option<u8>,
    ) -> Result<(), GatewayError> {
        if let Some(cap) = daily_cap {
            *self.daily_cap.lock().map_err(|_| Self::lock_poisoned("daily cap"))? = cap;
        }
        if let Some(cap) = monthly_cap {
            *self.monthly_cap.lock().map_err(|_| Self::lock_poisoned("monthly cap"))? = cap;
        }
        if let Some(percent) = warn_at_percent {
            *self.warn_at_percent.lock().map_err(|_| Self::lock_poisoned("warn_at_percent"))? = percent;
        }
        Ok(())
    }

    /// Pre-flight check: `ok` iff admitting `cost` would keep both windows
    /// under their caps. Applies any elapsed-window reset first, but never
    /// mutates the amount itself (no spend has happened yet).
    pub fn check(&self, cost: f64) -> Result<(), GatewayError> {
        let mut state = self.state.lock().map_err(|_| Self::lock_poisoned("state"))?;
        let now = Utc::now();
        reset_if_elapsed(&mut state.daily, &mut state.daily_warned, now, next_daily_reset);
        reset_if_elapsed(&mut state.monthly, &mut state.monthly_warned, now, next_monthly_reset);

        let daily_cap = self.daily_cap()?;
        let monthly_cap = self.monthly_cap()?;

        if state.daily.amount + cost > daily_cap {
            return Err(GatewayError::SpendingCapError {
                message: format!("daily spending cap of ${daily_cap:.2} would be exceeded"),
            });
        }
        if state.monthly.amount + cost > monthly_cap {
            return Err(GatewayError::SpendingCapError {
                message: format!("monthly spending cap of ${monthly_cap:.2} would be exceeded"),
            });
        }
        Ok(())
    }

    /// Atomically increment both windows by `cost` and persist. A reset that
    /// elapses mid-call sets the post-reset amount to exactly `cost`, per the
    /// reset-atomicity invariant (no concurrent increment is lost across the
    /// window boundary).
    pub async fn record(&self, cost: f64) -> Result<(), GatewayError> {
        let daily_cap = self.daily_cap()?;
        let monthly_cap = self.monthly_cap()?;
        let warn_at_percent = self.warn_at_percent()?;

        let (snapshot, warn_daily, warn_monthly) = {
            let mut state = self.state.lock().map_err(|_| Self::lock_poisoned("state"))?;
            let now = Utc::now();
            reset_if_elapsed(&mut state.daily, &mut state.daily_warned, now, next_daily_reset);
            reset_if_elapsed(&mut state.monthly, &mut state.monthly_warned, now, next_monthly_reset);

            state.daily.amount += cost;
            state.monthly.amount += cost;

            let warn_threshold = warn_at_percent as f64 / 100.0;
            let warn_daily = !state.daily_warned && state.daily.amount >= daily_cap * warn_threshold;
            if warn_daily {
                state.daily_warned = true;
            }
            let warn_monthly = !state.monthly_warned && state.monthly.amount >= monthly_cap * warn_threshold;
            if warn_monthly {
                state.monthly_warned = true;
            }

            (Persisted { daily: state.daily, monthly: state.monthly }, warn_daily, warn_monthly)
        };

        if warn_daily {
            self.telemetry.log(serde_json::json!({
                "type": "spending_warning",
                "window": "daily",
                "amount": snapshot.daily.amount,
                "cap": daily_cap,
            }));
        }
        if warn_monthly {
            self.telemetry.log(serde_json::json!({
                "type": "spending_warning",
                "window": "monthly",
                "amount": snapshot.monthly.amount,
                "cap": monthly_cap,
            }));
        }

        self.persist(&snapshot).await;
        Ok(())
    }

    async fn persist(&self, snapshot: &Persisted) {
        if let Err(err) = tokio::fs::create_dir_all(&self.data_dir).await {
            tracing::warn!(error = %err, "failed to create data directory, spending not persisted");
            return;
        }
        let path = self.data_dir.join("spending.json");
        match serde_json::to_vec_pretty(snapshot) {
            Ok(bytes) => {
                if let Err(err) = tokio::fs::write(&path, bytes).await {
                    tracing::warn!(error = %err, path = %path.display(), "failed to persist spending ledger");
                }
            }
            Err(err) => tracing::warn!(error = %err, "failed to serialize spending ledger"),
        }
    }

    pub fn status(&self) -> Result<SpendingStatus, GatewayError> {
        let mut state = self.state.lock().map_err(|_| Self::lock_poisoned("state"))?;
        let now = Utc::now();
        reset_if_elapsed(&mut state.daily, &mut state.daily_warned, now, next_daily_reset);
        reset_if_elapsed(&mut state.monthly, &mut state.monthly_warned, now, next_monthly_reset);

        Ok(SpendingStatus {
            daily_amount: state.daily.amount,
            daily_cap: self.daily_cap()?,
            daily_resets_at: state.daily.reset_at,
            monthly_amount: state.monthly.amount,
            monthly_cap: self.monthly_cap()?,
            monthly_resets_at: state.monthly.reset_at,
            warn_at_percent: self.warn_at_percent()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger_with(daily_cap: f64, daily_amount: f64) -> SpendingLedger {
        let now = Utc::now();
        SpendingLedger {
            state: Mutex::new(LedgerState {
                daily: Counter { amount: daily_amount, reset_at: next_daily_reset(now) },
                monthly: Counter { amount: daily_amount, reset_at: next_monthly_reset(now) },
                daily_warned: false,
                monthly_warned: false,
            }),
            daily_cap: Mutex::new(daily_cap),
            monthly_cap: Mutex::new(1000.0),
            warn_at_percent: Mutex::new(80),
            data_dir: std::env::temp_dir().join("freegate-test-spending"),
            telemetry: Arc::new(TelemetryLogger::new(crate::telemetry::TelemetrySink::Null, 10)),
        }
    }

    #[test]
    fn check_rejects_when_cap_would_be_exceeded() {
        let ledger = ledger_with(1.00, 0.95);
        assert!(ledger.check(0.10).is_err());
        assert_eq!(ledger.status().unwrap().daily_amount, 0.95, "check must not mutate the amount");
    }

    #[test]
    fn check_admits_when_within_cap() {
        let ledger = ledger_with(1.00, 0.95);
        assert!(ledger.check(0.04).is_ok());
    }

    #[tokio::test]
    async fn record_increments_and_persists_cumulatively() {
        let ledger = ledger_with(1.00, 0.95);
        ledger.record(0.04).await.unwrap();
        assert!((ledger.status().unwrap().daily_amount - 0.99).abs() < 1e-9);

        assert!(ledger.check(0.005).is_ok());
        ledger.record(0.005).await.unwrap();
        assert!((ledger.status().unwrap().daily_amount - 0.995).abs() < 1e-9);
    }

    #[test]
    fn reset_if_elapsed_zeroes_amount_and_clears_warned_flag() {
        let mut counter = Counter { amount: 4.0, reset_at: Utc::now() - chrono::Duration::seconds(1) };
        let mut warned = true;
        let did_reset = reset_if_elapsed(&mut counter, &mut warned, Utc::now(), next_daily_reset);
        assert!(did_reset);
        assert_eq!(counter.amount, 0.0);
        assert!(!warned);
    }

    #[test]
    fn reset_if_elapsed_is_noop_before_the_window_ends() {
        let mut counter = Counter { amount: 4.0, reset_at: Utc::now() + chrono::Duration::hours(1) };
        let mut warned = false;
        let did_reset = reset_if_elapsed(&mut counter, &mut warned, Utc::now(), next_daily_reset);
        assert!(!did_reset);
        assert_eq!(counter.amount, 4.0);
    }
}
