//! Per-provider governance state and its snapshot.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

use super::circuit::{CircuitBreaker, CircuitRejection, CircuitStatus, Permit};
use super::rate_limit::FixedWindow;
use crate::config::{CircuitBreakerSettings, RateLimitSettings};
use crate::llm::Usage;

/// Why admission was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    RateLimited(Duration),
    Circuit(CircuitRejection),
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct ProviderStats {
    pub admitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Calls refused upstream because of the caller's request or key.
    pub caller_errors: u64,
    pub rejected_rate_limited: u64,
    pub rejected_circuit_open: u64,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
    pub last_latency_ms: Option<u64>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug)]
struct Inner {
    window: FixedWindow,
    circuit: CircuitBreaker,
    in_flight: usize,
    stats: ProviderStats,
}

/// Governance state of one provider. All fields sit behind one lock so the
/// circuit check and the window check see a consistent view.
#[derive(Debug)]
pub struct ProviderState {
    name: String,
    inner: Mutex<Inner>,
}

impl ProviderState {
    pub fn new(
        name: impl Into<String>,
        rate_limit: &RateLimitSettings,
        circuit_breaker: &CircuitBreakerSettings,
    ) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(Inner {
                window: FixedWindow::new(rate_limit),
                circuit: CircuitBreaker::new(circuit_breaker),
                in_flight: 0,
                stats: ProviderStats::default(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Every critical section leaves the state consistent, so a poisoned lock is still usable
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admit one call or refuse it. A refused call consumes neither window
    /// budget nor the half-open probe slot.
    pub fn try_admit(&self, now: Instant) -> Result<Permit, Rejection> {
        let mut inner = self.lock();
        let permit = match inner.circuit.check(now) {
            Ok(permit) => permit,
            Err(rejection) => {
                inner.stats.rejected_circuit_open += 1;
                return Err(Rejection::Circuit(rejection));
            }
        };
        if let Err(retry_after) = inner.window.check(now) {
            inner.stats.rejected_rate_limited += 1;
            return Err(Rejection::RateLimited(retry_after));
        }

        inner.window.commit(now);
        inner.circuit.begin(permit);
        inner.in_flight += 1;
        inner.stats.admitted += 1;
        Ok(permit)
    }

    pub fn record_success(&self, permit: Permit, usage: &Usage) {
        let mut inner = self.lock();
        inner.circuit.record_success(permit);
        inner.in_flight = inner.in_flight.saturating_sub(1);
        inner.stats.completed += 1;
        inner.stats.total_tokens += usage.tokens;
        inner.stats.total_cost_usd += usage.cost_usd;
        inner.stats.last_latency_ms = Some(usage.ms);
    }

    pub fn record_failure(&self, permit: Permit, latency: Duration, error: &str) {
        let now = Instant::now();
        let mut inner = self.lock();
        inner.circuit.record_failure(permit, now);
        inner.in_flight = inner.in_flight.saturating_sub(1);
        inner.stats.failed += 1;
        inner.stats.last_latency_ms = Some(latency.as_millis() as u64);
        inner.stats.last_failure_at = Some(Utc::now());
        inner.stats.last_error = Some(error.to_string());
    }

    pub fn record_cancelled(&self, permit: Permit) {
        let mut inner = self.lock();
        inner.circuit.release(permit);
        inner.in_flight = inner.in_flight.saturating_sub(1);
        inner.stats.cancelled += 1;
    }

    /// Settle a call the backend refused because of the caller. The circuit
    /// only releases the permit; the failure streak is left as it was.
    pub fn record_caller_error(&self, permit: Permit, error: &str) {
        let mut inner = self.lock();
        inner.circuit.release(permit);
        inner.in_flight = inner.in_flight.saturating_sub(1);
        inner.stats.caller_errors += 1;
        inner.stats.last_error = Some(error.to_string());
    }

    pub fn snapshot(&self, now: Instant) -> ProviderSnapshot {
        let inner = self.lock();
        ProviderSnapshot {
            name: self.name.clone(),
            circuit: inner.circuit.status(now),
            consecutive_failures: inner.circuit.consecutive_failures(),
            in_flight: inner.in_flight,
            window_used: inner.window.used(now),
            window_limit: inner.window.limit(),
            window_seconds: inner.window.window().as_secs(),
            stats: inner.stats.clone(),
        }
    }
}

/// Point-in-time copy of a provider's state.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderSnapshot {
    pub name: String,
    pub circuit: CircuitStatus,
    pub consecutive_failures: u32,
    pub in_flight: usize,
    pub window_used: u32,
    pub window_limit: u32,
    pub window_seconds: u64,
    #[serde(flatten)]
    pub stats: ProviderStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(limit: u32, threshold: u32) -> ProviderState {
        ProviderState::new(
            "oai",
            &RateLimitSettings {
                requests_per_window: limit,
                window_seconds: 60,
            },
            &CircuitBreakerSettings {
                failure_threshold: threshold,
                cooldown_seconds: 30,
            },
        )
    }

    fn usage(tokens: u64) -> Usage {
        Usage {
            provider: "oai".to_string(),
            model: "m".to_string(),
            tokens,
            ms: 42,
            cost_usd: 0.5,
        }
    }

    #[test]
    fn open_circuit_does_not_consume_window() {
        let s = state(2, 1);
        let now = Instant::now();
        let permit = s.try_admit(now).unwrap();
        s.record_failure(permit, Duration::from_millis(5), "boom");

        assert!(matches!(
            s.try_admit(now),
            Err(Rejection::Circuit(CircuitRejection::Open(_)))
        ));
        let snap = s.snapshot(now);
        assert_eq!(snap.window_used, 1);
        assert_eq!(snap.stats.rejected_circuit_open, 1);
        assert_eq!(snap.circuit, CircuitStatus::Open);
        assert!(snap.stats.last_failure_at.is_some());
        assert_eq!(snap.stats.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn rate_limited_call_keeps_probe_slot() {
        let s = state(1, 1);
        let now = Instant::now();
        let permit = s.try_admit(now).unwrap();
        s.record_failure(permit, Duration::ZERO, "boom");

        // Cooldown over but the window is still exhausted
        let later = now + Duration::from_secs(30);
        assert!(matches!(s.try_admit(later), Err(Rejection::RateLimited(_))));
        assert_eq!(s.snapshot(later).circuit, CircuitStatus::HalfOpen);

        // Next window: the probe slot is still free
        let next = now + Duration::from_secs(60);
        assert_eq!(s.try_admit(next), Ok(Permit::Probe));
    }

    #[test]
    fn outcomes_update_stats() {
        let s = state(0, 5);
        let now = Instant::now();

        let a = s.try_admit(now).unwrap();
        let b = s.try_admit(now).unwrap();
        assert_eq!(s.snapshot(now).in_flight, 2);

        s.record_success(a, &usage(100));
        s.record_cancelled(b);

        let snap = s.snapshot(now);
        assert_eq!(snap.in_flight, 0);
        assert_eq!(snap.stats.admitted, 2);
        assert_eq!(snap.stats.completed, 1);
        assert_eq!(snap.stats.cancelled, 1);
        assert_eq!(snap.stats.total_tokens, 100);
        assert_eq!(snap.stats.last_latency_ms, Some(42));

        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["caller_errors"], 0);
        assert_eq!(json["circuit"], "closed");
        assert_eq!(json["completed"], 1);
    }

    #[test]
    fn caller_error_keeps_circuit_closed_and_frees_trial_slot() {
        let s = state(0, 1);
        let now = Instant::now();

        let permit = s.try_admit(now).unwrap();
        s.record_caller_error(permit, "api error (status 401): bad key");
        let snap = s.snapshot(now);
        assert_eq!(snap.circuit, CircuitStatus::Closed);
        assert_eq!(snap.consecutive_failures, 0);
        assert_eq!(snap.stats.caller_errors, 1);
        assert_eq!(snap.stats.failed, 0);
        assert_eq!(snap.in_flight, 0);

        // A caller error on the half-open trial leaves the slot for the next caller
        let permit = s.try_admit(now).unwrap();
        s.record_failure(permit, Duration::ZERO, "boom");
        let later = now + Duration::from_secs(30);
        let trial = s.try_admit(later).unwrap();
        assert_eq!(trial, Permit::Probe);
        s.record_caller_error(trial, "missing key");
        assert_eq!(s.snapshot(later).circuit, CircuitStatus::HalfOpen);
        assert_eq!(s.try_admit(later), Ok(Permit::Probe));
    }
}
