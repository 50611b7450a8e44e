//! Circuit breaker for a single provider.
//!
//! ```text
//! CLOSED ──[threshold consecutive failures]──► OPEN
//!   ▲                                            │
//!   │                                       [cooldown]
//!   │                                            ▼
//!   └──────────[probe succeeds]────────── HALF-OPEN ──[probe fails]──► OPEN
//! ```
//!
//! Half-open admits exactly one probe. A cancelled probe frees the slot and
//! the circuit stays half-open.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::config::CircuitBreakerSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStatus {
    Closed,
    Open,
    HalfOpen,
}

/// What an admitted call counts as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permit {
    Normal,
    Probe,
}

/// Why the circuit refused a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitRejection {
    /// Cooling down; the payload is the time left.
    Open(Duration),
    /// Half-open with its single probe already running.
    ProbeInFlight,
}

#[derive(Debug, Clone, Copy)]
enum State {
    Closed,
    Open { since: Instant },
    HalfOpen { probing: bool },
}

#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    state: State,
    consecutive_failures: u32,
}

impl CircuitBreaker {
    /// A `failure_threshold` of zero never opens the circuit.
    pub fn new(settings: &CircuitBreakerSettings) -> Self {
        Self {
            threshold: settings.failure_threshold,
            cooldown: settings.cooldown(),
            state: State::Closed,
            consecutive_failures: 0,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Status as observed at `now`. An open circuit whose cooldown has
    /// elapsed reports half-open.
    pub fn status(&self, now: Instant) -> CircuitStatus {
        match self.state {
            State::Closed => CircuitStatus::Closed,
            State::Open { since } if now < since + self.cooldown => CircuitStatus::Open,
            State::Open { .. } | State::HalfOpen { .. } => CircuitStatus::HalfOpen,
        }
    }

    /// Check whether a call may go through. Does not change state.
    pub fn check(&self, now: Instant) -> Result<Permit, CircuitRejection> {
        match self.state {
            State::Closed => Ok(Permit::Normal),
            State::Open { since } if now < since + self.cooldown => {
                Err(CircuitRejection::Open(since + self.cooldown - now))
            }
            State::Open { .. } | State::HalfOpen { probing: false } => Ok(Permit::Probe),
            State::HalfOpen { probing: true } => Err(CircuitRejection::ProbeInFlight),
        }
    }

    /// Record that a call admitted by [`check`](Self::check) has started.
    pub fn begin(&mut self, permit: Permit) {
        if permit == Permit::Probe {
            self.state = State::HalfOpen { probing: true };
        }
    }

    pub fn record_success(&mut self, permit: Permit) {
        match (permit, self.state) {
            (Permit::Probe, _) => {
                self.state = State::Closed;
                self.consecutive_failures = 0;
            }
            (Permit::Normal, State::Closed) => self.consecutive_failures = 0,
            // A call admitted before the circuit opened does not close it
            (Permit::Normal, _) => {}
        }
    }

    pub fn record_failure(&mut self, permit: Permit, now: Instant) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        match (permit, self.state) {
            (Permit::Probe, _) => self.state = State::Open { since: now },
            (Permit::Normal, State::Closed)
                if self.threshold > 0 && self.consecutive_failures >= self.threshold =>
            {
                self.state = State::Open { since: now };
            }
            (Permit::Normal, _) => {}
        }
    }

    /// Release a call that ended without an outcome (cancelled).
    pub fn release(&mut self, permit: Permit) {
        if permit == Permit::Probe
            && let State::HalfOpen { probing: true } = self.state
        {
            self.state = State::HalfOpen { probing: false };
        }
    }
}
