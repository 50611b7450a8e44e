//! Fixed-window admission counter.

use std::time::Duration;

use tokio::time::Instant;

use crate::config::RateLimitSettings;

/// Counts admissions in a fixed window that starts at the first admitted
/// request. A limit of zero disables the check.
#[derive(Debug)]
pub struct FixedWindow {
    limit: u32,
    window: Duration,
    started: Option<Instant>,
    count: u32,
}

impl FixedWindow {
    pub fn new(settings: &RateLimitSettings) -> Self {
        Self {
            limit: settings.requests_per_window,
            window: settings.window(),
            started: None,
            count: 0,
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Admissions counted in the window that is current at `now`.
    pub fn used(&self, now: Instant) -> u32 {
        match self.started {
            Some(start) if now < start + self.window => self.count,
            _ => 0,
        }
    }

    /// Check whether one more admission fits. On rejection, returns the time
    /// until the window resets. Does not consume budget.
    pub fn check(&self, now: Instant) -> Result<(), Duration> {
        if self.limit == 0 {
            return Ok(());
        }
        match self.started {
            Some(start) if now < start + self.window && self.count >= self.limit => {
                Err(start + self.window - now)
            }
            _ => Ok(()),
        }
    }

    /// Consume one admission. Call only after a successful [`check`](Self::check).
    pub fn commit(&mut self, now: Instant) {
        if self.limit == 0 {
            return;
        }
        match self.started {
            Some(start) if now < start + self.window => self.count += 1,
            _ => {
                self.started = Some(now);
                self.count = 1;
            }
        }
    }
}
