//! Stall detection
//!
//! A turn stalls when the backend owes us an event and nothing has arrived
//! for longer than the threshold. The detector fires once per episode; the
//! next observed activity starts a new one.

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
pub struct StallDetector {
    threshold: Duration,
    last_activity: Instant,
    fired: bool,
}

impl StallDetector {
    pub fn new(threshold: Duration, now: Instant) -> Self {
        Self {
            threshold,
            last_activity: now,
            fired: false,
        }
    }

    /// Record activity and end the current episode
    pub fn observe(&mut self, now: Instant) {
        self.last_activity = now;
        self.fired = false;
    }

    /// True exactly once when a busy turn has been silent past the threshold
    pub fn check(&mut self, now: Instant, busy: bool) -> bool {
        if !busy || self.fired {
            return false;
        }
        if now.saturating_duration_since(self.last_activity) >= self.threshold {
            self.fired = true;
            return true;
        }
        false
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }
}
