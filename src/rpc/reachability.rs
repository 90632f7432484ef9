//! Inferring whether inbound traffic reaches this endpoint at all.

use std::time::{Duration, Instant};

/// Silence longer than this marks the server unreachable.
pub const REACHABILITY_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub struct Reachability {
    timeout: Duration,
    received_at_last_check: u64,
    last_change: Instant,
    reachable: bool,
}

impl Reachability {
    pub fn new(timeout: Duration, now: Instant) -> Self {
        Self {
            timeout,
            received_at_last_check: 0,
            last_change: now,
            reachable: false,
        }
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable
    }

    /// Compare the live received counter with the last snapshot.
    ///
    /// Returns `true` if the server has been silent for longer than the timeout,
    /// meaning accumulated round trip statistics are stale and should be reset.
    pub fn check(&mut self, now: Instant, received: u64) -> bool {
        if received != self.received_at_last_check {
            self.reachable = true;
            self.last_change = now;
            self.received_at_last_check = received;

            return false;
        }

        if now.saturating_duration_since(self.last_change) > self.timeout {
            self.reachable = false;
            return true;
        }

        false
    }
}
