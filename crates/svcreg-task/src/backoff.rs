//! Retry interval selection for the registration loop.

use std::time::Duration;

/// Seconds to wait after the 1st, 2nd, ... consecutive failed cycle.
/// Failures past the end stay on the last rung.
pub const BACKOFF_LADDER_SECS: [u64; 9] = [1, 2, 3, 10, 20, 30, 40, 50, 60];

#[derive(Debug, Default)]
pub struct BackoffLadder {
    failures: usize,
}

impl BackoffLadder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interval before the next cycle. A successful cycle resets the
    /// ladder and waits `steady`.
    pub fn next_interval(&mut self, success: bool, steady: Duration) -> Duration {
        if success {
            self.failures = 0;
            return steady;
        }

        let rung = self.failures.min(BACKOFF_LADDER_SECS.len() - 1);
        self.failures = self.failures.saturating_add(1);
        Duration::from_secs(BACKOFF_LADDER_SECS[rung])
    }

    pub fn consecutive_failures(&self) -> usize {
        self.failures
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }
}
