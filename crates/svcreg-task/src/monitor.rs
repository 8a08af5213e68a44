//! Scheduler cycle timing.

use std::time::Duration;

use tokio::time::Instant;
use tracing::warn;

/// Slack beyond the planned sleep before a cycle start counts as late.
pub const DELAY_TOLERANCE: Duration = Duration::from_secs(10);

/// A single cycle taking longer than this is reported.
pub const SLOW_CYCLE_THRESHOLD: Duration = Duration::from_secs(10);

/// Warns when the scheduler is starved or a cycle is slow. Never changes
/// what the scheduler does.
#[derive(Debug, Default)]
pub struct ServiceCenterTaskMonitor {
    last_end: Option<Instant>,
    current_start: Option<Instant>,
}

impl ServiceCenterTaskMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the start of a cycle. `slept` is the interval the scheduler
    /// planned to wait since the previous cycle ended. Returns whether
    /// this cycle started late.
    pub fn begin_cycle(&mut self, slept: Duration) -> bool {
        let now = Instant::now();
        self.current_start = Some(now);

        let Some(last_end) = self.last_end else {
            return false;
        };
        let gap = now.duration_since(last_end);
        if gap > slept + DELAY_TOLERANCE {
            warn!(
                gap_ms = gap.as_millis() as u64,
                planned_ms = slept.as_millis() as u64,
                "registry task cycle delayed"
            );
            return true;
        }
        false
    }

    /// Mark the end of a cycle. Returns whether it was slow.
    pub fn end_cycle(&mut self) -> bool {
        let now = Instant::now();
        let Some(start) = self.current_start.take() else {
            return false;
        };
        self.last_end = Some(now);

        let took = now.duration_since(start);
        if took > SLOW_CYCLE_THRESHOLD {
            warn!(took_ms = took.as_millis() as u64, "registry task cycle slow");
            return true;
        }
        false
    }
}
