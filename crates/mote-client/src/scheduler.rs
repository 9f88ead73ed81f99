//! Wake-time computation for the step loop.

use std::time::{Duration, Instant};

/// Collects pending deadlines and turns the earliest into a wait duration.
#[derive(Debug, Clone)]
pub struct WakeSchedule {
    now: Instant,
    earliest: Option<Instant>,
}

impl WakeSchedule {
    /// Empty schedule as seen at `now`.
    pub fn new(now: Instant) -> Self {
        Self { now, earliest: None }
    }

    /// Take a deadline into account.
    pub fn consider(&mut self, deadline: Option<Instant>) {
        if let Some(deadline) = deadline {
            self.earliest = Some(self.earliest.map_or(deadline, |e| e.min(deadline)));
        }
    }

    /// Time until the earliest deadline, capped at `idle` and rounded up to
    /// `granularity`. Never shorter than one granularity tick.
    pub fn wait(&self, granularity: Duration, idle: Duration) -> Duration {
        let wait = self.earliest.map_or(idle, |d| d.saturating_duration_since(self.now)).min(idle);
        round_up(wait, granularity).max(granularity)
    }
}

/// Round `duration` up to a whole multiple of `granularity`.
pub fn round_up(duration: Duration, granularity: Duration) -> Duration {
    let step = granularity.as_nanos();
    if step == 0 {
        return duration;
    }
    let rounded = duration.as_nanos().div_ceil(step) * step;
    Duration::from_nanos(u64::try_from(rounded).unwrap_or(u64::MAX))
}
