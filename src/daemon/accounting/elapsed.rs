use std::time::Duration;

use tokio::time::Instant;

/// Converts monotonic clock readings into whole elapsed seconds. The sub-second remainder is
/// carried into the next reading so nothing is lost over many ticks.
#[derive(Debug, Clone)]
pub struct ElapsedSeconds {
    last: Instant,
    carry: Duration,
}

impl ElapsedSeconds {
    pub fn new(now: Instant) -> Self {
        Self {
            last: now,
            carry: Duration::ZERO,
        }
    }

    /// Whole seconds since the previous call. A clock going backwards counts as zero.
    pub fn advance(&mut self, now: Instant) -> u64 {
        let total = now.saturating_duration_since(self.last) + self.carry;
        self.last = now.max(self.last);
        let whole = total.as_secs();
        self.carry = total - Duration::from_secs(whole);
        whole
    }

    /// Forgets everything measured so far.
    pub fn reset(&mut self, now: Instant) {
        self.last = now;
        self.carry = Duration::ZERO;
    }
}
