use std::time::Duration;

/// Decides whether the user is idle from the time since their last input.
#[derive(Debug, Clone, Copy)]
pub struct IdleEvaluator {
    threshold_ms: u64,
}

impl IdleEvaluator {
    pub fn new(threshold: Duration) -> Self {
        Self {
            threshold_ms: threshold.as_millis().try_into().unwrap_or(u64::MAX),
        }
    }

    pub fn from_seconds(threshold_s: u64) -> Self {
        Self::new(Duration::from_secs(threshold_s))
    }

    pub fn is_idle(&self, idle_time_ms: u32) -> bool {
        u64::from(idle_time_ms) >= self.threshold_ms
    }
}
