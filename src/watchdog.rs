/// Output-idle monitor for a connection attempt.
///
/// Tracks the time of the last output line. If no line arrives for longer
/// than `timeout`, the attempt is considered hung.
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct Watchdog {
    timeout: Duration,
    last_activity: Instant,
}

impl Watchdog {
    pub fn new(timeout: Duration) -> Self {
        Self::started_at(timeout, Instant::now())
    }

    pub fn started_at(timeout: Duration, now: Instant) -> Self {
        Self {
            timeout,
            last_activity: now,
        }
    }

    /// Record output activity.
    pub fn touch(&mut self) {
        self.touch_at(Instant::now());
    }

    pub fn touch_at(&mut self, now: Instant) {
        self.last_activity = now;
    }

    pub fn is_stale(&self) -> bool {
        self.is_stale_at(Instant::now())
    }

    /// Strictly longer than the timeout counts as stale.
    pub fn is_stale_at(&self, now: Instant) -> bool {
        self.idle_for(now) > self.timeout
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}
