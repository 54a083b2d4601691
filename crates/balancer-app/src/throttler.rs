use std::time::Duration;

use tokio::time::Instant;

/// Debounce for relay decisions.
///
/// `trigger` returns true only once the condition has been reported for
/// longer than `min` without a pause of more than `2 * min` between reports.
#[derive(Debug, Clone)]
pub struct Throttler {
    min: Duration,
    armed_at: Option<Instant>,
    last_poke: Option<Instant>,
}

impl Throttler {
    pub fn new(min: Duration) -> Self {
        Self {
            min,
            armed_at: None,
            last_poke: None,
        }
    }

    pub fn min(&self) -> Duration {
        self.min
    }

    pub fn is_armed(&self) -> bool {
        self.armed_at.is_some()
    }

    pub fn trigger(&mut self) -> bool {
        self.trigger_at(Instant::now())
    }

    pub fn trigger_at(&mut self, now: Instant) -> bool {
        let gap_too_long = self
            .last_poke
            .map_or(true, |poke| now.saturating_duration_since(poke) > self.min * 2);

        let Some(armed_at) = self.armed_at.filter(|_| !gap_too_long) else {
            self.armed_at = Some(now);
            self.last_poke = Some(now);
            return false;
        };

        if now.saturating_duration_since(armed_at) > self.min {
            self.reset();
            return true;
        }

        self.last_poke = Some(now);
        false
    }

    pub fn reset(&mut self) {
        self.armed_at = None;
        self.last_poke = None;
    }
}
