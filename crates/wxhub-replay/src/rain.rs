//! Rain rate from consecutive counter readings

use tracing::debug;

/// Result of feeding one counter reading
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RainStep {
    /// Rain since the previous reading, never negative
    pub delta: f64,
    /// `delta` scaled to an hourly rate
    pub rate: f64,
    /// Monotonic counter: raw readings plus every earlier reset's offset
    pub counter: f64,
}

/// Tracks a station's rain counter across readings and counter resets
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RainRateTracker {
    last_raw: Option<f64>,
    offset: f64,
}

impl RainRateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// The last monotonic counter value, if any reading has been seen
    pub fn counter(&self) -> Option<f64> {
        self.last_raw.map(|raw| raw + self.offset)
    }

    /// Feed a raw counter reading taken `interval_minutes` after the previous one.
    ///
    /// The first reading yields a zero rate. A counter that goes backwards
    /// also yields zero and rebases, so later deltas continue from the new
    /// raw value.
    pub fn observe(&mut self, raw: f64, interval_minutes: f64) -> RainStep {
        let delta = match self.last_raw {
            None => 0.0,
            Some(prev) if raw < prev => {
                debug!(previous = prev, current = raw, "rain counter went backwards, rebasing");
                self.offset += prev - raw;
                0.0
            }
            Some(prev) => raw - prev,
        };
        self.last_raw = Some(raw);

        let rate = if interval_minutes > 0.0 {
            delta * 60.0 / interval_minutes
        } else {
            0.0
        };
        RainStep {
            delta,
            rate,
            counter: raw + self.offset,
        }
    }
}
