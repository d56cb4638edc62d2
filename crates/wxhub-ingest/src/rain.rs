/// Per-driver running rain counter.
///
/// Sources that report per-interval amounts or a resettable daily total are
/// folded into one monotonic counter so the replay engine can derive rates
/// from counter deltas.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RainTally {
    counter: f64,
    last_total: Option<f64>,
}

impl RainTally {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a known counter value (e.g. the last persisted one)
    pub fn starting_at(counter: f64) -> Self {
        Self {
            counter,
            last_total: None,
        }
    }

    pub fn counter(&self) -> f64 {
        self.counter
    }

    /// Add rain that fell during one reporting interval
    pub fn add_interval(&mut self, amount: f64) -> f64 {
        if amount > 0.0 {
            self.counter += amount;
        }
        self.counter
    }

    /// Track a source total that may reset (daily/storm rain).
    /// A total lower than the previous one counts as a reset and the whole
    /// new total is treated as fresh rain.
    pub fn observe_total(&mut self, total: f64) -> f64 {
        let delta = match self.last_total {
            None => 0.0,
            Some(prev) if total < prev => total,
            Some(prev) => total - prev,
        };
        self.last_total = Some(total);
        self.add_interval(delta)
    }
}
