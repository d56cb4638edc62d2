//! Hour-boundary flags with exactly-once firing

use chrono::{Duration, NaiveDateTime, Timelike};
use wxhub_core::LocalClock;

/// The four resets the engine fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Boundary {
    Rollover,
    Midnight,
    NineAm,
    SnowHour,
}

impl Boundary {
    pub const ALL: [Boundary; 4] = [
        Boundary::Rollover,
        Boundary::Midnight,
        Boundary::NineAm,
        Boundary::SnowHour,
    ];

    fn index(self) -> usize {
        match self {
            Boundary::Rollover => 0,
            Boundary::Midnight => 1,
            Boundary::NineAm => 2,
            Boundary::SnowHour => 3,
        }
    }
}

/// Decides whether daylight saving is in force at a station-local time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DstRule {
    #[default]
    Never,
    Clock(LocalClock),
}

impl DstRule {
    pub fn in_effect(&self, at: NaiveDateTime) -> bool {
        match self {
            DstRule::Never => false,
            DstRule::Clock(clock) => clock.is_dst(at),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundaryConfig {
    /// Day rollover hour, 0 or 9
    pub rollover_hour: u32,
    /// Move a 9am rollover to 10am while daylight saving is in force
    pub use_10am_in_summer: bool,
    pub snow_hour: u32,
    pub dst: DstRule,
}

impl Default for BoundaryConfig {
    fn default() -> Self {
        Self {
            rollover_hour: 0,
            use_10am_in_summer: false,
            snow_hour: 9,
            dst: DstRule::Never,
        }
    }
}

impl BoundaryConfig {
    pub fn trigger_hour(&self, boundary: Boundary, at: NaiveDateTime) -> u32 {
        match boundary {
            Boundary::Rollover => {
                if self.use_10am_in_summer && self.rollover_hour == 9 && self.dst.in_effect(at) {
                    10
                } else {
                    self.rollover_hour
                }
            }
            Boundary::Midnight => 0,
            Boundary::NineAm => 9,
            Boundary::SnowHour => self.snow_hour,
        }
    }
}

/// Start of the latest `hour`:00 at or before `at`
fn latest_trigger(at: NaiveDateTime, hour: u32) -> NaiveDateTime {
    let today = at.date().and_hms_opt(hour, 0, 0).unwrap_or(at);
    if today > at {
        today - Duration::days(1)
    } else {
        today
    }
}

/// Per-driver "done" flags.
///
/// A flag is set while records sit inside its trigger hour and cleared as
/// soon as a record falls outside it. A reset fires when a flag goes from
/// clear to set, or when two consecutive records straddle the trigger hour
/// with nothing inside it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BoundaryFlags {
    done: [bool; 4],
    last: Option<NaiveDateTime>,
}

impl BoundaryFlags {
    pub fn is_done(&self, boundary: Boundary) -> bool {
        self.done[boundary.index()]
    }

    /// Advance to `at` and return the boundaries to fire, in firing order
    pub fn advance(&mut self, at: NaiveDateTime, config: &BoundaryConfig) -> Vec<Boundary> {
        let mut fired = Vec::new();
        for boundary in Boundary::ALL {
            let hour = config.trigger_hour(boundary, at);
            let crossed = self
                .last
                .is_some_and(|prev| prev < latest_trigger(at, hour));
            let flag = &mut self.done[boundary.index()];
            if at.hour() == hour {
                if !*flag || crossed {
                    fired.push(boundary);
                }
                *flag = true;
            } else {
                *flag = false;
                if crossed {
                    fired.push(boundary);
                }
            }
        }
        self.last = Some(at);
        fired
    }
}
