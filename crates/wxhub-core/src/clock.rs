//! Local wall-clock resolution for epoch timestamps

use chrono::{Datelike, FixedOffset, Local, NaiveDateTime, Offset, TimeZone};

/// How epoch seconds map onto station-local time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LocalClock {
    /// The host's configured time zone
    #[default]
    System,
    /// A fixed offset with no daylight saving
    Fixed(FixedOffset),
}

impl LocalClock {
    pub fn from_offset_minutes(minutes: i32) -> Option<Self> {
        FixedOffset::east_opt(minutes * 60).map(LocalClock::Fixed)
    }

    /// Current station-local time, truncated to whole seconds
    pub fn now(&self) -> NaiveDateTime {
        let epoch = chrono::Utc::now().timestamp();
        self.from_epoch(epoch)
            .unwrap_or_else(|| Local::now().naive_local())
    }

    /// Station-local time for a unix timestamp
    pub fn from_epoch(&self, epoch: i64) -> Option<NaiveDateTime> {
        match self {
            LocalClock::System => Local
                .timestamp_opt(epoch, 0)
                .single()
                .map(|dt| dt.naive_local()),
            LocalClock::Fixed(offset) => offset
                .timestamp_opt(epoch, 0)
                .single()
                .map(|dt| dt.naive_local()),
        }
    }

    /// Unix timestamp for a station-local time (earliest on ambiguity)
    pub fn to_epoch(&self, local: NaiveDateTime) -> Option<i64> {
        match self {
            LocalClock::System => Local
                .from_local_datetime(&local)
                .earliest()
                .map(|dt| dt.timestamp()),
            LocalClock::Fixed(offset) => offset
                .from_local_datetime(&local)
                .earliest()
                .map(|dt| dt.timestamp()),
        }
    }

    /// Whether daylight saving is in force at `local`.
    ///
    /// DST is inferred when the offset exceeds the smaller of the January
    /// and July offsets of the same year; fixed clocks never observe it.
    pub fn is_dst(&self, local: NaiveDateTime) -> bool {
        let LocalClock::System = self else {
            return false;
        };
        let Some(at) = Local.from_local_datetime(&local).earliest() else {
            return false;
        };
        let offset_of = |month: u32| {
            Local
                .with_ymd_and_hms(local.year(), month, 1, 12, 0, 0)
                .earliest()
                .map(|dt| dt.offset().fix().local_minus_utc())
        };
        match (offset_of(1), offset_of(7)) {
            (Some(jan), Some(jul)) => at.offset().fix().local_minus_utc() > jan.min(jul),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_fixed_clock_epoch() {
        let clock = LocalClock::from_offset_minutes(60).unwrap();
        let local = clock.from_epoch(1_749_732_293).unwrap();
        assert_eq!(
            local,
            NaiveDate::from_ymd_opt(2025, 6, 12)
                .unwrap()
                .and_hms_opt(13, 44, 53)
                .unwrap()
        );
        assert_eq!(clock.to_epoch(local), Some(1_749_732_293));
        assert!(!clock.is_dst(local));
    }
}
