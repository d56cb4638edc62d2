//! Per-driver replay engine

use std::sync::Arc;

use chrono::{Datelike, NaiveDateTime};
use tracing::{debug, info, instrument, warn};
use wxhub_core::{EnrichedObservation, Observation, ObservationSink};

use crate::{
    AccumulatorConfig, Boundary, BoundaryConfig, BoundaryFlags, DayAccumulators, RainRateTracker,
    ReplayError, ReplayResult,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Backfilling,
    Live,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReplayConfig {
    pub boundaries: BoundaryConfig,
    pub accumulators: AccumulatorConfig,
    /// Interval assumed when a record neither declares one nor follows another
    pub default_interval_minutes: u32,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            boundaries: BoundaryConfig::default(),
            accumulators: AccumulatorConfig::default(),
            default_interval_minutes: 5,
        }
    }
}

/// Counts for one `replay` call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub published: usize,
    pub skipped: usize,
    pub day_resets: usize,
    pub other_resets: usize,
}

/// Monotonic rain counter values captured at each reset
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct RainBases {
    day: Option<f64>,
    midnight: Option<f64>,
    nine_am: Option<f64>,
}

fn since(base: Option<f64>, counter: Option<f64>) -> f64 {
    match (base, counter) {
        (Some(base), Some(counter)) => (counter - base).max(0.0),
        _ => 0.0,
    }
}

/// Per-step state restored when a sink call fails
#[derive(Clone)]
struct Checkpoint {
    flags: BoundaryFlags,
    day: DayAccumulators,
    rain: RainRateTracker,
    rain_bases: RainBases,
    snow_base: Option<f64>,
    last: Option<NaiveDateTime>,
}

/// Day-boundary state machine for one station driver.
///
/// Records must arrive in ascending timestamp order. A record at or before
/// the last processed timestamp is rejected, which also makes replaying the
/// same backlog twice a no-op.
pub struct ReplayEngine {
    station: String,
    config: ReplayConfig,
    sink: Arc<dyn ObservationSink>,
    state: EngineState,
    flags: BoundaryFlags,
    day: DayAccumulators,
    rain: RainRateTracker,
    rain_bases: RainBases,
    snow_base: Option<f64>,
    last: Option<NaiveDateTime>,
}

impl ReplayEngine {
    pub fn new(station: impl Into<String>, config: ReplayConfig, sink: Arc<dyn ObservationSink>) -> Self {
        Self {
            station: station.into(),
            config,
            sink,
            state: EngineState::Idle,
            flags: BoundaryFlags::default(),
            day: DayAccumulators::default(),
            rain: RainRateTracker::new(),
            rain_bases: RainBases::default(),
            snow_base: None,
            last: None,
        }
    }

    pub fn station(&self) -> &str {
        &self.station
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn accumulators(&self) -> &DayAccumulators {
        &self.day
    }

    pub fn flags(&self) -> &BoundaryFlags {
        &self.flags
    }

    pub fn last_timestamp(&self) -> Option<NaiveDateTime> {
        self.last
    }

    fn transition(&mut self, from: EngineState, to: EngineState) -> ReplayResult<()> {
        if self.state != from {
            return Err(ReplayError::InvalidTransition { from: self.state, to });
        }
        debug!(station = %self.station, ?from, ?to, "engine state change");
        self.state = to;
        Ok(())
    }

    /// Idle -> Backfilling
    pub fn begin_backfill(&mut self) -> ReplayResult<()> {
        self.transition(EngineState::Idle, EngineState::Backfilling)
    }

    /// Backfilling -> Live, once the backlog is exhausted or paging stopped
    pub fn go_live(&mut self) -> ReplayResult<()> {
        self.transition(EngineState::Backfilling, EngineState::Live)
    }

    /// Replay an ordered backlog. Rejected records are logged and skipped;
    /// only sink failures abort.
    #[instrument(skip(self, backlog), fields(station = %self.station, records = backlog.len()))]
    pub async fn replay(&mut self, backlog: Vec<Observation>) -> ReplayResult<ReplayStats> {
        if self.state != EngineState::Backfilling {
            return Err(ReplayError::NotRunning(self.state));
        }
        let mut stats = ReplayStats::default();
        for obs in backlog {
            match self.step_counted(obs, &mut stats).await {
                Ok(_) => stats.published += 1,
                Err(e) if e.is_record_error() => {
                    warn!(error = %e, "skipping backlog record");
                    stats.skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }
        info!(
            published = stats.published,
            skipped = stats.skipped,
            day_resets = stats.day_resets,
            "backlog replayed"
        );
        Ok(stats)
    }

    /// One record through the full step
    pub async fn step(&mut self, obs: Observation) -> ReplayResult<EnrichedObservation> {
        let mut stats = ReplayStats::default();
        self.step_counted(obs, &mut stats).await
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            flags: self.flags.clone(),
            day: self.day.clone(),
            rain: self.rain.clone(),
            rain_bases: self.rain_bases,
            snow_base: self.snow_base,
            last: self.last,
        }
    }

    fn restore(&mut self, checkpoint: Checkpoint) {
        self.flags = checkpoint.flags;
        self.day = checkpoint.day;
        self.rain = checkpoint.rain;
        self.rain_bases = checkpoint.rain_bases;
        self.snow_base = checkpoint.snow_base;
        self.last = checkpoint.last;
    }

    /// Runs the step against a checkpoint. A sink failure leaves the engine
    /// as it was before the record, so the same record can be retried and
    /// its resets are delivered again.
    async fn step_counted(&mut self, obs: Observation, stats: &mut ReplayStats) -> ReplayResult<EnrichedObservation> {
        let checkpoint = self.checkpoint();
        let mut counted = ReplayStats::default();
        match self.apply(obs, &mut counted).await {
            Ok(record) => {
                stats.day_resets += counted.day_resets;
                stats.other_resets += counted.other_resets;
                Ok(record)
            }
            Err(e) => {
                if matches!(e, ReplayError::Sink(_)) {
                    debug!(station = %self.station, "sink failed, step rolled back");
                    self.restore(checkpoint);
                }
                Err(e)
            }
        }
    }

    async fn apply(&mut self, obs: Observation, stats: &mut ReplayStats) -> ReplayResult<EnrichedObservation> {
        if self.state == EngineState::Idle {
            return Err(ReplayError::NotRunning(self.state));
        }
        let ts = obs.timestamp;
        if let Some(previous) = self.last {
            if ts == previous {
                return Err(ReplayError::Duplicate(ts));
            }
            if ts < previous {
                return Err(ReplayError::OutOfOrder { previous, got: ts });
            }
        }

        let interval = match (obs.report_interval_minutes.filter(|m| *m > 0), self.last) {
            (Some(declared), _) => f64::from(declared),
            (None, Some(previous)) => (ts - previous).num_seconds() as f64 / 60.0,
            (None, None) => f64::from(self.config.default_interval_minutes),
        };
        self.last = Some(ts);

        // rain
        let mut rate = obs.rain_rate;
        let mut counter = None;
        if let Some(raw) = obs.rain_counter {
            let step = self.rain.observe(raw, interval);
            counter = Some(step.counter);
            rate = rate.or(Some(step.rate));
            let bases = &mut self.rain_bases;
            for base in [&mut bases.day, &mut bases.midnight, &mut bases.nine_am] {
                base.get_or_insert(step.counter);
            }
        }

        self.day.accumulate(&obs, interval, &self.config.accumulators);

        let depth = obs.laser_depth.get(1);
        for boundary in self.flags.advance(ts, &self.config.boundaries) {
            self.fire(boundary, ts, counter, depth).await?;
            if boundary == Boundary::Rollover {
                stats.day_resets += 1;
            } else {
                stats.other_resets += 1;
            }
        }

        let mut observation = obs;
        observation.rain_rate = Some(rate.unwrap_or(0.0));
        observation.report_interval_minutes = Some(interval.round() as u32);
        let record = EnrichedObservation {
            station: Some(self.station.clone()),
            rain_today: since(self.rain_bases.day, counter),
            rain_since_midnight: since(self.rain_bases.midnight, counter),
            rain_since_9am: since(self.rain_bases.nine_am, counter),
            windrun_today: self.day.windrun,
            dominant_bearing: self.day.bearing.dominant(),
            heating_degree_days: self.day.heating_degree_days,
            cooling_degree_days: self.day.cooling_degree_days,
            chill_hours: self.day.chill_hours,
            avg_temp_today: self.day.avg_temp(),
            snow_24h: match (depth, self.snow_base) {
                (Some(now), Some(base)) => Some((now - base).max(0.0)),
                _ => None,
            },
            observation,
        };
        self.sink.on_observation(&record).await?;
        Ok(record)
    }

    async fn fire(
        &mut self,
        boundary: Boundary,
        ts: NaiveDateTime,
        counter: Option<f64>,
        depth: Option<f64>,
    ) -> ReplayResult<()> {
        debug!(station = %self.station, ?boundary, timestamp = %ts, "boundary reset");
        match boundary {
            Boundary::Rollover => {
                let summary = self.day.summary(since(self.rain_bases.day, counter));
                self.sink.on_day_reset(ts, &summary).await?;
                self.day.reset_day();
                if ts.day() == 1 && ts.month() == self.config.accumulators.chill_season_start_month {
                    info!(station = %self.station, "chill hour season restarted");
                    self.day.reset_chill_hours();
                }
                if counter.is_some() {
                    self.rain_bases.day = counter;
                }
            }
            Boundary::Midnight => {
                self.sink.on_midnight_reset(ts).await?;
                if counter.is_some() {
                    self.rain_bases.midnight = counter;
                }
            }
            Boundary::NineAm => {
                self.sink.on_9am_reset(ts).await?;
                if counter.is_some() {
                    self.rain_bases.nine_am = counter;
                }
            }
            Boundary::SnowHour => {
                self.sink.on_snow_hour_reset(ts).await?;
                if depth.is_some() {
                    self.snow_base = depth;
                }
            }
        }
        Ok(())
    }
}
