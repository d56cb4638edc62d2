//! Running day accumulators

use wxhub_core::{DaySummary, Observation, WindUnit};

/// Vector sum of wind, weighted by speed
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BearingAccumulator {
    x: f64,
    y: f64,
}

impl BearingAccumulator {
    pub fn add(&mut self, direction: f64, speed: f64) {
        if speed <= 0.0 {
            return;
        }
        let rad = direction.to_radians();
        self.x += speed * rad.sin();
        self.y += speed * rad.cos();
    }

    /// Prevailing bearing in whole degrees, 1..=360; none when calm
    pub fn dominant(&self) -> Option<f64> {
        if self.x.abs() < 1e-9 && self.y.abs() < 1e-9 {
            return None;
        }
        let deg = self.x.atan2(self.y).to_degrees().round();
        Some(if deg <= 0.0 { deg + 360.0 } else { deg })
    }
}

/// Thresholds the accumulators are evaluated against, in target units
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AccumulatorConfig {
    pub wind_unit: WindUnit,
    pub heating_base: f64,
    pub cooling_base: f64,
    pub chill_threshold: f64,
    /// Month whose first rollover restarts the chill-hour season
    pub chill_season_start_month: u32,
}

impl Default for AccumulatorConfig {
    fn default() -> Self {
        Self {
            wind_unit: WindUnit::MetresPerSecond,
            heating_base: 15.5,
            cooling_base: 15.5,
            chill_threshold: 7.0,
            chill_season_start_month: 10,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DayAccumulators {
    pub temp_total: f64,
    pub temp_samples: u32,
    /// In km, miles, or nautical miles depending on the wind unit
    pub windrun: f64,
    pub bearing: BearingAccumulator,
    pub heating_degree_days: f64,
    pub cooling_degree_days: f64,
    /// Season total, not reset by the day rollover
    pub chill_hours: f64,
}

impl DayAccumulators {
    /// Fold one record spanning `interval_minutes` into the running totals
    pub fn accumulate(&mut self, obs: &Observation, interval_minutes: f64, config: &AccumulatorConfig) {
        let hours = interval_minutes.max(0.0) / 60.0;

        if let Some(temp) = obs.outdoor_temp {
            self.temp_total += temp;
            self.temp_samples += 1;

            let days = hours / 24.0;
            self.heating_degree_days += (config.heating_base - temp).max(0.0) * days;
            self.cooling_degree_days += (temp - config.cooling_base).max(0.0) * days;
            if temp < config.chill_threshold {
                self.chill_hours += hours;
            }
        }

        if let Some(speed) = obs.wind_speed {
            self.windrun += speed * hours * config.wind_unit.run_per_hour();
            if let Some(dir) = obs.wind_dir {
                self.bearing.add(dir, speed);
            }
        }
    }

    pub fn avg_temp(&self) -> Option<f64> {
        (self.temp_samples > 0).then(|| self.temp_total / f64::from(self.temp_samples))
    }

    pub fn summary(&self, rain: f64) -> DaySummary {
        DaySummary {
            avg_temp: self.avg_temp(),
            temp_samples: self.temp_samples,
            rain,
            windrun: self.windrun,
            dominant_bearing: self.bearing.dominant(),
            heating_degree_days: self.heating_degree_days,
            cooling_degree_days: self.cooling_degree_days,
            chill_hours: self.chill_hours,
        }
    }

    /// Day rollover: everything except the chill-hour season total
    pub fn reset_day(&mut self) {
        *self = Self {
            chill_hours: self.chill_hours,
            ..Self::default()
        };
    }

    pub fn reset_chill_hours(&mut self) {
        self.chill_hours = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn obs(temp: f64, speed: f64, dir: f64) -> Observation {
        let ts = NaiveDate::from_ymd_opt(2025, 1, 10)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        let mut o = Observation::new(ts);
        o.outdoor_temp = Some(temp);
        o.wind_speed = Some(speed);
        o.wind_dir = Some(dir);
        o
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_windrun_follows_wind_unit() {
        let mut acc = DayAccumulators::default();
        let ms = AccumulatorConfig::default();
        acc.accumulate(&obs(10.0, 10.0, 90.0), 60.0, &ms);
        assert!(close(acc.windrun, 36.0));

        let mut acc = DayAccumulators::default();
        let mph = AccumulatorConfig {
            wind_unit: WindUnit::MilesPerHour,
            ..ms
        };
        acc.accumulate(&obs(10.0, 10.0, 90.0), 30.0, &mph);
        assert!(close(acc.windrun, 5.0));
    }

    #[test]
    fn test_degree_days_and_chill_hours() {
        let config = AccumulatorConfig::default();
        let mut acc = DayAccumulators::default();
        for _ in 0..24 {
            acc.accumulate(&obs(5.5, 0.0, 0.0), 60.0, &config);
        }
        assert!(close(acc.heating_degree_days, 10.0));
        assert!(close(acc.cooling_degree_days, 0.0));
        assert!(close(acc.chill_hours, 24.0));
        assert_eq!(acc.avg_temp(), Some(5.5));

        acc.reset_day();
        assert_eq!(acc.temp_samples, 0);
        assert!(close(acc.chill_hours, 24.0));
        acc.reset_chill_hours();
        assert_eq!(acc.chill_hours, 0.0);
    }

    #[test]
    fn test_dominant_bearing() {
        let mut b = BearingAccumulator::default();
        assert_eq!(b.dominant(), None);
        b.add(350.0, 5.0);
        b.add(10.0, 5.0);
        assert_eq!(b.dominant(), Some(360.0));

        let mut b = BearingAccumulator::default();
        b.add(90.0, 2.0);
        b.add(180.0, 2.0);
        b.add(0.0, 0.0);
        assert_eq!(b.dominant(), Some(135.0));
    }
}
