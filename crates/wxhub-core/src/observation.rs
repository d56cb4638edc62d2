//! Canonical observation produced by every decoder

use chrono::NaiveDateTime;
use serde::de::{self, Deserializer, SeqAccess, Visitor};
use serde::ser::{SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Fixed-size array of optional sensor channels with 1-based access
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Channels<const N: usize>([Option<f64>; N]);

impl<const N: usize> Channels<N> {
    pub const COUNT: usize = N;

    /// Value for a 1-based channel, absent for out-of-range channels
    pub fn get(&self, channel: usize) -> Option<f64> {
        if channel == 0 || channel > N {
            return None;
        }
        self.0[channel - 1]
    }

    /// Set a 1-based channel; out-of-range channels are ignored
    pub fn set(&mut self, channel: usize, value: Option<f64>) {
        if channel >= 1 && channel <= N {
            self.0[channel - 1] = value;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(Option::is_none)
    }

    /// Iterate as (1-based channel, value) pairs for present channels
    pub fn present(&self) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.0
            .iter()
            .enumerate()
            .filter_map(|(i, v)| v.map(|v| (i + 1, v)))
    }

    fn fill_from(&mut self, other: &Self) {
        for (slot, theirs) in self.0.iter_mut().zip(other.0.iter()) {
            if slot.is_none() {
                *slot = *theirs;
            }
        }
    }
}

impl<const N: usize> Default for Channels<N> {
    fn default() -> Self {
        Self([None; N])
    }
}

impl<const N: usize> Serialize for Channels<N> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(N))?;
        for v in &self.0 {
            seq.serialize_element(v)?;
        }
        seq.end()
    }
}

impl<'de, const N: usize> Deserialize<'de> for Channels<N> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ChannelsVisitor<const N: usize>;

        impl<'de, const N: usize> Visitor<'de> for ChannelsVisitor<N> {
            type Value = Channels<N>;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "an array of at most {} optional numbers", N)
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let mut out = Channels::<N>::default();
                let mut i = 0;
                while let Some(v) = seq.next_element::<Option<f64>>()? {
                    if i >= N {
                        return Err(de::Error::invalid_length(i + 1, &self));
                    }
                    out.0[i] = v;
                    i += 1;
                }
                Ok(out)
            }
        }

        deserializer.deserialize_seq(ChannelsVisitor::<N>)
    }
}

/// Lightning detector readings
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Lightning {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_strike: Option<NaiveDateTime>,
}

impl Lightning {
    pub fn is_empty(&self) -> bool {
        self.count.is_none() && self.distance.is_none() && self.last_strike.is_none()
    }
}

/// Air-quality combo sensor (WH45 style)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AqiCombo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub humidity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub co2: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pm2_5: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pm10: Option<f64>,
}

impl AqiCombo {
    pub fn is_empty(&self) -> bool {
        *self == AqiCombo::default()
    }
}

/// Normalized weather record, already expressed in the target unit system
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Local time of the observation
    pub timestamp: NaiveDateTime,

    /// Minutes covered by this record, declared by the source or derived
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_interval_minutes: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outdoor_temp: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indoor_temp: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outdoor_humidity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indoor_humidity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dew_point: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wind_speed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wind_gust: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wind_dir: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wind_avg_10min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub station_pressure: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sea_level_pressure: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub solar_radiation: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uv_index: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rain_rate: Option<f64>,
    /// Monotonic rain counter (resets are tolerated downstream)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rain_counter: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rain_ytd: Option<f64>,

    #[serde(default, skip_serializing_if = "Channels::is_empty")]
    pub extra_temp: Channels<8>,
    #[serde(default, skip_serializing_if = "Channels::is_empty")]
    pub extra_humidity: Channels<8>,
    #[serde(default, skip_serializing_if = "Channels::is_empty")]
    pub leaf_wetness: Channels<8>,
    #[serde(default, skip_serializing_if = "Channels::is_empty")]
    pub soil_moisture: Channels<16>,
    #[serde(default, skip_serializing_if = "Channels::is_empty")]
    pub pm2_5: Channels<4>,
    #[serde(default, skip_serializing_if = "Channels::is_empty")]
    pub user_temp: Channels<8>,
    #[serde(default, skip_serializing_if = "Channels::is_empty")]
    pub laser_air: Channels<4>,
    #[serde(default, skip_serializing_if = "Channels::is_empty")]
    pub laser_depth: Channels<4>,

    #[serde(default, skip_serializing_if = "Lightning::is_empty")]
    pub lightning: Lightning,
    #[serde(default, skip_serializing_if = "AqiCombo::is_empty")]
    pub aqi_combo: AqiCombo,
}

fn fill<T: Copy>(slot: &mut Option<T>, other: Option<T>) {
    if slot.is_none() {
        *slot = other;
    }
}

impl Observation {
    /// An observation with every field absent
    pub fn new(timestamp: NaiveDateTime) -> Self {
        Self {
            timestamp,
            report_interval_minutes: None,
            outdoor_temp: None,
            indoor_temp: None,
            outdoor_humidity: None,
            indoor_humidity: None,
            dew_point: None,
            wind_speed: None,
            wind_gust: None,
            wind_dir: None,
            wind_avg_10min: None,
            station_pressure: None,
            sea_level_pressure: None,
            solar_radiation: None,
            uv_index: None,
            rain_rate: None,
            rain_counter: None,
            rain_ytd: None,
            extra_temp: Channels::default(),
            extra_humidity: Channels::default(),
            leaf_wetness: Channels::default(),
            soil_moisture: Channels::default(),
            pm2_5: Channels::default(),
            user_temp: Channels::default(),
            laser_air: Channels::default(),
            laser_depth: Channels::default(),
            lightning: Lightning::default(),
            aqi_combo: AqiCombo::default(),
        }
    }

    /// Fill absent fields from another observation of the same instant.
    /// Fields already present are kept.
    pub fn merge_from(&mut self, other: &Observation) {
        fill(&mut self.report_interval_minutes, other.report_interval_minutes);
        fill(&mut self.outdoor_temp, other.outdoor_temp);
        fill(&mut self.indoor_temp, other.indoor_temp);
        fill(&mut self.outdoor_humidity, other.outdoor_humidity);
        fill(&mut self.indoor_humidity, other.indoor_humidity);
        fill(&mut self.dew_point, other.dew_point);
        fill(&mut self.wind_speed, other.wind_speed);
        fill(&mut self.wind_gust, other.wind_gust);
        fill(&mut self.wind_dir, other.wind_dir);
        fill(&mut self.wind_avg_10min, other.wind_avg_10min);
        fill(&mut self.station_pressure, other.station_pressure);
        fill(&mut self.sea_level_pressure, other.sea_level_pressure);
        fill(&mut self.solar_radiation, other.solar_radiation);
        fill(&mut self.uv_index, other.uv_index);
        fill(&mut self.rain_rate, other.rain_rate);
        fill(&mut self.rain_counter, other.rain_counter);
        fill(&mut self.rain_ytd, other.rain_ytd);
        self.extra_temp.fill_from(&other.extra_temp);
        self.extra_humidity.fill_from(&other.extra_humidity);
        self.leaf_wetness.fill_from(&other.leaf_wetness);
        self.soil_moisture.fill_from(&other.soil_moisture);
        self.pm2_5.fill_from(&other.pm2_5);
        self.user_temp.fill_from(&other.user_temp);
        self.laser_air.fill_from(&other.laser_air);
        self.laser_depth.fill_from(&other.laser_depth);
        fill(&mut self.lightning.count, other.lightning.count);
        fill(&mut self.lightning.distance, other.lightning.distance);
        fill(&mut self.lightning.last_strike, other.lightning.last_strike);
        fill(&mut self.aqi_combo.temperature, other.aqi_combo.temperature);
        fill(&mut self.aqi_combo.humidity, other.aqi_combo.humidity);
        fill(&mut self.aqi_combo.co2, other.aqi_combo.co2);
        fill(&mut self.aqi_combo.pm2_5, other.aqi_combo.pm2_5);
        fill(&mut self.aqi_combo.pm10, other.aqi_combo.pm10);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ts() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 6, 12)
            .unwrap()
            .and_hms_opt(13, 44, 0)
            .unwrap()
    }

    #[test]
    fn test_channels_are_one_based() {
        let mut ch = Channels::<8>::default();
        ch.set(1, Some(21.5));
        ch.set(8, Some(3.0));
        ch.set(9, Some(99.0));
        ch.set(0, Some(99.0));
        assert_eq!(ch.get(1), Some(21.5));
        assert_eq!(ch.get(8), Some(3.0));
        assert_eq!(ch.get(0), None);
        assert_eq!(ch.get(9), None);
        assert_eq!(ch.present().collect::<Vec<_>>(), vec![(1, 21.5), (8, 3.0)]);
    }

    #[test]
    fn test_absent_is_distinct_from_zero() {
        let mut obs = Observation::new(ts());
        obs.rain_rate = Some(0.0);
        let json = serde_json::to_value(&obs).unwrap();
        assert_eq!(json["rain_rate"], serde_json::json!(0.0));
        assert!(json.get("outdoor_temp").is_none());
        assert!(json.get("extra_temp").is_none());

        let back: Observation = serde_json::from_value(json).unwrap();
        assert_eq!(back.rain_rate, Some(0.0));
        assert_eq!(back.outdoor_temp, None);
    }

    #[test]
    fn test_channels_serde() {
        let mut obs = Observation::new(ts());
        obs.soil_moisture.set(3, Some(41.0));
        let text = serde_json::to_string(&obs).unwrap();
        let back: Observation = serde_json::from_str(&text).unwrap();
        assert_eq!(back.soil_moisture.get(3), Some(41.0));
        assert_eq!(back.soil_moisture.get(1), None);

        let too_long = r#"{"timestamp":"2025-06-12T13:44:00","pm2_5":[1,2,3,4,5]}"#;
        assert!(serde_json::from_str::<Observation>(too_long).is_err());
    }

    #[test]
    fn test_merge_keeps_present_fields() {
        let mut main = Observation::new(ts());
        main.outdoor_temp = Some(20.0);
        let mut extra = Observation::new(ts());
        extra.outdoor_temp = Some(99.0);
        extra.extra_temp.set(2, Some(15.0));
        extra.lightning.count = Some(4);

        main.merge_from(&extra);
        assert_eq!(main.outdoor_temp, Some(20.0));
        assert_eq!(main.extra_temp.get(2), Some(15.0));
        assert_eq!(main.lightning.count, Some(4));
    }
}
