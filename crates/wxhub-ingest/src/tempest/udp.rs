//! WeatherFlow Tempest UDP broadcast messages (port 50222)

use chrono::NaiveDateTime;
use serde::Deserialize;
use tracing::debug;
use wxhub_core::{LocalClock, Observation, UnitSystem};

use crate::{DecodeError, RainTally, UnitProfile};

/// Slots in an `obs_st` observation row
pub const OBS_ST_LEN: usize = 18;

mod slot {
    pub const EPOCH: usize = 0;
    pub const WIND_AVG: usize = 2;
    pub const WIND_GUST: usize = 3;
    pub const WIND_DIR: usize = 4;
    pub const PRESSURE: usize = 6;
    pub const TEMP: usize = 7;
    pub const HUMIDITY: usize = 8;
    pub const UV: usize = 10;
    pub const SOLAR: usize = 11;
    pub const RAIN: usize = 12;
    pub const STRIKE_DISTANCE: usize = 14;
    pub const STRIKE_COUNT: usize = 15;
    pub const INTERVAL: usize = 17;
}

/// Raw message, discriminated by its `type` field
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    #[serde(rename = "rapid_wind")]
    RapidWind { ob: Vec<Option<f64>> },
    #[serde(rename = "hub_status")]
    HubStatus {
        #[serde(default)]
        serial_number: Option<String>,
        #[serde(default)]
        uptime: Option<u64>,
    },
    #[serde(rename = "obs_st")]
    ObsSt { obs: Vec<Vec<Option<f64>>> },
    #[serde(rename = "device_status")]
    DeviceStatus {
        #[serde(default)]
        serial_number: Option<String>,
        #[serde(default)]
        voltage: Option<f64>,
        #[serde(default)]
        sensor_status: Option<u64>,
    },
    #[serde(rename = "evt_precip")]
    Precip { evt: Vec<f64> },
    #[serde(rename = "evt_strike")]
    Strike { evt: Vec<f64> },
    #[serde(other)]
    Unknown,
}

/// What a datagram meant for this station
#[derive(Debug, Clone, PartialEq)]
pub enum TempestEvent {
    Observation(Observation),
    RapidWind {
        timestamp: NaiveDateTime,
        speed: f64,
        direction: f64,
    },
    RainStarted(NaiveDateTime),
    Strike {
        timestamp: NaiveDateTime,
        distance: f64,
    },
    Status,
    /// Unknown type or a payload too short to use
    Ignored,
}

/// Stateful decoder shared by the UDP and REST paths
#[derive(Debug, Clone)]
pub struct TempestDecoder {
    profile: UnitProfile,
    clock: LocalClock,
    rain: RainTally,
    last_strike: Option<NaiveDateTime>,
}

impl TempestDecoder {
    pub fn new(target: UnitSystem, clock: LocalClock) -> Self {
        Self {
            profile: UnitProfile::fixed(UnitSystem::metric(), target),
            clock,
            rain: RainTally::new(),
            last_strike: None,
        }
    }

    fn local(&self, epoch: f64) -> Result<NaiveDateTime, DecodeError> {
        self.clock
            .from_epoch(epoch as i64)
            .ok_or_else(|| DecodeError::Timestamp(epoch.to_string()))
    }

    /// Build an observation from a full-length `obs_st` row
    pub(crate) fn observation_from_row(&mut self, row: &[Option<f64>]) -> Result<Observation, DecodeError> {
        if row.len() < OBS_ST_LEN {
            return Err(DecodeError::ShortBuffer {
                need: OBS_ST_LEN,
                got: row.len(),
            });
        }
        let epoch = row[slot::EPOCH].ok_or_else(|| DecodeError::Timestamp("null epoch".into()))?;
        let p = &self.profile;
        let mut obs = Observation::new(self.local(epoch)?);

        obs.wind_speed = row[slot::WIND_AVG].map(|v| p.wind(v));
        obs.wind_gust = row[slot::WIND_GUST].map(|v| p.wind(v));
        obs.wind_dir = row[slot::WIND_DIR];
        obs.station_pressure = row[slot::PRESSURE].map(|v| p.pressure(v));
        obs.outdoor_temp = row[slot::TEMP].map(|v| p.temperature(v));
        obs.outdoor_humidity = row[slot::HUMIDITY];
        obs.uv_index = row[slot::UV];
        obs.solar_radiation = row[slot::SOLAR].map(|v| p.solar(v));
        obs.report_interval_minutes = row[slot::INTERVAL].map(|v| v as u32);

        if let Some(rain) = row[slot::RAIN] {
            let rain = p.rain(rain);
            obs.rain_counter = Some(self.rain.add_interval(rain));
        }

        let strikes = row[slot::STRIKE_COUNT].map(|v| v as u32);
        obs.lightning.count = strikes;
        if strikes.unwrap_or(0) > 0 {
            obs.lightning.distance = row[slot::STRIKE_DISTANCE].map(|v| p.lightning(v));
        }
        obs.lightning.last_strike = self.last_strike;
        Ok(obs)
    }

    pub fn decode(&mut self, datagram: &[u8]) -> Result<TempestEvent, DecodeError> {
        let message: Message = serde_json::from_slice(datagram)?;
        let event = match message {
            Message::ObsSt { obs } => match obs.first() {
                Some(row) if row.len() >= OBS_ST_LEN => {
                    TempestEvent::Observation(self.observation_from_row(row)?)
                }
                _ => {
                    debug!(rows = obs.len(), "dropping short obs_st payload");
                    TempestEvent::Ignored
                }
            },
            Message::RapidWind { ob } => match ob.as_slice() {
                [Some(epoch), Some(speed), Some(direction), ..] => TempestEvent::RapidWind {
                    timestamp: self.local(*epoch)?,
                    speed: self.profile.wind(*speed),
                    direction: *direction,
                },
                _ => {
                    debug!(len = ob.len(), "dropping short rapid_wind payload");
                    TempestEvent::Ignored
                }
            },
            Message::Strike { evt } => match evt.as_slice() {
                [epoch, distance, ..] => {
                    let timestamp = self.local(*epoch)?;
                    self.last_strike = Some(timestamp);
                    TempestEvent::Strike {
                        timestamp,
                        distance: self.profile.lightning(*distance),
                    }
                }
                _ => {
                    debug!(len = evt.len(), "dropping short evt_strike payload");
                    TempestEvent::Ignored
                }
            },
            Message::Precip { evt } => match evt.first() {
                Some(epoch) => TempestEvent::RainStarted(self.local(*epoch)?),
                None => {
                    debug!("dropping empty evt_precip payload");
                    TempestEvent::Ignored
                }
            },
            Message::HubStatus { serial_number, uptime } => {
                debug!(?serial_number, ?uptime, "hub status");
                TempestEvent::Status
            }
            Message::DeviceStatus {
                serial_number,
                voltage,
                sensor_status,
            } => {
                debug!(?serial_number, ?voltage, ?sensor_status, "device status");
                TempestEvent::Status
            }
            Message::Unknown => TempestEvent::Ignored,
        };
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn decoder() -> TempestDecoder {
        TempestDecoder::new(UnitSystem::metric(), LocalClock::from_offset_minutes(60).unwrap())
    }

    fn local(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 6, 12)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    const OBS: &str = r#"{"serial_number":"ST-00000512","type":"obs_st","hub_sn":"HB-00013030",
        "obs":[[1749732293,0.18,0.22,0.27,144,6,1017.57,22.37,50.26,328,0.03,3,0.5,1,12,2,2.410,1]],
        "firmware_revision":129}"#;

    #[test]
    fn test_obs_st() {
        let mut d = decoder();
        let TempestEvent::Observation(obs) = d.decode(OBS.as_bytes()).unwrap() else {
            panic!("expected observation");
        };
        assert_eq!(obs.timestamp, local(13, 44, 53));
        assert_eq!(obs.wind_speed, Some(0.22));
        assert_eq!(obs.wind_dir, Some(144.0));
        assert_eq!(obs.station_pressure, Some(1017.57));
        assert_eq!(obs.outdoor_temp, Some(22.37));
        assert_eq!(obs.rain_counter, Some(0.5));
        assert_eq!(obs.lightning.count, Some(2));
        assert_eq!(obs.lightning.distance, Some(12.0));
        assert_eq!(obs.report_interval_minutes, Some(1));

        // per-minute rain accumulates
        let TempestEvent::Observation(obs) = d.decode(OBS.as_bytes()).unwrap() else {
            panic!("expected observation");
        };
        assert_eq!(obs.rain_counter, Some(1.0));
    }

    #[test]
    fn test_strike_then_observation_carries_last_strike() {
        let mut d = decoder();
        let strike = r#"{"type":"evt_strike","evt":[1749732000,27,3848]}"#;
        assert_eq!(
            d.decode(strike.as_bytes()).unwrap(),
            TempestEvent::Strike {
                timestamp: local(13, 40, 0),
                distance: 27.0
            }
        );
        let TempestEvent::Observation(obs) = d.decode(OBS.as_bytes()).unwrap() else {
            panic!("expected observation");
        };
        assert_eq!(obs.lightning.last_strike, Some(local(13, 40, 0)));
    }

    #[test]
    fn test_other_messages() {
        let mut d = decoder();
        let wind = r#"{"type":"rapid_wind","ob":[1749732293,2.5,270]}"#;
        assert!(matches!(
            d.decode(wind.as_bytes()).unwrap(),
            TempestEvent::RapidWind { speed, direction, .. } if speed == 2.5 && direction == 270.0
        ));
        let hub = r#"{"type":"hub_status","serial_number":"HB-1","uptime":10,"rssi":-62}"#;
        assert_eq!(d.decode(hub.as_bytes()).unwrap(), TempestEvent::Status);
        let precip = r#"{"type":"evt_precip","evt":[1749732293]}"#;
        assert_eq!(
            d.decode(precip.as_bytes()).unwrap(),
            TempestEvent::RainStarted(local(13, 44, 53))
        );
    }

    #[test]
    fn test_unknown_and_short_payloads_ignored() {
        let mut d = decoder();
        let unknown = r#"{"type":"light_debug","ob":[1]}"#;
        assert_eq!(d.decode(unknown.as_bytes()).unwrap(), TempestEvent::Ignored);
        let short = r#"{"type":"obs_st","obs":[[1749732293,0.1,0.2]]}"#;
        assert_eq!(d.decode(short.as_bytes()).unwrap(), TempestEvent::Ignored);
        let short_wind = r#"{"type":"rapid_wind","ob":[1749732293]}"#;
        assert_eq!(d.decode(short_wind.as_bytes()).unwrap(), TempestEvent::Ignored);
        assert!(d.decode(b"not json").is_err());
    }
}
