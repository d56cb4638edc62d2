//! LaCrosse WS2300 series: BCD memory map decoding and live driver
//!
//! The console exposes no history over this interface, so the driver is
//! live-only. Every value is a separate memory read; a read that exhausts
//! its retries leaves that field absent.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::NaiveDateTime;
use tracing::{debug, info, instrument, warn};
use wxhub_core::{LocalClock, Observation, UnitSystem};

use crate::frame::{RetryPolicy, Ws2300Link};
use crate::serial::{SerialLink, SerialPortLink};
use crate::{FrameError, IngestError, IngestResult, StationDriver, UnitProfile};

pub const ADDR_INDOOR_TEMP: u16 = 0x346;
pub const ADDR_OUTDOOR_TEMP: u16 = 0x373;
pub const ADDR_DEW_POINT: u16 = 0x3CE;
pub const ADDR_INDOOR_HUMIDITY: u16 = 0x3FB;
pub const ADDR_OUTDOOR_HUMIDITY: u16 = 0x419;
pub const ADDR_WIND: u16 = 0x527;
pub const ADDR_RAIN_1H: u16 = 0x4B4;
pub const ADDR_RAIN_TOTAL: u16 = 0x4D2;
pub const ADDR_REL_PRESSURE: u16 = 0x5E2;

fn hi(b: u8) -> f64 {
    f64::from(b >> 4)
}

fn lo(b: u8) -> f64 {
    f64::from(b & 0x0F)
}

fn need(data: &[u8], n: usize) -> Option<&[u8]> {
    data.get(..n)
}

/// Temperature in °C, offset by 30 in the console's BCD encoding
pub fn decode_temperature(data: &[u8]) -> Option<f64> {
    let d = need(data, 2)?;
    Some(hi(d[1]) * 10.0 + lo(d[1]) + hi(d[0]) / 10.0 + lo(d[0]) / 100.0 - 30.0)
}

pub fn decode_humidity(data: &[u8]) -> Option<f64> {
    let d = need(data, 1)?;
    Some(hi(d[0]) * 10.0 + lo(d[0]))
}

/// Wind as (speed m/s, direction degrees); `None` when the status byte
/// flags the reading as invalid
pub fn decode_wind(data: &[u8]) -> Option<(f64, f64)> {
    let d = need(data, 3)?;
    let invalid = d[0] != 0x00 || (d[1] == 0xFF && matches!(d[2] & 0x0F, 0 | 1));
    if invalid {
        return None;
    }
    let direction = hi(d[2]) * 22.5;
    let speed = f64::from(u16::from(d[2] & 0x0F) << 8 | u16::from(d[1])) / 10.0;
    Some((speed, direction))
}

/// Rain in the last hour, mm
pub fn decode_rain_1h(data: &[u8]) -> Option<f64> {
    let d = need(data, 3)?;
    Some(
        hi(d[2]) * 100.0
            + lo(d[2]) * 10.0
            + hi(d[1])
            + lo(d[1]) / 10.0
            + hi(d[0]) / 100.0
            + lo(d[0]) / 1000.0,
    )
}

/// Total rain since the console counter was last cleared, mm
pub fn decode_rain_total(data: &[u8]) -> Option<f64> {
    let d = need(data, 3)?;
    Some(
        hi(d[2]) * 1000.0
            + lo(d[2]) * 100.0
            + hi(d[1]) * 10.0
            + lo(d[1])
            + hi(d[0]) / 10.0
            + lo(d[0]) / 100.0,
    )
}

/// Relative (sea-level) pressure, hPa
pub fn decode_pressure(data: &[u8]) -> Option<f64> {
    let d = need(data, 3)?;
    Some(lo(d[2]) * 1000.0 + hi(d[1]) * 100.0 + lo(d[1]) * 10.0 + hi(d[0]) + lo(d[0]) / 10.0)
}

/// Reads one full observation from a WS2300 console
pub struct Ws2300Station<L> {
    link: Ws2300Link<L>,
    profile: UnitProfile,
}

impl<L: SerialLink> Ws2300Station<L> {
    pub fn new(link: Ws2300Link<L>, target: UnitSystem) -> Self {
        Self {
            link,
            profile: UnitProfile::fixed(UnitSystem::metric(), target),
        }
    }

    /// One memory read; exhausted retries become `None`, I/O errors propagate
    fn read(&mut self, address: u16, length: usize) -> Result<Option<Vec<u8>>, FrameError> {
        match self.link.read(address, length) {
            Ok(data) => Ok(Some(data)),
            Err(FrameError::Io(e)) => Err(FrameError::Io(e)),
            Err(e) => {
                warn!(address = format_args!("{address:#05x}"), error = %e, "ws2300 value unavailable");
                Ok(None)
            }
        }
    }

    fn read_value(
        &mut self,
        address: u16,
        length: usize,
        decode: fn(&[u8]) -> Option<f64>,
    ) -> Result<Option<f64>, FrameError> {
        Ok(self.read(address, length)?.as_deref().and_then(decode))
    }

    pub fn read_observation(&mut self, timestamp: NaiveDateTime) -> Result<Observation, FrameError> {
        let mut obs = Observation::new(timestamp);
        let p = self.profile.clone();

        obs.indoor_temp = self
            .read_value(ADDR_INDOOR_TEMP, 2, decode_temperature)?
            .map(|v| p.temperature(v));
        obs.outdoor_temp = self
            .read_value(ADDR_OUTDOOR_TEMP, 2, decode_temperature)?
            .map(|v| p.temperature(v));
        obs.dew_point = self
            .read_value(ADDR_DEW_POINT, 2, decode_temperature)?
            .map(|v| p.temperature(v));
        obs.indoor_humidity = self.read_value(ADDR_INDOOR_HUMIDITY, 1, decode_humidity)?;
        obs.outdoor_humidity = self.read_value(ADDR_OUTDOOR_HUMIDITY, 1, decode_humidity)?;

        if let Some((speed, direction)) = self.read(ADDR_WIND, 3)?.as_deref().and_then(decode_wind) {
            obs.wind_speed = Some(p.wind(speed));
            obs.wind_dir = Some(direction);
        }

        obs.rain_rate = self
            .read_value(ADDR_RAIN_1H, 3, decode_rain_1h)?
            .map(|v| p.rain(v));
        obs.rain_counter = self
            .read_value(ADDR_RAIN_TOTAL, 3, decode_rain_total)?
            .map(|v| p.rain(v));
        obs.sea_level_pressure = self
            .read_value(ADDR_REL_PRESSURE, 3, decode_pressure)?
            .map(|v| p.pressure(v));

        Ok(obs)
    }
}

/// Connection settings for a WS2300 console
#[derive(Debug, Clone)]
pub struct Ws2300Config {
    pub port: String,
    pub baud_rate: u32,
    pub read_timeout: Duration,
    pub poll_interval: Duration,
    pub retry: RetryPolicy,
}

impl Default for Ws2300Config {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 2400,
            read_timeout: Duration::from_millis(500),
            poll_interval: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

type SharedStation = Arc<Mutex<Ws2300Station<SerialPortLink>>>;

/// Live-only driver for WS2300 consoles
pub struct Ws2300Driver {
    name: String,
    config: Ws2300Config,
    target: UnitSystem,
    clock: LocalClock,
    station: Option<SharedStation>,
    polled_once: bool,
}

impl Ws2300Driver {
    pub fn new(name: impl Into<String>, config: Ws2300Config, target: UnitSystem, clock: LocalClock) -> Self {
        Self {
            name: name.into(),
            config,
            target,
            clock,
            station: None,
            polled_once: false,
        }
    }
}

#[async_trait::async_trait]
impl StationDriver for Ws2300Driver {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self), fields(driver = %self.name))]
    async fn start(&mut self) -> IngestResult<()> {
        let config = self.config.clone();
        let target = self.target;
        let station = tokio::task::spawn_blocking(move || -> IngestResult<_> {
            let mut port = SerialPortLink::open(&config.port, config.baud_rate, config.read_timeout)?;
            // the interface is powered from RTS
            port.set_control_lines(false, true)?;
            let link = Ws2300Link::new(port, config.retry);
            Ok(Ws2300Station::new(link, target))
        })
        .await
        .map_err(|e| IngestError::DriverError(e.to_string()))??;

        info!(port = %self.config.port, "ws2300 link open");
        self.station = Some(Arc::new(Mutex::new(station)));
        Ok(())
    }

    async fn stop(&mut self) -> IngestResult<()> {
        self.station = None;
        Ok(())
    }

    async fn get_observation(&mut self) -> IngestResult<Option<Observation>> {
        let station = self
            .station
            .clone()
            .ok_or_else(|| IngestError::DriverError("driver not started".into()))?;

        if self.polled_once {
            tokio::time::sleep(self.config.poll_interval).await;
        }
        self.polled_once = true;

        let timestamp = self.clock.now();
        let obs = tokio::task::spawn_blocking(move || -> IngestResult<Observation> {
            let mut station = station
                .lock()
                .map_err(|_| IngestError::DriverError("ws2300 station lock poisoned".into()))?;
            Ok(station.read_observation(timestamp)?)
        })
        .await
        .map_err(|e| IngestError::DriverError(e.to_string()))??;

        debug!(timestamp = %obs.timestamp, "ws2300 observation");
        Ok(Some(obs))
    }

    fn is_active(&self) -> bool {
        self.station.is_some()
    }
}
