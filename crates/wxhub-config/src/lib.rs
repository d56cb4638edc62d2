//! TOML configuration for the wxhub daemon

use chrono::NaiveDateTime;
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use wxhub_core::{LocalClock, UnitSystem};
use wxhub_ingest::vantage::RainCollector;

pub const CONFIG_ENV: &str = "WXHUB_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "wxhub.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// `[station]`: target units and day-boundary settings
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct StationConfig {
    #[serde(flatten)]
    pub units: UnitSystem,
    pub rollover_hour: u32,
    pub use_10am_in_summer: bool,
    pub snow_depth_hour: u32,
    pub chill_hour_threshold: f64,
    pub chill_hour_season_start: u32,
    pub heating_base: f64,
    pub cooling_base: f64,
    pub log_interval_minutes: u32,
    /// Resume point for every driver's backfill
    pub last_update: Option<NaiveDateTime>,
    /// Fixed UTC offset; the host zone is used when unset
    pub utc_offset_minutes: Option<i32>,
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            units: UnitSystem::metric(),
            rollover_hour: 0,
            use_10am_in_summer: false,
            snow_depth_hour: 9,
            chill_hour_threshold: 7.0,
            chill_hour_season_start: 10,
            heating_base: 15.5,
            cooling_base: 15.5,
            log_interval_minutes: 5,
            last_update: None,
            utc_offset_minutes: None,
        }
    }
}

impl StationConfig {
    pub fn clock(&self) -> ConfigResult<LocalClock> {
        match self.utc_offset_minutes {
            None => Ok(LocalClock::System),
            Some(minutes) => LocalClock::from_offset_minutes(minutes)
                .ok_or_else(|| ConfigError::Invalid(format!("utc_offset_minutes {minutes} out of range"))),
        }
    }
}

/// `[sink]`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    pub dir: PathBuf,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data"),
        }
    }
}

/// `[daemon]`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Run one driver's backfill at a time
    pub serialize_backfill: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            serialize_backfill: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct VantageSection {
    pub name: String,
    pub port: String,
    pub baud_rate: u32,
    pub read_timeout_ms: u64,
    pub poll_interval_secs: u64,
    pub archive_interval_minutes: u32,
    pub rain_collector: RainCollector,
    pub page_retries: u32,
}

impl Default for VantageSection {
    fn default() -> Self {
        Self {
            name: "vantage".into(),
            port: "/dev/ttyUSB0".into(),
            baud_rate: 19200,
            read_timeout_ms: 1200,
            poll_interval_secs: 10,
            archive_interval_minutes: 5,
            rain_collector: RainCollector::default(),
            page_retries: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Ws2300Section {
    pub name: String,
    pub port: String,
    pub baud_rate: u32,
    pub read_timeout_ms: u64,
    pub poll_interval_secs: u64,
    pub max_attempts: u32,
}

impl Default for Ws2300Section {
    fn default() -> Self {
        Self {
            name: "ws2300".into(),
            port: "/dev/ttyUSB0".into(),
            baud_rate: 2400,
            read_timeout_ms: 500,
            poll_interval_secs: 30,
            max_attempts: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ImetSection {
    pub name: String,
    pub port: String,
    pub baud_rate: u32,
    pub read_timeout_ms: u64,
    pub poll_interval_secs: u64,
    pub attempts: u32,
    pub batch_size: u32,
}

impl Default for ImetSection {
    fn default() -> Self {
        Self {
            name: "imet".into(),
            port: "/dev/ttyUSB0".into(),
            baud_rate: 19200,
            read_timeout_ms: 1000,
            poll_interval_secs: 10,
            attempts: 10,
            batch_size: 50,
        }
    }
}

/// Shared by `ecowitt_csv` and `ecowitt_http`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EcowittSection {
    pub name: String,
    pub log_dir: Option<PathBuf>,
    pub host: Option<String>,
    pub poll_interval_secs: u64,
    pub http_timeout_secs: u64,
}

impl Default for EcowittSection {
    fn default() -> Self {
        Self {
            name: "ecowitt".into(),
            log_dir: None,
            host: None,
            poll_interval_secs: 30,
            http_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TempestSection {
    pub name: String,
    pub bind: String,
    pub recv_timeout_secs: u64,
    pub device_id: Option<u64>,
    pub token: Option<String>,
    pub rest_base: Option<String>,
    pub http_timeout_secs: u64,
    pub backfill_days: u32,
}

impl Default for TempestSection {
    fn default() -> Self {
        Self {
            name: "tempest".into(),
            bind: "0.0.0.0:50222".into(),
            recv_timeout_secs: 5,
            device_id: None,
            token: None,
            rest_base: None,
            http_timeout_secs: 30,
            backfill_days: 1,
        }
    }
}

/// One `[[drivers]]` entry, selected by `kind`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DriverConfig {
    Vantage(VantageSection),
    Ws2300(Ws2300Section),
    Imet(ImetSection),
    EcowittCsv(EcowittSection),
    EcowittHttp(EcowittSection),
    Tempest(TempestSection),
}

impl DriverConfig {
    pub fn name(&self) -> &str {
        match self {
            DriverConfig::Vantage(c) => &c.name,
            DriverConfig::Ws2300(c) => &c.name,
            DriverConfig::Imet(c) => &c.name,
            DriverConfig::EcowittCsv(c) | DriverConfig::EcowittHttp(c) => &c.name,
            DriverConfig::Tempest(c) => &c.name,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DriverConfig::Vantage(_) => "vantage",
            DriverConfig::Ws2300(_) => "ws2300",
            DriverConfig::Imet(_) => "imet",
            DriverConfig::EcowittCsv(_) => "ecowitt_csv",
            DriverConfig::EcowittHttp(_) => "ecowitt_http",
            DriverConfig::Tempest(_) => "tempest",
        }
    }

    fn poll_interval_secs(&self) -> u64 {
        match self {
            DriverConfig::Vantage(c) => c.poll_interval_secs,
            DriverConfig::Ws2300(c) => c.poll_interval_secs,
            DriverConfig::Imet(c) => c.poll_interval_secs,
            DriverConfig::EcowittCsv(c) | DriverConfig::EcowittHttp(c) => c.poll_interval_secs,
            DriverConfig::Tempest(c) => c.recv_timeout_secs,
        }
    }

    fn validate(&self) -> ConfigResult<()> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(format!("driver {}: {msg}", self.name())));
        if self.name().trim().is_empty() {
            return Err(ConfigError::Invalid(format!("{} driver has an empty name", self.kind())));
        }
        if self.poll_interval_secs() == 0 {
            return invalid("poll interval must be greater than zero");
        }
        match self {
            DriverConfig::EcowittCsv(c) if c.log_dir.is_none() => invalid("ecowitt_csv needs log_dir"),
            DriverConfig::EcowittHttp(c) if c.host.is_none() => invalid("ecowitt_http needs host"),
            DriverConfig::Tempest(c) if c.device_id.is_some() != c.token.is_some() => {
                invalid("REST history needs both device_id and token")
            }
            DriverConfig::Tempest(c) if c.bind.parse::<std::net::SocketAddr>().is_err() => {
                invalid("bind is not a socket address")
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub station: StationConfig,
    pub sink: SinkConfig,
    pub daemon: DaemonConfig,
    pub drivers: Vec<DriverConfig>,
}

impl AppConfig {
    /// Load from the path in `WXHUB_CONFIG` (default `wxhub.toml`),
    /// falling back to defaults when the file does not exist
    pub fn load() -> ConfigResult<Self> {
        let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        if Path::new(&path).exists() {
            Self::from_path(&path)
        } else {
            tracing::info!(path = %path, "no configuration file, using defaults");
            Ok(Self::default())
        }
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let s = fs::read_to_string(path)?;
        Self::from_toml(&s)
    }

    pub fn from_toml(s: &str) -> ConfigResult<Self> {
        let cfg = toml::from_str::<AppConfig>(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let station = &self.station;
        if station.rollover_hour != 0 && station.rollover_hour != 9 {
            return Err(ConfigError::Invalid(format!(
                "rollover_hour must be 0 or 9, got {}",
                station.rollover_hour
            )));
        }
        if station.snow_depth_hour > 23 {
            return Err(ConfigError::Invalid(format!(
                "snow_depth_hour must be in 0..=23, got {}",
                station.snow_depth_hour
            )));
        }
        if !(1..=12).contains(&station.chill_hour_season_start) {
            return Err(ConfigError::Invalid(format!(
                "chill_hour_season_start must be a month, got {}",
                station.chill_hour_season_start
            )));
        }
        if station.log_interval_minutes == 0 {
            return Err(ConfigError::Invalid("log_interval_minutes must be greater than zero".into()));
        }
        station.clock()?;

        let mut names = HashSet::new();
        for driver in &self.drivers {
            driver.validate()?;
            if !names.insert(driver.name()) {
                return Err(ConfigError::Invalid(format!("duplicate driver name {}", driver.name())));
            }
        }
        Ok(())
    }
}
