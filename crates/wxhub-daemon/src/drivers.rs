//! Configured drivers to running driver instances

use std::net::SocketAddr;
use std::time::Duration;

use wxhub_config::{AppConfig, DriverConfig};
use wxhub_core::{LocalClock, UnitSystem};
use wxhub_ingest::ecowitt::{EcowittConfig, EcowittDriver};
use wxhub_ingest::frame::RetryPolicy;
use wxhub_ingest::imet::{ImetConfig, ImetDriver};
use wxhub_ingest::tempest::{TempestConfig, TempestDriver};
use wxhub_ingest::vantage::{VantageConfig, VantageDriver};
use wxhub_ingest::ws2300::{Ws2300Config, Ws2300Driver};
use wxhub_ingest::{DriverRegistry, IngestError, IngestResult, StationDriver};

/// Build one driver from its `[[drivers]]` entry
pub fn build_driver(
    config: &DriverConfig,
    target: UnitSystem,
    clock: LocalClock,
    log_interval_minutes: u32,
) -> IngestResult<Box<dyn StationDriver>> {
    let driver: Box<dyn StationDriver> = match config {
        DriverConfig::Vantage(c) => Box::new(VantageDriver::new(
            c.name.clone(),
            VantageConfig {
                port: c.port.clone(),
                baud_rate: c.baud_rate,
                read_timeout: Duration::from_millis(c.read_timeout_ms),
                poll_interval: Duration::from_secs(c.poll_interval_secs),
                archive_interval_minutes: c.archive_interval_minutes,
                collector: c.rain_collector,
                page_retries: c.page_retries,
                ..VantageConfig::default()
            },
            target,
            clock,
        )),
        DriverConfig::Ws2300(c) => Box::new(Ws2300Driver::new(
            c.name.clone(),
            Ws2300Config {
                port: c.port.clone(),
                baud_rate: c.baud_rate,
                read_timeout: Duration::from_millis(c.read_timeout_ms),
                poll_interval: Duration::from_secs(c.poll_interval_secs),
                retry: RetryPolicy {
                    max_attempts: c.max_attempts,
                    ..RetryPolicy::default()
                },
            },
            target,
            clock,
        )),
        DriverConfig::Imet(c) => Box::new(ImetDriver::new(
            c.name.clone(),
            ImetConfig {
                port: c.port.clone(),
                baud_rate: c.baud_rate,
                read_timeout: Duration::from_millis(c.read_timeout_ms),
                poll_interval: Duration::from_secs(c.poll_interval_secs),
                attempts: c.attempts,
                batch_size: c.batch_size,
            },
            target,
        )),
        DriverConfig::EcowittCsv(c) | DriverConfig::EcowittHttp(c) => Box::new(EcowittDriver::new(
            c.name.clone(),
            EcowittConfig {
                log_dir: c.log_dir.clone(),
                host: c.host.clone(),
                poll_interval: Duration::from_secs(c.poll_interval_secs),
                http_timeout: Duration::from_secs(c.http_timeout_secs),
                log_interval_minutes,
            },
            target,
            clock,
        )),
        DriverConfig::Tempest(c) => {
            let bind: SocketAddr = c
                .bind
                .parse()
                .map_err(|e| IngestError::DriverError(format!("invalid bind {}: {e}", c.bind)))?;
            let defaults = TempestConfig::default();
            Box::new(TempestDriver::new(
                c.name.clone(),
                TempestConfig {
                    bind,
                    recv_timeout: Duration::from_secs(c.recv_timeout_secs),
                    device_id: c.device_id,
                    token: c.token.clone(),
                    rest_base: c.rest_base.clone().unwrap_or(defaults.rest_base),
                    http_timeout: Duration::from_secs(c.http_timeout_secs),
                    backfill_days: c.backfill_days,
                },
                target,
                clock,
            ))
        }
    };
    Ok(driver)
}

/// One registry slot per `[[drivers]]` entry, labelled with its kind
pub fn registry(config: &AppConfig) -> anyhow::Result<DriverRegistry> {
    let clock = config.station.clock()?;
    let target = config.station.units;
    let interval = config.station.log_interval_minutes;

    let mut registry = DriverRegistry::new();
    for driver in &config.drivers {
        let entry = driver.clone();
        registry.register(
            driver.name(),
            driver.kind(),
            Box::new(move || build_driver(&entry, target, clock, interval)),
        )?;
    }
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn builds_every_configured_kind() {
        let config = AppConfig::from_toml(
            r#"
[[drivers]]
kind = "vantage"
name = "roof"

[[drivers]]
kind = "ws2300"
name = "shed"

[[drivers]]
kind = "imet"
name = "mast"

[[drivers]]
kind = "ecowitt_csv"
name = "logs"
log_dir = "/tmp/ecowitt"

[[drivers]]
kind = "ecowitt_http"
name = "gw"
host = "192.168.1.50"

[[drivers]]
kind = "tempest"
name = "yard"
bind = "127.0.0.1:0"
"#,
        )
        .unwrap();

        let registry = registry(&config).unwrap();
        let listed: Vec<_> = registry.drivers().collect();
        assert_eq!(
            listed,
            vec![
                ("roof", "vantage"),
                ("shed", "ws2300"),
                ("mast", "imet"),
                ("logs", "ecowitt_csv"),
                ("gw", "ecowitt_http"),
                ("yard", "tempest"),
            ]
        );

        for (name, _) in listed {
            let driver = registry.create(name).unwrap();
            assert_eq!(driver.name(), name);
            assert!(!driver.is_active());
        }
    }
}
