//! Vantage console transport: wake-up, LOOP reads and DMPAFT downloads

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::NaiveDateTime;
use tracing::{debug, info, instrument, warn};
use wxhub_core::{LocalClock, Observation, UnitSystem};

use super::packets::*;
use crate::frame::crc16_ccitt;
use crate::serial::{SerialLink, SerialPortLink};
use crate::{
    order_backlog, sleep_blocking, FrameError, IngestError, IngestResult, RainTally, StationDriver,
    UnitProfile,
};

pub const ACK: u8 = 0x06;
pub const NAK: u8 = 0x21;
pub const ESC: u8 = 0x1B;
/// Console reply when the stamp we sent failed its CRC
pub const CRC_REJECT: u8 = 0x18;
const WAKE_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
pub struct VantageConfig {
    pub port: String,
    pub baud_rate: u32,
    pub read_timeout: Duration,
    pub poll_interval: Duration,
    pub archive_interval_minutes: u32,
    pub collector: RainCollector,
    pub page_retries: u32,
    pub wake_delay: Duration,
}

impl Default for VantageConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 19200,
            read_timeout: Duration::from_millis(1200),
            poll_interval: Duration::from_secs(10),
            archive_interval_minutes: 5,
            collector: RainCollector::default(),
            page_retries: 3,
            wake_delay: Duration::from_millis(1200),
        }
    }
}

/// Blocking console session over a serial link
pub struct VantageConsole<L> {
    link: L,
    decoder: VantageDecoder,
    rain: RainTally,
    archive_interval: u32,
    page_retries: u32,
    wake_delay: Duration,
}

impl<L: SerialLink> VantageConsole<L> {
    pub fn new(link: L, config: &VantageConfig, target: UnitSystem) -> Self {
        Self {
            link,
            decoder: VantageDecoder::new(UnitProfile::fixed(UnitSystem::us(), target), config.collector),
            rain: RainTally::new(),
            archive_interval: config.archive_interval_minutes.max(1),
            page_retries: config.page_retries.max(1),
            wake_delay: config.wake_delay,
        }
    }

    /// Send LF until the console answers LF CR
    pub fn wake(&mut self) -> Result<(), FrameError> {
        for attempt in 1..=WAKE_ATTEMPTS {
            self.link.clear_input()?;
            self.link.write_all(b"\n")?;
            if let Some(reply) = self.link.read_exact_bytes(2)? {
                if reply == b"\n\r" {
                    return Ok(());
                }
            }
            debug!(attempt, "console did not wake");
            sleep_blocking(self.wake_delay);
        }
        Err(FrameError::Handshake)
    }

    fn expect_ack(&mut self) -> Result<(), FrameError> {
        match self.link.read_byte()? {
            Some(ACK) => Ok(()),
            Some(CRC_REJECT) => Err(FrameError::Crc),
            Some(actual) => Err(FrameError::AckMismatch {
                expected: ACK,
                actual,
            }),
            None => Err(FrameError::Timeout),
        }
    }

    fn command(&mut self, command: &[u8]) -> Result<(), FrameError> {
        self.link.write_all(command)?;
        self.expect_ack()
    }

    /// Read `len` bytes whose trailing CRC must check out
    fn read_packet(&mut self, len: usize) -> Result<Vec<u8>, FrameError> {
        let buf = self
            .link
            .read_exact_bytes(len)?
            .ok_or(FrameError::Timeout)?;
        if crc16_ccitt(&buf) != 0 {
            return Err(FrameError::Crc);
        }
        Ok(buf)
    }

    /// One LOOP plus one LOOP2 packet merged into a single observation
    pub fn read_live(&mut self, timestamp: NaiveDateTime) -> IngestResult<Observation> {
        self.wake()?;
        self.command(b"LOOP 1\n")?;
        let loop1 = self.read_packet(LOOP_LEN)?;
        let loop1 = self.decoder.decode_loop(&loop1, timestamp)?;

        self.command(b"LPS 2 1\n")?;
        let loop2 = self.read_packet(LOOP_LEN)?;
        let mut obs = self.decoder.decode_loop2(&loop2, timestamp)?.observation;

        obs.merge_from(&loop1.observation);
        if let Some(day_rain) = loop1.day_rain {
            obs.rain_counter = Some(self.rain.observe_total(day_rain));
        }
        Ok(obs)
    }

    fn read_page(&mut self) -> Result<Vec<u8>, FrameError> {
        for attempt in 1..=self.page_retries {
            match self.link.read_exact_bytes(ARCHIVE_PAGE_LEN)? {
                Some(page) if crc16_ccitt(&page) == 0 => {
                    self.link.write_all(&[ACK])?;
                    return Ok(page);
                }
                _ => {
                    warn!(attempt, "archive page failed, requesting resend");
                    self.link.clear_input()?;
                    self.link.write_all(&[NAK])?;
                }
            }
        }
        self.link.write_all(&[ESC])?;
        Err(FrameError::RetriesExhausted(self.page_retries))
    }

    /// Download archive records logged after `since` (everything when `None`)
    pub fn dump_after(&mut self, since: Option<NaiveDateTime>) -> IngestResult<Vec<Observation>> {
        self.wake()?;
        self.command(b"DMPAFT\n")?;

        let (date, time) = since.map(encode_timestamp).unwrap_or((0, 0));
        let mut stamp = Vec::with_capacity(6);
        stamp.extend_from_slice(&date.to_le_bytes());
        stamp.extend_from_slice(&time.to_le_bytes());
        let crc = crc16_ccitt(&stamp);
        stamp.extend_from_slice(&crc.to_be_bytes());
        self.link.write_all(&stamp)?;
        self.expect_ack()?;

        let header = self.read_packet(6)?;
        let pages = u16::from_le_bytes([header[0], header[1]]);
        let first_record = usize::from(u16::from_le_bytes([header[2], header[3]]));
        info!(pages, first_record, "archive download starting");
        self.link.write_all(&[ACK])?;

        let mut out = Vec::new();
        let mut last = since;
        for page_no in 0..pages {
            let page = self.read_page()?;
            let (_, records) = split_page(&page)?;
            for (slot, rec) in records.iter().enumerate() {
                if page_no == 0 && slot < first_record {
                    continue;
                }
                match self.decoder.decode_archive(rec) {
                    Ok(Some((mut obs, rain))) => {
                        // the ring buffer wraps to older records at its end
                        if last.is_some_and(|l| obs.timestamp <= l) {
                            debug!(timestamp = %obs.timestamp, "skipping stale archive record");
                            continue;
                        }
                        obs.report_interval_minutes = Some(self.archive_interval);
                        obs.rain_counter = Some(self.rain.add_interval(rain));
                        last = Some(obs.timestamp);
                        out.push(obs);
                    }
                    Ok(None) => {}
                    Err(e) => warn!(page = page_no, slot, error = %e, "skipping archive record"),
                }
            }
        }
        Ok(order_backlog(out))
    }
}

type SharedConsole = Arc<Mutex<VantageConsole<SerialPortLink>>>;

/// Davis Vantage Pro/Vue console driver
pub struct VantageDriver {
    name: String,
    config: VantageConfig,
    target: UnitSystem,
    clock: LocalClock,
    console: Option<SharedConsole>,
}

impl VantageDriver {
    pub fn new(name: impl Into<String>, config: VantageConfig, target: UnitSystem, clock: LocalClock) -> Self {
        Self {
            name: name.into(),
            config,
            target,
            clock,
            console: None,
        }
    }

    fn console(&self) -> IngestResult<SharedConsole> {
        self.console
            .clone()
            .ok_or_else(|| IngestError::DriverError("driver not started".into()))
    }
}

async fn with_console<T, F>(console: SharedConsole, f: F) -> IngestResult<T>
where
    T: Send + 'static,
    F: FnOnce(&mut VantageConsole<SerialPortLink>) -> IngestResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut guard = console
            .lock()
            .map_err(|_| IngestError::DriverError("console lock poisoned".into()))?;
        f(&mut *guard)
    })
    .await
    .map_err(|e| IngestError::DriverError(e.to_string()))?
}

#[async_trait::async_trait]
impl StationDriver for VantageDriver {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self), fields(driver = %self.name))]
    async fn start(&mut self) -> IngestResult<()> {
        let config = self.config.clone();
        let target = self.target;
        let console = tokio::task::spawn_blocking(move || -> IngestResult<_> {
            let port = SerialPortLink::open(&config.port, config.baud_rate, config.read_timeout)?;
            let mut console = VantageConsole::new(port, &config, target);
            console.wake()?;
            Ok(console)
        })
        .await
        .map_err(|e| IngestError::DriverError(e.to_string()))??;
        info!(port = %self.config.port, "vantage console awake");
        self.console = Some(Arc::new(Mutex::new(console)));
        Ok(())
    }

    async fn stop(&mut self) -> IngestResult<()> {
        self.console = None;
        Ok(())
    }

    #[instrument(skip(self), fields(driver = %self.name))]
    async fn fetch_backlog(&mut self, since: Option<NaiveDateTime>) -> IngestResult<Vec<Observation>> {
        let backlog = with_console(self.console()?, move |c| c.dump_after(since)).await?;
        info!(records = backlog.len(), "vantage archive downloaded");
        Ok(backlog)
    }

    async fn get_observation(&mut self) -> IngestResult<Option<Observation>> {
        let console = self.console()?;
        tokio::time::sleep(self.config.poll_interval).await;
        let timestamp = self.clock.now();
        with_console(console, move |c| c.read_live(timestamp))
            .await
            .map(Some)
    }

    fn is_active(&self) -> bool {
        self.console.is_some()
    }
}
