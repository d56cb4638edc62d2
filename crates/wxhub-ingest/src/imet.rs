//! Instromet-style ASCII data logger
//!
//! Commands are ASCII lines terminated by CRLF. The logger echoes each
//! command, then answers with comma-separated lines whose last field is a
//! checksum: the bitwise complement of the byte sum up to and including the
//! last comma, modulo 256.
//!
//! Log and live lines share one layout:
//! `token,yyyy/mm/dd,hh:mm:ss,temp,hum,dir,wind_avg,gust,rain,pressure,solar,chk`
//! in °C, %, degrees, m/s, m/s, mm (running counter), hPa and W/m².

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::NaiveDateTime;
use tracing::{debug, info, instrument, warn};
use wxhub_core::{Observation, UnitSystem};

use crate::serial::{SerialLink, SerialPortLink};
use crate::{
    order_backlog, DecodeError, FrameError, IngestError, IngestResult, StationDriver, UnitProfile,
};

/// Fields in a log or live line, checksum included
pub const LINE_FIELDS: usize = 12;
const TIMESTAMP_FORMAT: &str = "%Y/%m/%d %H:%M:%S";

/// `!(sum of bytes through the last comma) mod 256`, `None` without a comma
pub fn line_checksum(line: &str) -> Option<u8> {
    let last_comma = line.rfind(',')?;
    let sum = line.as_bytes()[..=last_comma]
        .iter()
        .fold(0u8, |acc, b| acc.wrapping_add(*b));
    Some(!sum)
}

/// Check a line's trailing checksum and return the body without it
pub fn validate_line(line: &str) -> Result<&str, FrameError> {
    let line = line.trim_end();
    let (Some(expected), Some(last_comma)) = (line_checksum(line), line.rfind(',')) else {
        return Err(FrameError::LineChecksum(format!("no checksum field in {line:?}")));
    };
    let received: u8 = line[last_comma + 1..]
        .trim()
        .parse()
        .map_err(|_| FrameError::LineChecksum(format!("unparsable checksum in {line:?}")))?;
    if received != expected {
        return Err(FrameError::LineChecksum(format!(
            "computed {expected}, received {received}"
        )));
    }
    Ok(&line[..last_comma])
}

/// Append a checksum field to `body`
pub fn append_checksum(body: &str) -> String {
    let with_comma = format!("{body},");
    let chk = line_checksum(&with_comma).unwrap_or_default();
    format!("{with_comma}{chk}")
}

/// Per-driver read progress, replacing process-wide read pointers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoggerState {
    pub entries_read: u64,
    pub checksum_failures: u64,
    pub last_timestamp: Option<NaiveDateTime>,
}

/// Logger status reply: `rdst,<stored entries>,<interval minutes>,chk`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoggerStatus {
    pub stored_entries: u32,
    pub interval_minutes: u32,
}

/// Command/response transport for the logger
pub struct LoggerLink<L> {
    link: L,
    /// Lines read (or timeouts) before a query gives up
    attempts: u32,
}

impl<L: SerialLink> LoggerLink<L> {
    pub fn new(link: L, attempts: u32) -> Self {
        Self {
            link,
            attempts: attempts.max(1),
        }
    }

    /// Send a command and discard its echo
    pub fn send_command(&mut self, command: &str) -> Result<(), FrameError> {
        self.link.clear_input()?;
        self.link.write_all(format!("{command}\r\n").as_bytes())?;
        match self.link.read_line()? {
            Some(_echo) => Ok(()),
            None => Err(FrameError::Timeout),
        }
    }

    /// Send `command` and return the first validated line containing `token`.
    /// Token lines failing their checksum are dropped, counted in `state`,
    /// and the read goes on within the attempt budget.
    pub fn query(
        &mut self,
        command: &str,
        token: &str,
        state: &mut LoggerState,
    ) -> Result<String, FrameError> {
        self.send_command(command)?;
        for _ in 0..self.attempts {
            let Some(line) = self.link.read_line()? else {
                continue;
            };
            if !line.to_ascii_lowercase().contains(token) {
                debug!(line = %line, token, "skipping unrelated logger line");
                continue;
            }
            match validate_line(&line) {
                Ok(body) => return Ok(body.to_string()),
                Err(e) => {
                    state.checksum_failures += 1;
                    warn!(command, error = %e, "dropping logger reply");
                }
            }
        }
        Err(FrameError::RetriesExhausted(self.attempts))
    }

    pub fn status(&mut self, state: &mut LoggerState) -> Result<LoggerStatus, FrameError> {
        let body = self.query("RDST", "rdst", state)?;
        let fields: Vec<&str> = body.split(',').map(str::trim).collect();
        let parse = |i: usize| -> Result<u32, FrameError> {
            fields
                .get(i)
                .and_then(|f| f.parse().ok())
                .ok_or_else(|| FrameError::Malformed(format!("status line {body:?}")))
        };
        Ok(LoggerStatus {
            stored_entries: parse(1)?,
            interval_minutes: parse(2)?,
        })
    }

    /// Read up to `count` log lines. Lines failing their checksum are
    /// dropped and counted in `state`.
    pub fn read_log_lines(
        &mut self,
        count: u32,
        state: &mut LoggerState,
    ) -> Result<Vec<String>, FrameError> {
        self.send_command(&format!("RDLG,{count}"))?;
        let mut lines = Vec::new();
        let mut quiet = 0;
        while quiet < self.attempts {
            let Some(line) = self.link.read_line()? else {
                quiet += 1;
                continue;
            };
            let trimmed = line.trim();
            if trimmed.eq_ignore_ascii_case("ok") {
                break;
            }
            if trimmed.is_empty() {
                continue;
            }
            state.entries_read += 1;
            match validate_line(trimmed) {
                Ok(body) => lines.push(body.to_string()),
                Err(e) => {
                    state.checksum_failures += 1;
                    warn!(entry = state.entries_read, error = %e, "dropping logger line");
                }
            }
        }
        Ok(lines)
    }
}

fn optional(fields: &[&str], index: usize, name: &str) -> Result<Option<f64>, DecodeError> {
    let raw = fields.get(index).map(|f| f.trim()).unwrap_or("");
    if raw.is_empty() || raw == "-" {
        return Ok(None);
    }
    raw.parse().map(Some).map_err(|_| DecodeError::Field {
        field: name.to_string(),
        value: raw.to_string(),
    })
}

/// Decode a validated line body (checksum already stripped)
pub fn decode_line(body: &str, line: usize, profile: &UnitProfile) -> Result<Observation, DecodeError> {
    let fields: Vec<&str> = body.split(',').collect();
    if fields.len() < LINE_FIELDS - 1 {
        return Err(DecodeError::TooFewFields {
            line,
            need: LINE_FIELDS,
            got: fields.len() + 1,
        });
    }
    let stamp = format!("{} {}", fields[1].trim(), fields[2].trim());
    let timestamp = NaiveDateTime::parse_from_str(&stamp, TIMESTAMP_FORMAT)
        .map_err(|_| DecodeError::Timestamp(stamp.clone()))?;

    let mut obs = Observation::new(timestamp);
    obs.outdoor_temp = optional(&fields, 3, "temperature")?.map(|v| profile.temperature(v));
    obs.outdoor_humidity = optional(&fields, 4, "humidity")?;
    obs.wind_dir = optional(&fields, 5, "wind_dir")?;
    obs.wind_speed = optional(&fields, 6, "wind_avg")?.map(|v| profile.wind(v));
    obs.wind_gust = optional(&fields, 7, "wind_gust")?.map(|v| profile.wind(v));
    obs.rain_counter = optional(&fields, 8, "rain")?.map(|v| profile.rain(v));
    obs.station_pressure = optional(&fields, 9, "pressure")?.map(|v| profile.pressure(v));
    obs.solar_radiation = optional(&fields, 10, "solar")?.map(|v| profile.solar(v));
    Ok(obs)
}

/// Decode log lines, skipping bad or already-seen records
pub fn decode_log(
    bodies: &[String],
    profile: &UnitProfile,
    interval_minutes: Option<u32>,
    state: &mut LoggerState,
) -> Vec<Observation> {
    let mut out = Vec::with_capacity(bodies.len());
    for (i, body) in bodies.iter().enumerate() {
        match decode_line(body, i + 1, profile) {
            Ok(mut obs) => {
                if state.last_timestamp.is_some_and(|last| obs.timestamp <= last) {
                    debug!(timestamp = %obs.timestamp, "skipping already-read logger entry");
                    continue;
                }
                obs.report_interval_minutes = interval_minutes;
                state.last_timestamp = Some(obs.timestamp);
                out.push(obs);
            }
            Err(e) => warn!(line = i + 1, error = %e, "skipping logger line"),
        }
    }
    out
}

#[derive(Debug, Clone)]
pub struct ImetConfig {
    pub port: String,
    pub baud_rate: u32,
    pub read_timeout: Duration,
    pub poll_interval: Duration,
    pub attempts: u32,
    /// Entries requested per `RDLG`
    pub batch_size: u32,
}

impl Default for ImetConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 19200,
            read_timeout: Duration::from_secs(1),
            poll_interval: Duration::from_secs(10),
            attempts: 10,
            batch_size: 50,
        }
    }
}

struct ImetSession<L> {
    link: LoggerLink<L>,
    state: LoggerState,
    profile: UnitProfile,
}

impl<L: SerialLink> ImetSession<L> {
    fn backlog(&mut self, since: Option<NaiveDateTime>, batch: u32) -> Result<Vec<Observation>, FrameError> {
        let status = self.link.status(&mut self.state)?;
        info!(stored = status.stored_entries, interval = status.interval_minutes, "logger status");
        if self.state.last_timestamp.is_none() {
            self.state.last_timestamp = since;
        }

        let mut remaining = status.stored_entries;
        let mut out = Vec::new();
        while remaining > 0 {
            let want = remaining.min(batch.max(1));
            let lines = self.link.read_log_lines(want, &mut self.state)?;
            if lines.is_empty() {
                break;
            }
            remaining = remaining.saturating_sub(want);
            out.extend(decode_log(
                &lines,
                &self.profile,
                Some(status.interval_minutes),
                &mut self.state,
            ));
        }
        Ok(order_backlog(out))
    }

    fn live(&mut self) -> IngestResult<Observation> {
        let body = self.link.query("RDLV", "rdlv", &mut self.state)?;
        Ok(decode_line(&body, 0, &self.profile)?)
    }
}

/// Driver for the ASCII logger: log download then live `RDLV` polling
pub struct ImetDriver {
    name: String,
    config: ImetConfig,
    target: UnitSystem,
    session: Option<Arc<Mutex<ImetSession<SerialPortLink>>>>,
}

impl ImetDriver {
    pub fn new(name: impl Into<String>, config: ImetConfig, target: UnitSystem) -> Self {
        Self {
            name: name.into(),
            config,
            target,
            session: None,
        }
    }

    fn session(&self) -> IngestResult<Arc<Mutex<ImetSession<SerialPortLink>>>> {
        self.session
            .clone()
            .ok_or_else(|| IngestError::DriverError("driver not started".into()))
    }
}

fn lock<T>(m: &Mutex<T>) -> IngestResult<std::sync::MutexGuard<'_, T>> {
    m.lock()
        .map_err(|_| IngestError::DriverError("logger session lock poisoned".into()))
}

#[async_trait::async_trait]
impl StationDriver for ImetDriver {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self), fields(driver = %self.name))]
    async fn start(&mut self) -> IngestResult<()> {
        let config = self.config.clone();
        let profile = UnitProfile::fixed(UnitSystem::metric(), self.target);
        let session = tokio::task::spawn_blocking(move || -> IngestResult<_> {
            let port = SerialPortLink::open(&config.port, config.baud_rate, config.read_timeout)?;
            Ok(ImetSession {
                link: LoggerLink::new(port, config.attempts),
                state: LoggerState::default(),
                profile,
            })
        })
        .await
        .map_err(|e| IngestError::DriverError(e.to_string()))??;
        self.session = Some(Arc::new(Mutex::new(session)));
        Ok(())
    }

    async fn stop(&mut self) -> IngestResult<()> {
        self.session = None;
        Ok(())
    }

    #[instrument(skip(self), fields(driver = %self.name))]
    async fn fetch_backlog(&mut self, since: Option<NaiveDateTime>) -> IngestResult<Vec<Observation>> {
        let session = self.session()?;
        let batch = self.config.batch_size;
        tokio::task::spawn_blocking(move || -> IngestResult<Vec<Observation>> {
            let mut session = lock(&session)?;
            let backlog = session.backlog(since, batch)?;
            info!(
                records = backlog.len(),
                checksum_failures = session.state.checksum_failures,
                "logger backlog read"
            );
            Ok(backlog)
        })
        .await
        .map_err(|e| IngestError::DriverError(e.to_string()))?
    }

    async fn get_observation(&mut self) -> IngestResult<Option<Observation>> {
        let session = self.session()?;
        tokio::time::sleep(self.config.poll_interval).await;
        tokio::task::spawn_blocking(move || -> IngestResult<Option<Observation>> {
            let mut session = lock(&session)?;
            session.live().map(Some)
        })
        .await
        .map_err(|e| IngestError::DriverError(e.to_string()))?
    }

    fn is_active(&self) -> bool {
        self.session.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::ScriptedLink;
    use chrono::NaiveDate;
    use std::collections::VecDeque;

    const BODY: &str = "rdlg,2025/06/12,13:40:00,18.4,71,225,3.2,6.1,12.6,1008.2,410";

    fn log_line(minute: u32, rain: f64) -> String {
        append_checksum(&format!(
            "rdlg,2025/06/12,13:{minute:02}:00,18.4,71,225,3.2,6.1,{rain},1008.2,410"
        ))
    }

    /// Logger emulator: echoes commands, answers status, log and live reads
    fn logger(mut log: VecDeque<String>) -> ScriptedLink {
        ScriptedLink::new(move |bytes| {
            let cmd = String::from_utf8_lossy(bytes).trim().to_string();
            let mut out = format!("{cmd}\r\n");
            if cmd == "RDST" {
                out.push_str(&append_checksum(&format!("rdst,{},5", log.len())));
                out.push_str("\r\n");
            } else if let Some(n) = cmd.strip_prefix("RDLG,") {
                let n: usize = n.parse().unwrap();
                for _ in 0..n {
                    match log.pop_front() {
                        Some(line) => out.push_str(&format!("{line}\r\n")),
                        None => break,
                    }
                }
                out.push_str("OK\r\n");
            } else if cmd == "RDLV" {
                out.push_str("noise\r\n");
                out.push_str(&append_checksum(
                    "rdlv,2025/06/12,14:00:07,19.0,70,180,2.0,4.0,13.0,1008.0,500",
                ));
                out.push_str("\r\n");
            }
            out.into_bytes()
        })
    }

    #[test]
    fn test_checksum_includes_last_comma() {
        let line = append_checksum(BODY);
        let expected = !BODY
            .bytes()
            .chain(std::iter::once(b','))
            .fold(0u8, |a, b| a.wrapping_add(b));
        assert!(line.ends_with(&format!(",{expected}")));
        assert_eq!(validate_line(&line).unwrap(), BODY);
    }

    #[test]
    fn test_corrupt_line_rejected() {
        let line = append_checksum(BODY).replace("18.4", "18.5");
        assert!(matches!(validate_line(&line), Err(FrameError::LineChecksum(_))));
        assert!(validate_line("no commas here").is_err());
    }

    #[test]
    fn test_decode_line() {
        let profile = UnitProfile::fixed(UnitSystem::metric(), UnitSystem::metric());
        let obs = decode_line(BODY, 1, &profile).unwrap();
        assert_eq!(
            obs.timestamp,
            NaiveDate::from_ymd_opt(2025, 6, 12)
                .unwrap()
                .and_hms_opt(13, 40, 0)
                .unwrap()
        );
        assert_eq!(obs.outdoor_temp, Some(18.4));
        assert_eq!(obs.wind_dir, Some(225.0));
        assert_eq!(obs.rain_counter, Some(12.6));
        assert_eq!(obs.station_pressure, Some(1008.2));

        let short = "rdlg,2025/06/12,13:40:00,18.4";
        assert!(matches!(
            decode_line(short, 7, &profile),
            Err(DecodeError::TooFewFields { line: 7, .. })
        ));
    }

    #[test]
    fn test_backlog_drops_bad_checksums_and_counts_them() {
        let mut log: VecDeque<String> = (0..4).map(|i| log_line(i * 5, 1.0 + i as f64)).collect();
        log[2] = log[2].replace("18.4", "99.9");
        let mut session = ImetSession {
            link: LoggerLink::new(logger(log), 3),
            state: LoggerState::default(),
            profile: UnitProfile::fixed(UnitSystem::metric(), UnitSystem::metric()),
        };

        let backlog = session.backlog(None, 3).unwrap();
        assert_eq!(backlog.len(), 3);
        assert_eq!(session.state.entries_read, 4);
        assert_eq!(session.state.checksum_failures, 1);
        assert_eq!(backlog[0].report_interval_minutes, Some(5));
        assert_eq!(backlog[2].rain_counter, Some(4.0));
    }

    #[test]
    fn test_backlog_skips_entries_before_resume_point() {
        let log: VecDeque<String> = (0..4).map(|i| log_line(i * 5, 1.0)).collect();
        let mut session = ImetSession {
            link: LoggerLink::new(logger(log), 3),
            state: LoggerState::default(),
            profile: UnitProfile::fixed(UnitSystem::metric(), UnitSystem::metric()),
        };
        let since = NaiveDate::from_ymd_opt(2025, 6, 12)
            .unwrap()
            .and_hms_opt(13, 5, 0);
        let backlog = session.backlog(since, 10).unwrap();
        assert_eq!(backlog.len(), 2);
    }

    #[test]
    fn test_live_query_skips_unrelated_lines() {
        let mut session = ImetSession {
            link: LoggerLink::new(logger(VecDeque::new()), 3),
            state: LoggerState::default(),
            profile: UnitProfile::fixed(UnitSystem::metric(), UnitSystem::metric()),
        };
        let obs = session.live().unwrap();
        assert_eq!(obs.solar_radiation, Some(500.0));
    }

    #[test]
    fn test_live_query_reads_past_corrupt_reply() {
        let good = append_checksum("rdlv,2025/06/12,14:00:07,19.0,70,180,2.0,4.0,13.0,1008.0,500");
        let corrupt = good.replace("19.0", "19.5");
        let link = ScriptedLink::new(move |bytes| {
            let cmd = String::from_utf8_lossy(bytes).trim().to_string();
            format!("{cmd}\r\n{corrupt}\r\n{good}\r\n").into_bytes()
        });
        let mut session = ImetSession {
            link: LoggerLink::new(link, 5),
            state: LoggerState::default(),
            profile: UnitProfile::fixed(UnitSystem::metric(), UnitSystem::metric()),
        };

        let obs = session.live().unwrap();
        assert_eq!(obs.outdoor_temp, Some(19.0));
        assert_eq!(session.state.checksum_failures, 1);
    }

    #[test]
    fn test_only_corrupt_replies_exhaust_attempts() {
        let corrupt = append_checksum("rdlv,2025/06/12,14:00:07,19.0,70,180,2.0,4.0,13.0,1008.0,500")
            .replace("19.0", "19.5");
        let link = ScriptedLink::new(move |bytes| {
            let cmd = String::from_utf8_lossy(bytes).trim().to_string();
            format!("{cmd}\r\n{corrupt}\r\n{corrupt}\r\n").into_bytes()
        });
        let mut link = LoggerLink::new(link, 3);
        let mut state = LoggerState::default();
        assert!(matches!(
            link.query("RDLV", "rdlv", &mut state),
            Err(FrameError::RetriesExhausted(3))
        ));
        assert_eq!(state.checksum_failures, 2);
    }

    #[test]
    fn test_silent_logger_times_out() {
        let mut link = LoggerLink::new(ScriptedLink::silent(), 3);
        let mut state = LoggerState::default();
        assert!(matches!(
            link.query("RDLV", "rdlv", &mut state),
            Err(FrameError::Timeout)
        ));
    }
}
