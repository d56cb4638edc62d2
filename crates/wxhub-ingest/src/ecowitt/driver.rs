//! Ecowitt driver: log-file backlog plus live HTTP or log polling

use std::collections::VecDeque;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveDateTime;
use tracing::{debug, info, instrument, warn};
use wxhub_core::{LocalClock, Observation, UnitSystem};

use super::csvlog::{merge_by_timestamp, CsvLogStream};
use super::local_api::{decode_livedata, LocalApiClient};
use crate::{order_backlog, IngestError, IngestResult, StationDriver};

#[derive(Debug, Clone)]
pub struct EcowittConfig {
    /// Directory holding the console's CSV logs
    pub log_dir: Option<PathBuf>,
    /// Gateway address for live polling
    pub host: Option<String>,
    pub poll_interval: Duration,
    pub http_timeout: Duration,
    pub log_interval_minutes: u32,
}

impl Default for EcowittConfig {
    fn default() -> Self {
        Self {
            log_dir: None,
            host: None,
            poll_interval: Duration::from_secs(30),
            http_timeout: Duration::from_secs(10),
            log_interval_minutes: 5,
        }
    }
}

fn is_extra_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.to_ascii_lowercase().contains("allsensors"))
}

/// Decode every CSV log in `dir` and return records newer than `since`.
/// Files named `*allsensors*` hold extra sensors and are merged by time.
pub fn read_log_dir(
    dir: &Path,
    since: Option<NaiveDateTime>,
    target: UnitSystem,
    clock: LocalClock,
    interval_minutes: u32,
) -> IngestResult<Vec<Observation>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("csv"))
        })
        .collect();
    files.sort();

    let mut main = Vec::new();
    let mut extra = Vec::new();
    for path in files {
        let reader = BufReader::new(File::open(&path)?);
        let mut stream = match CsvLogStream::new(reader, target, clock, interval_minutes) {
            Ok(s) => s,
            Err(e) => {
                warn!(file = %path.display(), error = %e, "skipping unreadable log file");
                continue;
            }
        };
        let records: Vec<Observation> = stream
            .by_ref()
            .filter(|o| since.map_or(true, |s| o.timestamp > s))
            .collect();
        debug!(file = %path.display(), stats = ?stream.stats(), "log file decoded");
        if is_extra_file(&path) {
            extra.extend(records);
        } else {
            main.extend(records);
        }
    }

    // duplicates across files: first file wins
    Ok(merge_by_timestamp(order_backlog(main), order_backlog(extra)))
}

/// Ecowitt console/gateway driver
pub struct EcowittDriver {
    name: String,
    config: EcowittConfig,
    target: UnitSystem,
    clock: LocalClock,
    client: Option<LocalApiClient>,
    pending: VecDeque<Observation>,
    last_seen: Option<NaiveDateTime>,
    active: bool,
}

impl EcowittDriver {
    pub fn new(name: impl Into<String>, config: EcowittConfig, target: UnitSystem, clock: LocalClock) -> Self {
        Self {
            name: name.into(),
            config,
            target,
            clock,
            client: None,
            pending: VecDeque::new(),
            last_seen: None,
            active: false,
        }
    }

    async fn read_logs(&self, since: Option<NaiveDateTime>) -> IngestResult<Vec<Observation>> {
        let Some(dir) = self.config.log_dir.clone() else {
            return Ok(Vec::new());
        };
        let (target, clock, interval) = (self.target, self.clock, self.config.log_interval_minutes);
        tokio::task::spawn_blocking(move || read_log_dir(&dir, since, target, clock, interval))
            .await
            .map_err(|e| IngestError::DriverError(e.to_string()))?
    }

    async fn poll_http(&self, client: &LocalApiClient) -> IngestResult<Option<Observation>> {
        let Some(payload) = client.fetch().await? else {
            return Ok(None);
        };
        match decode_livedata(&payload, self.clock.now(), &self.target) {
            Ok(obs) => Ok(Some(obs)),
            Err(e) => {
                warn!(error = %e, "no observation from gateway this poll");
                Ok(None)
            }
        }
    }
}

#[async_trait::async_trait]
impl StationDriver for EcowittDriver {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self), fields(driver = %self.name))]
    async fn start(&mut self) -> IngestResult<()> {
        if self.config.host.is_none() && self.config.log_dir.is_none() {
            return Err(IngestError::DriverError(
                "ecowitt driver needs a gateway host or a log directory".into(),
            ));
        }
        if let Some(host) = &self.config.host {
            let client = LocalApiClient::new(host, self.config.http_timeout)?;
            info!(url = %client.url(), "polling ecowitt gateway");
            self.client = Some(client);
        }
        self.active = true;
        Ok(())
    }

    async fn stop(&mut self) -> IngestResult<()> {
        self.client = None;
        self.active = false;
        Ok(())
    }

    #[instrument(skip(self), fields(driver = %self.name))]
    async fn fetch_backlog(&mut self, since: Option<NaiveDateTime>) -> IngestResult<Vec<Observation>> {
        let backlog = self.read_logs(since).await?;
        if let Some(last) = backlog.last() {
            self.last_seen = Some(last.timestamp);
        } else {
            self.last_seen = since;
        }
        info!(records = backlog.len(), "ecowitt log backlog read");
        Ok(backlog)
    }

    async fn get_observation(&mut self) -> IngestResult<Option<Observation>> {
        if let Some(obs) = self.pending.pop_front() {
            return Ok(Some(obs));
        }
        tokio::time::sleep(self.config.poll_interval).await;

        if let Some(client) = self.client.clone() {
            return self.poll_http(&client).await;
        }

        // file-only station: pick up lines appended since the last poll
        let fresh = self.read_logs(self.last_seen).await?;
        if let Some(last) = fresh.last() {
            self.last_seen = Some(last.timestamp);
        }
        self.pending.extend(fresh);
        Ok(self.pending.pop_front())
    }

    fn is_active(&self) -> bool {
        self.active
    }
}
