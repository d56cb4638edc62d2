//! Tempest driver: UDP broadcasts live, REST history for the backlog

use std::net::SocketAddr;

use chrono::{Duration as ChronoDuration, NaiveDateTime};
use tokio::net::UdpSocket;
use tokio::time::{timeout, Duration};
use tracing::{debug, error, info, instrument};
use wxhub_core::{LocalClock, Observation, UnitSystem};

use super::rest::{fetch_history, HistoryFetcher, RestClient, DEFAULT_REST_BASE};
use super::udp::{TempestDecoder, TempestEvent};
use crate::{order_backlog, IngestError, IngestResult, ProtocolFatal, StationDriver};

pub const TEMPEST_UDP_PORT: u16 = 50222;

#[derive(Debug, Clone)]
pub struct TempestConfig {
    pub bind: SocketAddr,
    pub recv_timeout: Duration,
    /// REST history needs both a device id and a token
    pub device_id: Option<u64>,
    pub token: Option<String>,
    pub rest_base: String,
    pub http_timeout: Duration,
    /// How far back to fetch when there is no resume point
    pub backfill_days: u32,
}

impl Default for TempestConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], TEMPEST_UDP_PORT)),
            recv_timeout: Duration::from_secs(5),
            device_id: None,
            token: None,
            rest_base: DEFAULT_REST_BASE.to_string(),
            http_timeout: Duration::from_secs(30),
            backfill_days: 1,
        }
    }
}

pub struct TempestDriver {
    name: String,
    config: TempestConfig,
    clock: LocalClock,
    decoder: TempestDecoder,
    socket: Option<UdpSocket>,
    history: Option<Box<dyn HistoryFetcher>>,
    /// Set once the REST API rejected us; history is not retried
    rejected: Option<ProtocolFatal>,
    active: bool,
}

impl TempestDriver {
    pub fn new(name: impl Into<String>, config: TempestConfig, target: UnitSystem, clock: LocalClock) -> Self {
        Self {
            name: name.into(),
            config,
            clock,
            decoder: TempestDecoder::new(target, clock),
            socket: None,
            history: None,
            rejected: None,
            active: false,
        }
    }

    /// Replace the REST client, mainly for tests
    pub fn with_history(mut self, fetcher: Box<dyn HistoryFetcher>) -> Self {
        self.history = Some(fetcher);
        self
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    fn socket_ref(&self) -> Result<&UdpSocket, IngestError> {
        self.socket
            .as_ref()
            .ok_or_else(|| IngestError::DriverError("socket not active".into()))
    }
}

#[async_trait::async_trait]
impl StationDriver for TempestDriver {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self), fields(driver = %self.name))]
    async fn start(&mut self) -> IngestResult<()> {
        if self.active {
            return Err(IngestError::DriverError("already started".into()));
        }
        let sock = UdpSocket::bind(self.config.bind)
            .await
            .map_err(|e| IngestError::CommunicationError(e.to_string()))?;
        sock.set_broadcast(true)
            .map_err(|e| IngestError::CommunicationError(e.to_string()))?;
        info!(bind = %self.config.bind, "listening for tempest broadcasts");
        self.socket = Some(sock);

        if self.history.is_none() {
            if let (Some(device_id), Some(token)) = (self.config.device_id, self.config.token.as_ref()) {
                let client = RestClient::new(&self.config.rest_base, device_id, token.clone(), self.config.http_timeout)?;
                self.history = Some(Box::new(client));
            }
        }
        self.active = true;
        Ok(())
    }

    async fn stop(&mut self) -> IngestResult<()> {
        self.active = false;
        self.socket = None;
        Ok(())
    }

    #[instrument(skip(self), fields(driver = %self.name))]
    async fn fetch_backlog(&mut self, since: Option<NaiveDateTime>) -> IngestResult<Vec<Observation>> {
        let Some(history) = self.history.as_deref() else {
            debug!("no REST credentials, live data only");
            return Ok(Vec::new());
        };
        if let Some(fatal) = &self.rejected {
            debug!(error = %fatal, "history previously rejected");
            return Ok(Vec::new());
        }

        let now = self.clock.now();
        let from = since.unwrap_or(now - ChronoDuration::days(i64::from(self.config.backfill_days)));
        let (Some(start), Some(end)) = (self.clock.to_epoch(from), self.clock.to_epoch(now)) else {
            return Err(IngestError::DriverError(format!("cannot resolve {from} to epoch time")));
        };

        let outcome = fetch_history(history, &mut self.decoder, start + 1, end).await;
        if let Some(fatal) = outcome.stopped {
            error!(error = %fatal, "tempest REST history rejected; continuing with live data");
            self.rejected = Some(fatal);
        }
        let backlog = outcome
            .observations
            .into_iter()
            .filter(|o| since.map_or(true, |s| o.timestamp > s))
            .collect();
        Ok(order_backlog(backlog))
    }

    async fn get_observation(&mut self) -> IngestResult<Option<Observation>> {
        if !self.active {
            return Err(IngestError::DriverError("not active".into()));
        }
        let mut buf = vec![0u8; 2048];
        let (n, peer) = match timeout(self.config.recv_timeout, self.socket_ref()?.recv_from(&mut buf)).await {
            Ok(received) => received?,
            Err(_) => return Ok(None),
        };

        match self.decoder.decode(&buf[..n]) {
            Ok(TempestEvent::Observation(obs)) => Ok(Some(obs)),
            Ok(other) => {
                debug!(%peer, event = ?other, "tempest event");
                Ok(None)
            }
            Err(e) => {
                debug!(%peer, error = %e, "dropping undecodable datagram");
                Ok(None)
            }
        }
    }

    fn is_active(&self) -> bool {
        self.active
    }
}
