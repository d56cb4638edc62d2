//! Weather station protocol decoders and drivers
//!
//! Every decoder in this crate turns vendor bytes or text into a
//! [`wxhub_core::Observation`] already expressed in the target unit system.
//! Drivers wrap a decoder with its transport (serial link, HTTP, UDP, log
//! files) and expose backlog and live reads through [`StationDriver`].

pub mod driver;
pub mod ecowitt;
pub mod frame;
pub mod imet;
pub mod rain;
pub mod serial;
pub mod tempest;
pub mod unit_profile;
pub mod vantage;
pub mod ws2300;

pub use driver::*;
pub use rain::RainTally;
pub use unit_profile::*;

use chrono::NaiveDateTime;
use std::time::Duration;
use thiserror::Error;
use wxhub_core::Observation;

/// Checksum, acknowledgement, or handshake failure on a framed link
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("ack mismatch: expected {expected:#04x}, got {actual:#04x}")]
    AckMismatch { expected: u8, actual: u8 },

    #[error("checksum mismatch: computed {computed:#04x}, received {received:#04x}")]
    Checksum { computed: u8, received: u8 },

    #[error("CRC check failed")]
    Crc,

    #[error("line checksum invalid: {0}")]
    LineChecksum(String),

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("handshake failed")]
    Handshake,

    #[error("no response within timeout")]
    Timeout,

    #[error("gave up after {0} attempts")]
    RetriesExhausted(u32),

    #[error("serial I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A single malformed record, line, or payload
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("buffer too short: need {need} bytes, got {got}")]
    ShortBuffer { need: usize, got: usize },

    #[error("unexpected packet: {0}")]
    UnexpectedPacket(String),

    #[error("line {line}: expected at least {need} fields, got {got}")]
    TooFewFields { line: usize, need: usize, got: usize },

    #[error("invalid timestamp: {0}")]
    Timestamp(String),

    #[error("invalid value for {field}: {value}")]
    Field { field: String, value: String },

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid CSV: {0}")]
    Csv(#[from] csv::Error),

    #[error("empty payload")]
    Empty,

    #[error("duplicate timestamp {0}")]
    Duplicate(NaiveDateTime),
}

/// Unambiguous rejection by the remote end; stops the driver
#[derive(Debug, Error)]
pub enum ProtocolFatal {
    #[error("unknown device: {0}")]
    UnknownDevice(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("unsupported API: {0}")]
    UnsupportedApi(String),
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Driver error: {0}")]
    DriverError(String),

    #[error("Communication error: {0}")]
    CommunicationError(String),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Fatal(#[from] ProtocolFatal),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timeout waiting for data")]
    Timeout,
}

impl IngestError {
    /// Whether the driver must stop paging/polling
    pub fn is_fatal(&self) -> bool {
        matches!(self, IngestError::Fatal(_))
    }
}

impl From<reqwest::Error> for IngestError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            IngestError::Timeout
        } else {
            IngestError::CommunicationError(e.to_string())
        }
    }
}

pub type IngestResult<T> = Result<T, IngestError>;

/// Trait for all weather station drivers
#[async_trait::async_trait]
pub trait StationDriver: Send + Sync {
    /// Driver name/identifier
    fn name(&self) -> &str;

    /// Open the transport and start data collection
    async fn start(&mut self) -> IngestResult<()>;

    /// Stop the driver and release the transport
    async fn stop(&mut self) -> IngestResult<()>;

    /// Observations logged after `since`, in ascending timestamp order.
    /// Drivers without a history source return an empty backlog.
    async fn fetch_backlog(
        &mut self,
        _since: Option<NaiveDateTime>,
    ) -> IngestResult<Vec<Observation>> {
        Ok(Vec::new())
    }

    /// Wait for the next live observation. `Ok(None)` means this poll
    /// produced nothing and the caller should simply poll again.
    async fn get_observation(&mut self) -> IngestResult<Option<Observation>>;

    /// Check if driver is currently active
    fn is_active(&self) -> bool;
}

/// Sort a backlog ascending and drop later duplicates of a timestamp
pub fn order_backlog(mut backlog: Vec<Observation>) -> Vec<Observation> {
    // stable sort keeps the first occurrence of a timestamp first
    backlog.sort_by_key(|o| o.timestamp);
    let before = backlog.len();
    backlog.dedup_by_key(|o| o.timestamp);
    if backlog.len() != before {
        tracing::warn!(
            dropped = before - backlog.len(),
            "dropped duplicate backlog timestamps"
        );
    }
    backlog
}

/// Round a timestamp down to a multiple of `interval` minutes
pub fn round_down(ts: NaiveDateTime, interval_minutes: u32) -> NaiveDateTime {
    use chrono::Timelike;
    let interval = interval_minutes.max(1);
    let minute = ts.minute() - ts.minute() % interval;
    ts.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .and_then(|t| t.with_minute(minute))
        .unwrap_or(ts)
}

pub(crate) fn sleep_blocking(delay: Duration) {
    if !delay.is_zero() {
        std::thread::sleep(delay);
    }
}
