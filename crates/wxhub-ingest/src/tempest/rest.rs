//! WeatherFlow REST history paging

use serde::Deserialize;
use tracing::{debug, info, instrument, warn};
use url::Url;
use wxhub_core::Observation;

use super::udp::{TempestDecoder, OBS_ST_LEN};
use crate::{IngestError, IngestResult, ProtocolFatal};

pub const DEFAULT_REST_BASE: &str = "https://swd.weatherflow.com/swd/rest/";

/// Largest time window the history endpoint serves in one request
pub const MAX_WINDOW_SECS: i64 = 4 * 24 * 3600;

/// Split `[start, end)` epoch seconds into request windows of at most four days
pub fn history_windows(start: i64, end: i64) -> Vec<(i64, i64)> {
    let mut windows = Vec::new();
    let mut from = start;
    while from < end {
        let to = (from + MAX_WINDOW_SECS).min(end);
        windows.push((from, to));
        from = to;
    }
    windows
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiStatus {
    #[serde(default)]
    pub status_code: i64,
    #[serde(default)]
    pub status_message: String,
}

/// One page of device observations
#[derive(Debug, Clone, Deserialize)]
pub struct HistoryPage {
    #[serde(default)]
    pub status: Option<ApiStatus>,
    #[serde(default)]
    pub obs: Option<Vec<Vec<Option<f64>>>>,
}

/// Map a rejection onto a fatal error when it is unambiguous
pub fn classify_rejection(http_status: u16, message: &str) -> Option<ProtocolFatal> {
    match http_status {
        401 | 403 => return Some(ProtocolFatal::Unauthorized(message.to_string())),
        404 => return Some(ProtocolFatal::UnknownDevice(message.to_string())),
        _ => {}
    }
    let lower = message.to_ascii_lowercase();
    if lower.contains("unauthorized") || lower.contains("invalid token") {
        Some(ProtocolFatal::Unauthorized(message.to_string()))
    } else if lower.contains("unknown device") || lower.contains("device not found") {
        Some(ProtocolFatal::UnknownDevice(message.to_string()))
    } else {
        None
    }
}

/// Fetches one history window
#[async_trait::async_trait]
pub trait HistoryFetcher: Send + Sync {
    async fn fetch_window(&self, start: i64, end: i64) -> IngestResult<HistoryPage>;
}

/// reqwest-backed history client
#[derive(Debug, Clone)]
pub struct RestClient {
    http: reqwest::Client,
    base: Url,
    device_id: u64,
    token: String,
}

impl RestClient {
    pub fn new(base: &str, device_id: u64, token: impl Into<String>, timeout: std::time::Duration) -> IngestResult<Self> {
        let mut base = Url::parse(base).map_err(|e| IngestError::DriverError(format!("invalid REST base URL: {e}")))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base,
            device_id,
            token: token.into(),
        })
    }

    pub fn window_url(&self, start: i64, end: i64) -> IngestResult<Url> {
        let mut url = self
            .base
            .join(&format!("observations/device/{}", self.device_id))
            .map_err(|e| IngestError::DriverError(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("time_start", &start.to_string())
            .append_pair("time_end", &end.to_string())
            .append_pair("token", &self.token);
        Ok(url)
    }
}

#[async_trait::async_trait]
impl HistoryFetcher for RestClient {
    async fn fetch_window(&self, start: i64, end: i64) -> IngestResult<HistoryPage> {
        let response = self.http.get(self.window_url(start, end)?).send().await?;
        let status = response.status();
        if !status.is_success() {
            let reason = status.canonical_reason().unwrap_or("request failed");
            return Err(match classify_rejection(status.as_u16(), reason) {
                Some(fatal) => fatal.into(),
                None => IngestError::CommunicationError(format!("HTTP {status}")),
            });
        }
        Ok(response.json::<HistoryPage>().await?)
    }
}

/// Backlog plus the fatal rejection that ended paging, if any
#[derive(Debug, Default)]
pub struct HistoryOutcome {
    pub observations: Vec<Observation>,
    pub stopped: Option<ProtocolFatal>,
}

/// Zero-fill a REST row; the accumulators downstream need seed values
fn fill_row(row: &[Option<f64>], window: (i64, i64)) -> Vec<Option<f64>> {
    let mut filled: Vec<Option<f64>> = row.to_vec();
    filled.resize(OBS_ST_LEN.max(row.len()), None);
    // the epoch slot is the only one that may not default
    for (index, slot) in filled.iter_mut().enumerate().skip(1) {
        if slot.is_none() {
            debug!(index, window_start = window.0, "null history slot defaulted to zero");
            *slot = Some(0.0);
        }
    }
    filled
}

/// Page through `[start, end)` and decode every row
#[instrument(skip(fetcher, decoder))]
pub async fn fetch_history(
    fetcher: &dyn HistoryFetcher,
    decoder: &mut TempestDecoder,
    start: i64,
    end: i64,
) -> HistoryOutcome {
    let mut outcome = HistoryOutcome::default();

    for window in history_windows(start, end) {
        let page = match fetcher.fetch_window(window.0, window.1).await {
            Ok(page) => page,
            Err(IngestError::Fatal(fatal)) => {
                warn!(error = %fatal, window_start = window.0, "history paging stopped");
                outcome.stopped = Some(fatal);
                break;
            }
            Err(e) => {
                warn!(error = %e, window_start = window.0, "skipping history window");
                continue;
            }
        };

        if let Some(status) = page.status.as_ref().filter(|s| s.status_code != 0) {
            if let Some(fatal) = classify_rejection(200, &status.status_message) {
                warn!(error = %fatal, window_start = window.0, "history paging stopped");
                outcome.stopped = Some(fatal);
                break;
            }
            warn!(
                code = status.status_code,
                message = %status.status_message,
                window_start = window.0,
                "skipping history window"
            );
            continue;
        }

        let rows = page.obs.unwrap_or_default();
        debug!(rows = rows.len(), window_start = window.0, "history window fetched");
        for row in rows {
            match decoder.observation_from_row(&fill_row(&row, window)) {
                Ok(obs) => outcome.observations.push(obs),
                Err(e) => warn!(error = %e, window_start = window.0, "skipping history row"),
            }
        }
    }

    info!(records = outcome.observations.len(), "history fetched");
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use wxhub_core::{LocalClock, UnitSystem};

    const DAY: i64 = 24 * 3600;

    #[test]
    fn test_history_windows() {
        assert!(history_windows(0, 0).is_empty());
        assert_eq!(history_windows(0, DAY), vec![(0, DAY)]);
        assert_eq!(
            history_windows(0, 9 * DAY),
            vec![(0, 4 * DAY), (4 * DAY, 8 * DAY), (8 * DAY, 9 * DAY)]
        );
    }

    #[test]
    fn test_classify_rejection() {
        assert!(matches!(classify_rejection(401, "x"), Some(ProtocolFatal::Unauthorized(_))));
        assert!(matches!(classify_rejection(403, "x"), Some(ProtocolFatal::Unauthorized(_))));
        assert!(matches!(classify_rejection(404, "x"), Some(ProtocolFatal::UnknownDevice(_))));
        assert!(matches!(
            classify_rejection(200, "Unknown device 1234"),
            Some(ProtocolFatal::UnknownDevice(_))
        ));
        assert!(classify_rejection(500, "Internal Server Error").is_none());
        assert!(classify_rejection(200, "rate limited").is_none());
    }

    #[test]
    fn test_window_url() {
        let client = RestClient::new("https://example.test/swd/rest", 42, "secret", std::time::Duration::from_secs(5)).unwrap();
        assert_eq!(
            client.window_url(10, 20).unwrap().as_str(),
            "https://example.test/swd/rest/observations/device/42?time_start=10&time_end=20&token=secret"
        );
    }

    enum Reply {
        Page(&'static str),
        Error(fn() -> IngestError),
    }

    struct FakeFetcher {
        replies: HashMap<i64, Reply>,
        requested: Mutex<Vec<i64>>,
    }

    #[async_trait::async_trait]
    impl HistoryFetcher for FakeFetcher {
        async fn fetch_window(&self, start: i64, _end: i64) -> IngestResult<HistoryPage> {
            self.requested.lock().unwrap().push(start);
            match self.replies.get(&start) {
                Some(Reply::Page(body)) => Ok(serde_json::from_str(body).unwrap()),
                Some(Reply::Error(make)) => Err(make()),
                None => Ok(HistoryPage { status: None, obs: None }),
            }
        }
    }

    fn decoder() -> TempestDecoder {
        TempestDecoder::new(UnitSystem::metric(), LocalClock::from_offset_minutes(0).unwrap())
    }

    const START: i64 = 1_749_600_000;

    #[tokio::test]
    async fn test_nulls_default_to_zero_and_errors_skip_window() {
        let mut replies = HashMap::new();
        replies.insert(
            START,
            Reply::Page(
                r#"{"status":{"status_code":0,"status_message":"SUCCESS"},
                    "obs":[[1749600060,0.1,1.5,2.0,180,3,1010.0,null,70,0,0,0,0.2,0,0,0,2.5,1],
                           [1749600120,0.1,1.6,2.1,190,3,1010.1,15.0,70,0,0,0]]}"#,
            ),
        );
        replies.insert(
            START + 4 * DAY,
            Reply::Error(|| IngestError::CommunicationError("HTTP 500".into())),
        );
        replies.insert(
            START + 8 * DAY,
            Reply::Page(r#"{"status":{"status_code":2,"status_message":"try later"},"obs":null}"#),
        );
        let fetcher = FakeFetcher {
            replies,
            requested: Mutex::new(Vec::new()),
        };

        let mut d = decoder();
        let outcome = fetch_history(&fetcher, &mut d, START, START + 10 * DAY).await;
        assert!(outcome.stopped.is_none());
        assert_eq!(fetcher.requested.lock().unwrap().len(), 3);
        assert_eq!(outcome.observations.len(), 2);
        assert_eq!(outcome.observations[0].outdoor_temp, Some(0.0));
        assert_eq!(outcome.observations[0].rain_counter, Some(0.2));
        // short row padded with zeros
        assert_eq!(outcome.observations[1].outdoor_temp, Some(15.0));
        assert_eq!(outcome.observations[1].rain_counter, Some(0.2));
        assert_eq!(outcome.observations[1].report_interval_minutes, Some(0));
    }

    #[tokio::test]
    async fn test_fatal_stops_paging() {
        let mut replies = HashMap::new();
        replies.insert(
            START,
            Reply::Error(|| ProtocolFatal::Unauthorized("Unauthorized".into()).into()),
        );
        let fetcher = FakeFetcher {
            replies,
            requested: Mutex::new(Vec::new()),
        };

        let mut d = decoder();
        let outcome = fetch_history(&fetcher, &mut d, START, START + 10 * DAY).await;
        assert!(matches!(outcome.stopped, Some(ProtocolFatal::Unauthorized(_))));
        assert_eq!(*fetcher.requested.lock().unwrap(), vec![START]);
        assert!(outcome.observations.is_empty());
    }

    #[tokio::test]
    async fn test_fatal_status_message_stops_paging() {
        let mut replies = HashMap::new();
        replies.insert(
            START,
            Reply::Page(r#"{"status":{"status_code":3,"status_message":"UNKNOWN DEVICE"}}"#),
        );
        let fetcher = FakeFetcher {
            replies,
            requested: Mutex::new(Vec::new()),
        };

        let outcome = fetch_history(&fetcher, &mut decoder(), START, START + 5 * DAY).await;
        assert!(matches!(outcome.stopped, Some(ProtocolFatal::UnknownDevice(_))));
        assert_eq!(fetcher.requested.lock().unwrap().len(), 1);
    }
}
