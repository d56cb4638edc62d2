//! Reference sinks for the replay engine: JSON lines on disk, and memory

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fs::{create_dir_all, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;
use wxhub_core::{DaySummary, EnrichedObservation, ObservationSink};

/// One line of `resets.jsonl`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ResetEvent {
    DayReset {
        timestamp: NaiveDateTime,
        summary: DaySummary,
    },
    MidnightReset {
        timestamp: NaiveDateTime,
    },
    NineAmReset {
        timestamp: NaiveDateTime,
    },
    SnowHourReset {
        timestamp: NaiveDateTime,
    },
}

/// Appends observations to `observations.jsonl` and resets to `resets.jsonl`
pub struct FsSink {
    observations: PathBuf,
    resets: PathBuf,
    // drivers share one sink; keep their lines from interleaving
    write_lock: Mutex<()>,
}

impl FsSink {
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        create_dir_all(&dir).with_context(|| format!("creating sink directory {}", dir.display()))?;
        Ok(Self {
            observations: dir.join("observations.jsonl"),
            resets: dir.join("resets.jsonl"),
            write_lock: Mutex::new(()),
        })
    }

    async fn append<T: Serialize>(&self, file: &Path, value: &T) -> Result<()> {
        let line = serde_json::to_string(value)?;
        let _guard = self.write_lock.lock().await;
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(file)
            .with_context(|| format!("opening {}", file.display()))?;
        f.write_all(line.as_bytes())?;
        f.write_all(b"\n")?;
        Ok(())
    }

    async fn reset(&self, event: ResetEvent) -> Result<()> {
        debug!(?event, "reset");
        self.append(&self.resets, &event).await
    }
}

#[async_trait::async_trait]
impl ObservationSink for FsSink {
    async fn on_observation(&self, record: &EnrichedObservation) -> Result<()> {
        self.append(&self.observations, record).await
    }

    async fn on_day_reset(&self, timestamp: NaiveDateTime, summary: &DaySummary) -> Result<()> {
        self.reset(ResetEvent::DayReset {
            timestamp,
            summary: summary.clone(),
        })
        .await
    }

    async fn on_midnight_reset(&self, timestamp: NaiveDateTime) -> Result<()> {
        self.reset(ResetEvent::MidnightReset { timestamp }).await
    }

    async fn on_9am_reset(&self, timestamp: NaiveDateTime) -> Result<()> {
        self.reset(ResetEvent::NineAmReset { timestamp }).await
    }

    async fn on_snow_hour_reset(&self, timestamp: NaiveDateTime) -> Result<()> {
        self.reset(ResetEvent::SnowHourReset { timestamp }).await
    }
}

/// Keeps everything in memory
#[derive(Default)]
pub struct MemorySink {
    observations: Mutex<Vec<EnrichedObservation>>,
    resets: Mutex<Vec<ResetEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn observations(&self) -> Vec<EnrichedObservation> {
        self.observations.lock().await.clone()
    }

    pub async fn resets(&self) -> Vec<ResetEvent> {
        self.resets.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl ObservationSink for MemorySink {
    async fn on_observation(&self, record: &EnrichedObservation) -> Result<()> {
        self.observations.lock().await.push(record.clone());
        Ok(())
    }

    async fn on_day_reset(&self, timestamp: NaiveDateTime, summary: &DaySummary) -> Result<()> {
        self.resets.lock().await.push(ResetEvent::DayReset {
            timestamp,
            summary: summary.clone(),
        });
        Ok(())
    }

    async fn on_midnight_reset(&self, timestamp: NaiveDateTime) -> Result<()> {
        self.resets.lock().await.push(ResetEvent::MidnightReset { timestamp });
        Ok(())
    }

    async fn on_9am_reset(&self, timestamp: NaiveDateTime) -> Result<()> {
        self.resets.lock().await.push(ResetEvent::NineAmReset { timestamp });
        Ok(())
    }

    async fn on_snow_hour_reset(&self, timestamp: NaiveDateTime) -> Result<()> {
        self.resets.lock().await.push(ResetEvent::SnowHourReset { timestamp });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use wxhub_core::Observation;

    fn ts() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 6, 12)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    fn record() -> EnrichedObservation {
        let mut observation = Observation::new(ts());
        observation.outdoor_temp = Some(20.0);
        EnrichedObservation {
            observation,
            station: Some("garden".into()),
            rain_today: 1.5,
            rain_since_midnight: 1.5,
            rain_since_9am: 0.0,
            windrun_today: 12.0,
            dominant_bearing: Some(270.0),
            heating_degree_days: 0.0,
            cooling_degree_days: 0.2,
            chill_hours: 0.0,
            avg_temp_today: Some(19.0),
            snow_24h: None,
        }
    }

    #[tokio::test]
    async fn writes_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FsSink::new(dir.path().join("out")).unwrap();
        sink.on_observation(&record()).await.unwrap();
        sink.on_observation(&record()).await.unwrap();
        sink.on_day_reset(ts(), &DaySummary::default()).await.unwrap();
        sink.on_midnight_reset(ts()).await.unwrap();

        let content = std::fs::read_to_string(dir.path().join("out/observations.jsonl")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let back: EnrichedObservation = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(back, record());

        let resets = std::fs::read_to_string(dir.path().join("out/resets.jsonl")).unwrap();
        let events: Vec<ResetEvent> = resets
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(
            events,
            vec![
                ResetEvent::DayReset {
                    timestamp: ts(),
                    summary: DaySummary::default()
                },
                ResetEvent::MidnightReset { timestamp: ts() },
            ]
        );
        assert!(resets.starts_with(r#"{"event":"day_reset""#));
    }

    #[tokio::test]
    async fn memory_sink_records_calls() {
        let sink = MemorySink::new();
        sink.on_observation(&record()).await.unwrap();
        sink.on_snow_hour_reset(ts()).await.unwrap();
        assert_eq!(sink.observations().await.len(), 1);
        assert_eq!(sink.resets().await, vec![ResetEvent::SnowHourReset { timestamp: ts() }]);
    }
}
