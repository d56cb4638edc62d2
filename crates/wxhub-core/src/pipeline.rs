use anyhow::Result;
use chrono::NaiveDateTime;

use crate::{DaySummary, EnrichedObservation};

/// Persistence/publish collaborator fed by the replay engine.
///
/// Implementations own their synchronization; the engine only ever calls
/// these and never reads anything back.
#[async_trait::async_trait]
pub trait ObservationSink: Send + Sync {
    async fn on_observation(&self, record: &EnrichedObservation) -> Result<()>;

    async fn on_day_reset(&self, timestamp: NaiveDateTime, summary: &DaySummary) -> Result<()>;

    async fn on_midnight_reset(&self, timestamp: NaiveDateTime) -> Result<()>;

    async fn on_9am_reset(&self, timestamp: NaiveDateTime) -> Result<()>;

    async fn on_snow_hour_reset(&self, timestamp: NaiveDateTime) -> Result<()>;
}
