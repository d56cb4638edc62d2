//! Live ingestion: the per-record step without the backlog loop

use tracing::{debug, warn};
use wxhub_core::{EnrichedObservation, Observation};

use crate::{EngineState, ReplayEngine, ReplayError, ReplayResult};

impl ReplayEngine {
    /// Step one freshly decoded observation.
    ///
    /// Returns `Ok(None)` when the record was rejected as a duplicate or out
    /// of order, which happens when a live feed repeats its last reading.
    pub async fn ingest_live(&mut self, obs: Observation) -> ReplayResult<Option<EnrichedObservation>> {
        if self.state() != EngineState::Live {
            return Err(ReplayError::NotRunning(self.state()));
        }
        match self.step(obs).await {
            Ok(record) => Ok(Some(record)),
            Err(e @ ReplayError::Duplicate(_)) => {
                debug!(station = %self.station(), error = %e, "live reading repeated");
                Ok(None)
            }
            Err(e) if e.is_record_error() => {
                warn!(station = %self.station(), error = %e, "dropping live record");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, NaiveDate, NaiveDateTime};
    use wxhub_core::Observation;

    use crate::engine::recording::RecordingSink;
    use crate::{EngineState, ReplayConfig, ReplayEngine, ReplayError};

    fn at(minutes: i64) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 6, 1)
            .unwrap()
            .and_hms_opt(23, 50, 0)
            .unwrap()
            + Duration::minutes(minutes)
    }

    #[tokio::test]
    async fn test_live_continues_from_backlog() {
        let sink = Arc::new(RecordingSink::default());
        let mut engine = ReplayEngine::new("garden", ReplayConfig::default(), sink.clone());
        engine.begin_backfill().unwrap();

        let mut first = Observation::new(at(0));
        first.rain_counter = Some(10.0);
        engine.replay(vec![first]).await.unwrap();
        engine.go_live().unwrap();

        let mut live = Observation::new(at(5));
        live.rain_counter = Some(10.5);
        let record = engine.ingest_live(live.clone()).await.unwrap().unwrap();
        assert!((record.observation.rain_rate.unwrap() - 6.0).abs() < 1e-9);
        assert!((record.rain_today - 0.5).abs() < 1e-9);

        // repeated reading is swallowed
        assert_eq!(engine.ingest_live(live).await.unwrap(), None);

        // crossing midnight on the live path fires the rollover
        let mut next = Observation::new(at(10));
        next.rain_counter = Some(10.5);
        let record = engine.ingest_live(next).await.unwrap().unwrap();
        assert_eq!(record.rain_today, 0.0);
        let resets = sink.day_resets();
        assert_eq!(resets.len(), 1);
        assert!((resets[0].1.rain - 0.5).abs() < 1e-9);
        assert_eq!(sink.observations().len(), 3);
    }

    #[tokio::test]
    async fn test_live_requires_live_state() {
        let sink = Arc::new(RecordingSink::default());
        let mut engine = ReplayEngine::new("garden", ReplayConfig::default(), sink);
        engine.begin_backfill().unwrap();
        assert!(matches!(
            engine.ingest_live(Observation::new(at(0))).await,
            Err(ReplayError::NotRunning(EngineState::Backfilling))
        ));
    }
}
