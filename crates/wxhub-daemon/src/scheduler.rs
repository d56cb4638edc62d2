//! One worker per station driver: backfill, then live polling

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};
use wxhub_config::StationConfig;
use wxhub_core::{LocalClock, ObservationSink};
use wxhub_ingest::StationDriver;
use wxhub_replay::{AccumulatorConfig, BoundaryConfig, DstRule, ReplayConfig, ReplayEngine, ReplayError};

/// Pause after a failed live poll or sink write before polling again
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Resolves once shutdown is signalled or the sender is gone
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

pub fn replay_config(station: &StationConfig, clock: LocalClock) -> ReplayConfig {
    ReplayConfig {
        boundaries: BoundaryConfig {
            rollover_hour: station.rollover_hour,
            use_10am_in_summer: station.use_10am_in_summer,
            snow_hour: station.snow_depth_hour,
            dst: DstRule::Clock(clock),
        },
        accumulators: AccumulatorConfig {
            wind_unit: station.units.wind,
            heating_base: station.heating_base,
            cooling_base: station.cooling_base,
            chill_threshold: station.chill_hour_threshold,
            chill_season_start_month: station.chill_hour_season_start,
        },
        default_interval_minutes: station.log_interval_minutes,
    }
}

/// Spawns driver workers sharing one sink and, optionally, one backfill gate
pub struct Scheduler {
    sink: Arc<dyn ObservationSink>,
    replay: ReplayConfig,
    last_update: Option<NaiveDateTime>,
    backfill_gate: Option<Arc<Semaphore>>,
    shutdown: watch::Receiver<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(
        sink: Arc<dyn ObservationSink>,
        replay: ReplayConfig,
        last_update: Option<NaiveDateTime>,
        serialize_backfill: bool,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            sink,
            replay,
            last_update,
            backfill_gate: serialize_backfill.then(|| Arc::new(Semaphore::new(1))),
            shutdown,
            workers: Vec::new(),
        }
    }

    pub fn spawn(&mut self, driver: Box<dyn StationDriver>) {
        let engine = ReplayEngine::new(driver.name(), self.replay, self.sink.clone());
        let worker = Worker {
            driver,
            engine,
            since: self.last_update,
            gate: self.backfill_gate.clone(),
            shutdown: self.shutdown.clone(),
        };
        self.workers.push(tokio::spawn(worker.run()));
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Wait for every worker to finish
    pub async fn join(self) {
        for handle in self.workers {
            if let Err(e) = handle.await {
                error!(error = %e, "driver worker panicked");
            }
        }
    }
}

struct Worker {
    driver: Box<dyn StationDriver>,
    engine: ReplayEngine,
    since: Option<NaiveDateTime>,
    gate: Option<Arc<Semaphore>>,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    #[instrument(skip(self), fields(driver = %self.driver.name()))]
    async fn run(mut self) {
        if let Err(e) = self.driver.start().await {
            error!(error = %e, "driver failed to start");
            return;
        }
        info!("driver started");

        let live = match self.backfill().await {
            Ok(live) => live,
            Err(e) => {
                error!(error = %e, "backfill failed");
                false
            }
        };
        if live {
            if let Err(e) = self.live().await {
                error!(error = %e, "live ingestion stopped");
            }
        }

        if let Err(e) = self.driver.stop().await {
            warn!(error = %e, "error stopping driver");
        }
        info!("driver stopped");
    }

    /// Returns whether the worker should go on to live polling
    async fn backfill(&mut self) -> Result<bool> {
        self.engine.begin_backfill()?;
        let _permit = match self.gate.clone() {
            Some(gate) => tokio::select! {
                permit = gate.acquire_owned() => Some(permit.context("backfill gate closed")?),
                _ = shutdown_requested(&mut self.shutdown) => {
                    info!("shutdown while waiting for backfill gate");
                    return Ok(false);
                }
            },
            None => None,
        };
        if *self.shutdown.borrow() {
            return Ok(false);
        }

        let backlog = match self.driver.fetch_backlog(self.since).await {
            Ok(backlog) => backlog,
            Err(e) if e.is_fatal() => {
                error!(error = %e, "driver rejected by remote end");
                return Ok(false);
            }
            Err(e) => {
                warn!(error = %e, "backlog unavailable, continuing live");
                Vec::new()
            }
        };
        let stats = self.engine.replay(backlog).await?;
        info!(published = stats.published, skipped = stats.skipped, "backfill complete");
        self.engine.go_live()?;
        Ok(true)
    }

    async fn live(&mut self) -> Result<()> {
        loop {
            if *self.shutdown.borrow() {
                return Ok(());
            }
            let polled = tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                    continue;
                }
                polled = self.driver.get_observation() => polled,
            };
            match polled {
                Ok(Some(obs)) => {
                    let timestamp = obs.timestamp;
                    match self.engine.ingest_live(obs).await {
                        Ok(_) => {}
                        Err(ReplayError::Sink(e)) => {
                            warn!(%timestamp, error = %e, "sink rejected live record");
                            tokio::time::sleep(ERROR_BACKOFF).await;
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                Ok(None) => {}
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "driver rejected by remote end");
                    return Ok(());
                }
                Err(e) => {
                    warn!(error = %e, "live poll failed");
                    tokio::time::sleep(ERROR_BACKOFF).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, NaiveDate};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wxhub_core::Observation;
    use wxhub_ingest::{IngestResult, ProtocolFatal};
    use wxhub_sinks::MemorySink;

    fn at(minutes: i64) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 6, 12)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap()
            + ChronoDuration::minutes(minutes)
    }

    enum Live {
        Obs(Observation),
        Fatal,
    }

    struct FakeDriver {
        name: String,
        backlog: Vec<Observation>,
        live: VecDeque<Live>,
        in_backfill: Arc<AtomicUsize>,
        max_in_backfill: Arc<AtomicUsize>,
        active: bool,
    }

    impl FakeDriver {
        fn new(name: &str, backlog: Vec<Observation>, live: Vec<Live>) -> Self {
            Self {
                name: name.to_string(),
                backlog,
                live: live.into(),
                in_backfill: Arc::new(AtomicUsize::new(0)),
                max_in_backfill: Arc::new(AtomicUsize::new(0)),
                active: false,
            }
        }
    }

    #[async_trait::async_trait]
    impl StationDriver for FakeDriver {
        fn name(&self) -> &str {
            &self.name
        }

        async fn start(&mut self) -> IngestResult<()> {
            self.active = true;
            Ok(())
        }

        async fn stop(&mut self) -> IngestResult<()> {
            self.active = false;
            Ok(())
        }

        async fn fetch_backlog(&mut self, since: Option<NaiveDateTime>) -> IngestResult<Vec<Observation>> {
            let now = self.in_backfill.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_backfill.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_backfill.fetch_sub(1, Ordering::SeqCst);
            Ok(self
                .backlog
                .iter()
                .filter(|o| since.map_or(true, |s| o.timestamp > s))
                .cloned()
                .collect())
        }

        async fn get_observation(&mut self) -> IngestResult<Option<Observation>> {
            match self.live.pop_front() {
                Some(Live::Obs(obs)) => Ok(Some(obs)),
                Some(Live::Fatal) => Err(ProtocolFatal::Unauthorized("revoked".into()).into()),
                None => {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    Ok(None)
                }
            }
        }

        fn is_active(&self) -> bool {
            self.active
        }
    }

    fn scheduler(sink: Arc<dyn ObservationSink>, since: Option<NaiveDateTime>, serialize: bool) -> (Scheduler, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let scheduler = Scheduler::new(sink, ReplayConfig::default(), since, serialize, rx);
        (scheduler, tx)
    }

    #[tokio::test]
    async fn backfill_then_live_until_fatal() {
        let sink = Arc::new(MemorySink::new());
        let (mut scheduler, _tx) = scheduler(sink.clone(), Some(at(0)), true);
        let driver = FakeDriver::new(
            "roof",
            vec![Observation::new(at(0)), Observation::new(at(5)), Observation::new(at(10))],
            vec![
                Live::Obs(Observation::new(at(15))),
                Live::Obs(Observation::new(at(15))),
                Live::Obs(Observation::new(at(20))),
                Live::Fatal,
            ],
        );
        scheduler.spawn(Box::new(driver));
        scheduler.join().await;

        let published: Vec<NaiveDateTime> = sink
            .observations()
            .await
            .iter()
            .map(|o| o.observation.timestamp)
            .collect();
        assert_eq!(published, vec![at(5), at(10), at(15), at(20)]);
    }

    #[tokio::test]
    async fn shutdown_stops_idle_worker() {
        let sink = Arc::new(MemorySink::new());
        let (mut scheduler, tx) = scheduler(sink.clone(), None, false);
        scheduler.spawn(Box::new(FakeDriver::new("quiet", Vec::new(), Vec::new())));
        assert_eq!(scheduler.worker_count(), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), scheduler.join())
            .await
            .unwrap();
        assert!(sink.observations().await.is_empty());
    }

    #[tokio::test]
    async fn serialized_backfills_never_overlap() {
        let sink = Arc::new(MemorySink::new());
        let (mut scheduler, tx) = scheduler(sink.clone(), None, true);
        let in_backfill = Arc::new(AtomicUsize::new(0));
        let max_in_backfill = Arc::new(AtomicUsize::new(0));
        for name in ["a", "b", "c"] {
            let mut driver = FakeDriver::new(name, vec![Observation::new(at(0))], Vec::new());
            driver.in_backfill = in_backfill.clone();
            driver.max_in_backfill = max_in_backfill.clone();
            scheduler.spawn(Box::new(driver));
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        tx.send(true).unwrap();
        scheduler.join().await;

        assert_eq!(max_in_backfill.load(Ordering::SeqCst), 1);
        assert_eq!(sink.observations().await.len(), 3);
    }

    /// Fails the first `failures` observation writes
    struct FlakySink {
        inner: MemorySink,
        failures: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ObservationSink for FlakySink {
        async fn on_observation(&self, record: &wxhub_core::EnrichedObservation) -> anyhow::Result<()> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                anyhow::bail!("disk full");
            }
            self.inner.on_observation(record).await
        }

        async fn on_day_reset(&self, timestamp: NaiveDateTime, summary: &wxhub_core::DaySummary) -> anyhow::Result<()> {
            self.inner.on_day_reset(timestamp, summary).await
        }

        async fn on_midnight_reset(&self, timestamp: NaiveDateTime) -> anyhow::Result<()> {
            self.inner.on_midnight_reset(timestamp).await
        }

        async fn on_9am_reset(&self, timestamp: NaiveDateTime) -> anyhow::Result<()> {
            self.inner.on_9am_reset(timestamp).await
        }

        async fn on_snow_hour_reset(&self, timestamp: NaiveDateTime) -> anyhow::Result<()> {
            self.inner.on_snow_hour_reset(timestamp).await
        }
    }

    #[tokio::test]
    async fn sink_failure_does_not_stop_live_polling() {
        let sink = Arc::new(FlakySink {
            inner: MemorySink::new(),
            failures: AtomicUsize::new(1),
        });
        let (mut scheduler, _tx) = scheduler(sink.clone(), None, false);
        let driver = FakeDriver::new(
            "mast",
            Vec::new(),
            vec![
                Live::Obs(Observation::new(at(0))),
                Live::Obs(Observation::new(at(5))),
                Live::Obs(Observation::new(at(10))),
                Live::Fatal,
            ],
        );
        scheduler.spawn(Box::new(driver));
        tokio::time::timeout(Duration::from_secs(5), scheduler.join())
            .await
            .unwrap();

        let published: Vec<NaiveDateTime> = sink
            .inner
            .observations()
            .await
            .iter()
            .map(|o| o.observation.timestamp)
            .collect();
        assert_eq!(published, vec![at(5), at(10)]);
    }

    #[tokio::test]
    async fn shutdown_while_waiting_for_backfill_gate() {
        let sink: Arc<dyn ObservationSink> = Arc::new(MemorySink::new());
        let (tx, rx) = watch::channel(false);
        let gate = Arc::new(Semaphore::new(1));
        let _held = gate.clone().acquire_owned().await.unwrap();
        let mut worker = Worker {
            driver: Box::new(FakeDriver::new("yard", vec![Observation::new(at(0))], Vec::new())),
            engine: ReplayEngine::new("yard", ReplayConfig::default(), sink),
            since: None,
            gate: Some(gate),
            shutdown: rx,
        };
        let waiting = tokio::spawn(async move { worker.backfill().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        let live = tokio::time::timeout(Duration::from_secs(2), waiting)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!live);
    }

    #[test]
    fn replay_config_from_station() {
        let station = StationConfig {
            rollover_hour: 9,
            snow_depth_hour: 6,
            ..StationConfig::default()
        };
        let config = replay_config(&station, LocalClock::System);
        assert_eq!(config.boundaries.rollover_hour, 9);
        assert_eq!(config.boundaries.snow_hour, 6);
        assert_eq!(config.default_interval_minutes, 5);
    }
}
