//! Periodic availability simulation and broadcast.
//!
//! Every period each stored facility drifts by a small random amount, is
//! persisted, occasionally snapshotted into history, and announced to
//! observers. One facility failing never aborts the rest of the cycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use common::config::BroadcastConfig;
use common::{ChangeEvent, Facility, HistoricalRecord, Result};
use rand::rngs::StdRng;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::TieredCache;
use crate::store::RecordStore;
use crate::subscriptions::{Broadcaster, Scope};

/// Outcome of one pass over all facilities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub updated: usize,
    pub recorded: usize,
    pub failed: usize,
    pub delivered: usize,
}

struct SchedulerInner {
    store: Arc<dyn RecordStore>,
    cache: Arc<TieredCache>,
    broadcaster: Arc<dyn Broadcaster>,
    config: BroadcastConfig,
    rng: Mutex<StdRng>,
    in_cycle: AtomicBool,
}

/// Clears the in-cycle flag however the cycle ends.
struct CycleGuard<'a>(&'a AtomicBool);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl SchedulerInner {
    fn delta(&self) -> (i64, bool) {
        let max = self.config.max_delta.abs();
        let p = self.config.history_probability.clamp(0.0, 1.0);
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        (rng.gen_range(-max..=max), rng.gen_bool(p))
    }

    async fn run_cycle(&self) -> Option<CycleReport> {
        if self
            .in_cycle
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Broadcast cycle already running; skipping");
            return None;
        }
        let _guard = CycleGuard(&self.in_cycle);

        let ids: Vec<String> = match self.store.find_all_facilities().await {
            Ok(f) => f.into_iter().map(|f| f.id).collect(),
            Err(e) => {
                warn!("Broadcast cycle could not load facilities: {}", e);
                return Some(CycleReport::default());
            }
        };

        let mut report = CycleReport::default();
        for id in ids {
            match self.step(&id, &mut report).await {
                Ok(true) => report.updated += 1,
                Ok(false) => debug!("Facility {} removed mid-cycle", id),
                Err(e) => {
                    report.failed += 1;
                    warn!("Broadcast update failed for {}: {}", id, e);
                }
            }
        }

        debug!(
            "Broadcast cycle: updated={} recorded={} failed={} delivered={}",
            report.updated, report.recorded, report.failed, report.delivered
        );
        Some(report)
    }

    /// Drift one facility from its current stored state. `false` if it no
    /// longer exists.
    async fn step(&self, id: &str, report: &mut CycleReport) -> Result<bool> {
        let (delta, record) = self.delta();
        let now = Utc::now();
        let drift = move |f: &mut Facility| {
            f.set_available(i64::from(f.available_spots) + delta, now);
        };

        let Some(facility) = self.store.modify_facility(id, &drift).await? else {
            return Ok(false);
        };
        self.cache.refresh_facility(&facility);

        if record {
            let snapshot = HistoricalRecord::capture(Uuid::new_v4().to_string(), &facility, now);
            match self.store.create_record(snapshot).await {
                Ok(()) => report.recorded += 1,
                Err(e) => warn!("History capture failed for {}: {}", facility.id, e),
            }
        }

        report.delivered += self
            .broadcaster
            .publish(
                &ChangeEvent::from_facility(&facility),
                Scope::for_change(self.config.fan_out, &facility.id),
            )
            .await;
        Ok(true)
    }
}

/// Self-scheduling broadcast job with start/stop lifecycle.
pub struct BroadcastScheduler {
    inner: Arc<SchedulerInner>,
    task: Mutex<Option<(JoinHandle<()>, watch::Sender<bool>)>>,
}

impl BroadcastScheduler {
    pub fn new(
        store: Arc<dyn RecordStore>,
        cache: Arc<TieredCache>,
        broadcaster: Arc<dyn Broadcaster>,
        config: BroadcastConfig,
        rng: StdRng,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                store,
                cache,
                broadcaster,
                config,
                rng: Mutex::new(rng),
                in_cycle: AtomicBool::new(false),
            }),
            task: Mutex::new(None),
        }
    }

    pub fn period(&self) -> Duration {
        Duration::from_secs(self.inner.config.interval_secs.max(1))
    }

    /// Run one cycle now. `None` if a cycle is already in flight.
    pub async fn run_cycle(&self) -> Option<CycleReport> {
        self.inner.run_cycle().await
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Spawn the periodic loop. Returns false if already started.
    ///
    /// The first cycle runs one period after start. A cycle that outruns
    /// its period makes the loop skip to the next due tick.
    pub fn start(&self) -> bool {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            return false;
        }

        let period = self.period();
        let inner = Arc::clone(&self.inner);
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        inner.run_cycle().await;
                    }
                    _ = stop_rx.changed() => break,
                }
            }
            debug!("Broadcast loop exited");
        });

        info!("Broadcast scheduler started (period {:?})", period);
        *task = Some((handle, stop_tx));
        true
    }

    /// Stop the loop, letting an in-flight cycle finish first.
    pub async fn stop(&self) {
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some((handle, stop_tx)) = task {
            let _ = stop_tx.send(true);
            if let Err(e) = handle.await {
                warn!("Broadcast loop ended abnormally: {}", e);
            }
            info!("Broadcast scheduler stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{HistoryQuery, MemoryStore};
    use crate::subscriptions::SubscriptionRegistry;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use common::config::FanOut;
    use common::{Error, GeoPoint, PredictionCacheEntry, SensorReading};
    use rand::SeedableRng;
    use std::sync::atomic::AtomicUsize;

    fn facility(id: &str, total: u32, available: u32) -> Facility {
        Facility {
            id: id.into(),
            name: format!("Lot {id}"),
            total_spots: total,
            available_spots: available,
            location: GeoPoint::new(0.0, 0.0),
            last_update: Utc::now(),
            predicted_spots: None,
            confidence: None,
            sensors: Vec::new(),
        }
    }

    fn scheduler(
        store: Arc<dyn RecordStore>,
        registry: Arc<SubscriptionRegistry>,
        config: BroadcastConfig,
    ) -> BroadcastScheduler {
        BroadcastScheduler::new(
            store,
            Arc::new(TieredCache::from_config(&Default::default())),
            registry,
            config,
            StdRng::seed_from_u64(42),
        )
    }

    /// Store whose updates fail for one facility id.
    struct FlakyStore {
        inner: MemoryStore,
        poisoned: String,
        updates: AtomicUsize,
    }

    #[async_trait]
    impl RecordStore for FlakyStore {
        async fn create_facility(&self, f: Facility) -> Result<Facility> {
            self.inner.create_facility(f).await
        }
        async fn find_facility(&self, id: &str) -> Result<Option<Facility>> {
            self.inner.find_facility(id).await
        }
        async fn find_all_facilities(&self) -> Result<Vec<Facility>> {
            self.inner.find_all_facilities().await
        }
        async fn update_facility(&self, f: &Facility) -> Result<()> {
            self.updates.fetch_add(1, Ordering::SeqCst);
            if f.id == self.poisoned {
                return Err(Error::Store("connection reset".into()));
            }
            self.inner.update_facility(f).await
        }
        async fn delete_facility(&self, id: &str) -> Result<bool> {
            self.inner.delete_facility(id).await
        }
        async fn create_record(&self, r: HistoricalRecord) -> Result<()> {
            self.inner.create_record(r).await
        }
        async fn find_records(&self, q: &HistoryQuery) -> Result<Vec<HistoricalRecord>> {
            self.inner.find_records(q).await
        }
        async fn create_prediction(&self, e: PredictionCacheEntry) -> Result<()> {
            self.inner.create_prediction(e).await
        }
        async fn find_unexpired_prediction(
            &self,
            id: &str,
            window: DateTime<Utc>,
            now: DateTime<Utc>,
        ) -> Result<Option<PredictionCacheEntry>> {
            self.inner.find_unexpired_prediction(id, window, now).await
        }
    }


    /// Store that lands an inbound write while the cycle edits `trigger`.
    struct InterleavedStore {
        inner: MemoryStore,
        trigger: String,
        inbound: Mutex<Option<Facility>>,
    }

    #[async_trait]
    impl RecordStore for InterleavedStore {
        async fn create_facility(&self, f: Facility) -> Result<Facility> {
            self.inner.create_facility(f).await
        }
        async fn find_facility(&self, id: &str) -> Result<Option<Facility>> {
            self.inner.find_facility(id).await
        }
        async fn find_all_facilities(&self) -> Result<Vec<Facility>> {
            self.inner.find_all_facilities().await
        }
        async fn delete_facility(&self, id: &str) -> Result<bool> {
            self.inner.delete_facility(id).await
        }
        async fn create_record(&self, r: HistoricalRecord) -> Result<()> {
            self.inner.create_record(r).await
        }
        async fn find_records(&self, q: &HistoryQuery) -> Result<Vec<HistoricalRecord>> {
            self.inner.find_records(q).await
        }
        async fn create_prediction(&self, e: PredictionCacheEntry) -> Result<()> {
            self.inner.create_prediction(e).await
        }
        async fn find_unexpired_prediction(
            &self,
            id: &str,
            window: DateTime<Utc>,
            now: DateTime<Utc>,
        ) -> Result<Option<PredictionCacheEntry>> {
            self.inner.find_unexpired_prediction(id, window, now).await
        }
        async fn update_facility(&self, f: &Facility) -> Result<()> {
            self.inner.update_facility(f).await
        }
        async fn modify_facility(
            &self,
            id: &str,
            edit: &(dyn for<'f> Fn(&'f mut Facility) + Send + Sync),
        ) -> Result<Option<Facility>> {
            if id == self.trigger {
                let inbound = self.inbound.lock().unwrap().take();
                if let Some(f) = inbound {
                    self.inner.update_facility(&f).await?;
                }
            }
            self.inner.modify_facility(id, edit).await
        }
    }

    /// Store whose writes take longer than a broadcast period.
    struct SlowStore {
        inner: MemoryStore,
        delay: Duration,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        completed: AtomicUsize,
    }

    #[async_trait]
    impl RecordStore for SlowStore {
        async fn create_facility(&self, f: Facility) -> Result<Facility> {
            self.inner.create_facility(f).await
        }
        async fn find_facility(&self, id: &str) -> Result<Option<Facility>> {
            self.inner.find_facility(id).await
        }
        async fn find_all_facilities(&self) -> Result<Vec<Facility>> {
            self.inner.find_all_facilities().await
        }
        async fn delete_facility(&self, id: &str) -> Result<bool> {
            self.inner.delete_facility(id).await
        }
        async fn create_record(&self, r: HistoricalRecord) -> Result<()> {
            self.inner.create_record(r).await
        }
        async fn find_records(&self, q: &HistoryQuery) -> Result<Vec<HistoricalRecord>> {
            self.inner.find_records(q).await
        }
        async fn create_prediction(&self, e: PredictionCacheEntry) -> Result<()> {
            self.inner.create_prediction(e).await
        }
        async fn find_unexpired_prediction(
            &self,
            id: &str,
            window: DateTime<Utc>,
            now: DateTime<Utc>,
        ) -> Result<Option<PredictionCacheEntry>> {
            self.inner.find_unexpired_prediction(id, window, now).await
        }
        async fn update_facility(&self, f: &Facility) -> Result<()> {
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(current, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.completed.fetch_add(1, Ordering::SeqCst);
            self.inner.update_facility(f).await
        }
    }

    #[tokio::test]
    async fn test_cycles_keep_bounds_and_emit_every_facility() {
        let store = Arc::new(MemoryStore::new());
        store.create_facility(facility("empty", 10, 0)).await.unwrap();
        store.create_facility(facility("full", 10, 10)).await.unwrap();
        store.create_facility(facility("mid", 200, 100)).await.unwrap();

        let registry = Arc::new(SubscriptionRegistry::new());
        let mut rx = registry.connect("observer");
        let job = scheduler(store.clone(), registry, BroadcastConfig::default());

        for _ in 0..50 {
            let report = job.run_cycle().await.unwrap();
            assert_eq!(report.updated, 3);
            assert_eq!(report.delivered, 3);
            for f in store.find_all_facilities().await.unwrap() {
                assert!(f.available_spots <= f.total_spots);
            }
        }

        let mut events = 0;
        while rx.try_recv().is_ok() {
            events += 1;
        }
        assert_eq!(events, 150);
    }

    #[tokio::test]
    async fn test_history_probability_extremes() {
        let store = Arc::new(MemoryStore::new());
        store.create_facility(facility("a", 10, 5)).await.unwrap();
        let registry = Arc::new(SubscriptionRegistry::new());

        let never = BroadcastConfig {
            history_probability: 0.0,
            ..BroadcastConfig::default()
        };
        let report = scheduler(store.clone(), registry.clone(), never)
            .run_cycle()
            .await
            .unwrap();
        assert_eq!(report.recorded, 0);
        assert_eq!(store.record_count("a").await, 0);

        let always = BroadcastConfig {
            history_probability: 1.0,
            ..BroadcastConfig::default()
        };
        let job = scheduler(store.clone(), registry, always);
        job.run_cycle().await.unwrap();
        job.run_cycle().await.unwrap();
        assert_eq!(store.record_count("a").await, 2);
    }

    #[tokio::test]
    async fn test_failed_facility_does_not_abort_cycle() {
        let inner = MemoryStore::new();
        for id in ["a", "b", "c"] {
            inner.create_facility(facility(id, 10, 5)).await.unwrap();
        }
        let store = Arc::new(FlakyStore {
            inner,
            poisoned: "b".into(),
            updates: AtomicUsize::new(0),
        });
        let registry = Arc::new(SubscriptionRegistry::new());
        let mut rx = registry.connect("observer");

        let report = scheduler(store.clone(), registry, BroadcastConfig::default())
            .run_cycle()
            .await
            .unwrap();

        assert_eq!(store.updates.load(Ordering::SeqCst), 3);
        assert_eq!(report.updated, 2);
        assert_eq!(report.failed, 1);
        let mut ids = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            ids.push(ev.facility_id);
        }
        assert_eq!(ids, vec!["a".to_string(), "c".to_string()]);
    }

    #[tokio::test]
    async fn test_subscribed_fan_out_scopes_events() {
        let store = Arc::new(MemoryStore::new());
        store.create_facility(facility("a", 10, 5)).await.unwrap();
        store.create_facility(facility("b", 10, 5)).await.unwrap();
        let registry = Arc::new(SubscriptionRegistry::new());
        let mut rx = registry.connect("watcher");
        registry.subscribe("watcher", "b");

        let config = BroadcastConfig {
            fan_out: FanOut::Subscribed,
            ..BroadcastConfig::default()
        };
        scheduler(store, registry, config).run_cycle().await.unwrap();

        assert_eq!(rx.try_recv().unwrap().facility_id, "b");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_inbound_update_mid_cycle_survives() {
        let inner = MemoryStore::new();
        inner.create_facility(facility("a", 100, 50)).await.unwrap();
        inner.create_facility(facility("b", 100, 50)).await.unwrap();
        let mut inbound = facility("b", 100, 0);
        inbound.sensors = vec![SensorReading {
            sensor_id: "bay-1".into(),
            occupied: true,
            read_at: None,
        }];
        let store = Arc::new(InterleavedStore {
            inner,
            trigger: "a".into(),
            inbound: Mutex::new(Some(inbound)),
        });

        let config = BroadcastConfig {
            max_delta: 0,
            history_probability: 0.0,
            ..BroadcastConfig::default()
        };
        let report = scheduler(store.clone(), Arc::new(SubscriptionRegistry::new()), config)
            .run_cycle()
            .await
            .unwrap();

        assert_eq!(report.updated, 2);
        let b = store.find_facility("b").await.unwrap().unwrap();
        assert_eq!(b.available_spots, 0);
        assert_eq!(b.sensors.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_outrunning_period_is_not_overlapped() {
        let inner = MemoryStore::new();
        inner.create_facility(facility("a", 10, 5)).await.unwrap();
        let store = Arc::new(SlowStore {
            inner,
            delay: Duration::from_secs(45),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
        });
        let job = scheduler(
            store.clone(),
            Arc::new(SubscriptionRegistry::new()),
            BroadcastConfig::default(),
        );
        assert!(job.start());

        // First cycle starts at 30s and is still writing at 50s.
        tokio::time::sleep(Duration::from_secs(50)).await;
        assert_eq!(store.in_flight.load(Ordering::SeqCst), 1);
        assert!(job.run_cycle().await.is_none());

        tokio::time::sleep(Duration::from_secs(150)).await;
        job.stop().await;
        assert_eq!(store.peak.load(Ordering::SeqCst), 1);
        assert!(store.completed.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_runs_on_period_and_stop_halts() {
        let store = Arc::new(MemoryStore::new());
        store.create_facility(facility("a", 10, 5)).await.unwrap();
        let registry = Arc::new(SubscriptionRegistry::new());
        let mut rx = registry.connect("observer");
        let job = scheduler(store, registry, BroadcastConfig::default());

        assert!(job.start());
        assert!(!job.start());

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(32)).await;
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());

        job.stop().await;
        assert!(!job.is_running());
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(rx.try_recv().is_err());
    }
}
