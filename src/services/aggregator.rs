//! Aggregation and crash-safe flushing
//!
//! All feed pipelines fold into one aggregator over a bounded channel.
//! The aggregator accumulates hour-bucketed state under per-key locks,
//! drains it into UUIDv7-tagged deltas on a flush cadence, and pushes
//! the deltas through the persistence gateway with bounded retries.
//!
//! Flush is idempotent: every delta id is checked against the applied
//! watermark before the upsert, so a delta replayed after a retry, a
//! spill recovery, or a crash is skipped rather than double-counted.
//! When the gateway stays down past the failure budget, buffered deltas
//! are spilled to a JSONL log and replayed on the next startup.

use crate::domain::bucket::{BucketDelta, BucketKey, HourlyBucket, QueueSnapshot};
use crate::domain::dwell::DwellRecord;
use crate::infra::config::AggregatorConfig;
use crate::infra::metrics::Metrics;
use crate::io::gateway::PersistenceGateway;
use crate::io::spill::SpillLog;
use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Events flowing from feed pipelines into the aggregator
#[derive(Debug, Clone)]
pub enum AggregatorEvent {
    /// A closed dwell interval that survived the flicker filter
    DwellClosed(DwellRecord),
    /// Entrance visitors accumulated since the feed's last release
    EntranceDelta { key: BucketKey, visitors: u64 },
    /// Sampled section statistics (person counts, demographics, heatmap)
    SectionSample { key: BucketKey, sample: HourlyBucket },
    /// Point-in-time cashier queue observation
    QueueSample(QueueSnapshot),
}

/// Accumulated aggregate state shared between ingest and flush.
///
/// The bucket map is a read-favored registry of per-key accumulators;
/// mutation of any one bucket takes only that bucket's lock, so feeds
/// folding into different hours or sections never contend.
pub struct AggregatorState {
    buckets: RwLock<FxHashMap<BucketKey, Arc<Mutex<HourlyBucket>>>>,
    /// Delta ids already applied through the gateway. Ordered so the
    /// oldest ids (UUIDv7 sorts by creation time) can be evicted once
    /// the set outgrows the configured capacity.
    applied: Mutex<BTreeSet<Uuid>>,
    /// Drained deltas not yet durably applied, oldest first
    unflushed: Mutex<VecDeque<BucketDelta>>,
    pending_dwell: Mutex<Vec<DwellRecord>>,
    pending_queue: Mutex<Vec<QueueSnapshot>>,
}

impl AggregatorState {
    fn new() -> Self {
        Self {
            buckets: RwLock::new(FxHashMap::default()),
            applied: Mutex::new(BTreeSet::new()),
            unflushed: Mutex::new(VecDeque::new()),
            pending_dwell: Mutex::new(Vec::new()),
            pending_queue: Mutex::new(Vec::new()),
        }
    }

    fn bucket(&self, key: &BucketKey) -> Arc<Mutex<HourlyBucket>> {
        if let Some(bucket) = self.buckets.read().get(key) {
            return Arc::clone(bucket);
        }
        let mut map = self.buckets.write();
        Arc::clone(map.entry(key.clone()).or_default())
    }

    /// Drain every non-empty accumulator into tagged deltas
    fn drain_buckets(&self) -> Vec<BucketDelta> {
        let map = self.buckets.read();
        let mut deltas = Vec::new();
        let mut keys: Vec<&BucketKey> = map.keys().collect();
        keys.sort();
        for key in keys {
            let mut bucket = map[key].lock();
            if !bucket.is_empty() {
                deltas.push(bucket.take_delta(key.clone()));
            }
        }
        deltas
    }
}

/// Commands accepted on the aggregator's control channel
#[derive(Debug, Clone, Copy)]
pub enum ControlCommand {
    /// Flush immediately instead of waiting for the next cadence tick
    FlushNow,
}

/// Cloneable handle for nudging a running aggregator
#[derive(Clone)]
pub struct AggregatorHandle {
    control_tx: mpsc::Sender<ControlCommand>,
}

impl AggregatorHandle {
    pub async fn flush_now(&self) {
        // A full control queue already has a flush pending
        let _ = self.control_tx.try_send(ControlCommand::FlushNow);
    }
}

pub struct Aggregator {
    cfg: AggregatorConfig,
    gateway: Arc<dyn PersistenceGateway>,
    state: Arc<AggregatorState>,
    spill: SpillLog,
    metrics: Arc<Metrics>,
    consecutive_failures: AtomicU32,
    /// True while the spill log holds copies of deltas queued in
    /// memory; the log may only be cleared once those are applied
    spill_recovered: AtomicBool,
    control_rx: Option<mpsc::Receiver<ControlCommand>>,
    control_tx: mpsc::Sender<ControlCommand>,
}

impl Aggregator {
    pub fn new(
        cfg: AggregatorConfig,
        gateway: Arc<dyn PersistenceGateway>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let spill = SpillLog::new(&cfg.spill_file);
        let (control_tx, control_rx) = mpsc::channel(4);
        Self {
            cfg,
            gateway,
            state: Arc::new(AggregatorState::new()),
            spill,
            metrics,
            consecutive_failures: AtomicU32::new(0),
            spill_recovered: AtomicBool::new(false),
            control_rx: Some(control_rx),
            control_tx,
        }
    }

    pub fn handle(&self) -> AggregatorHandle {
        AggregatorHandle { control_tx: self.control_tx.clone() }
    }

    /// Load deltas spilled by a previous run into the flush queue.
    /// The log keeps the durable copy until every recovered delta has
    /// gone through the gateway; a crash mid-recovery re-recovers them,
    /// and the gateway's delta-id idempotence makes the re-application
    /// harmless.
    pub fn recover_spill(&self) {
        let recovered = self.spill.read_all();
        if recovered.is_empty() {
            return;
        }
        info!(count = %recovered.len(), "spill_recovery_started");
        let mut unflushed = self.state.unflushed.lock();
        for delta in recovered {
            unflushed.push_back(delta);
        }
        drop(unflushed);
        self.spill_recovered.store(true, Ordering::Relaxed);
    }

    /// Fold one event into the accumulated state
    pub fn ingest(&self, event: AggregatorEvent) {
        match event {
            AggregatorEvent::DwellClosed(record) => {
                self.state.pending_dwell.lock().push(record);
            }
            AggregatorEvent::EntranceDelta { key, visitors } => {
                self.state.bucket(&key).lock().add_visitors(visitors);
            }
            AggregatorEvent::SectionSample { key, sample } => {
                self.state.bucket(&key).lock().merge(&sample);
            }
            AggregatorEvent::QueueSample(snapshot) => {
                self.state.pending_queue.lock().push(snapshot);
            }
        }
        self.metrics.record_event_merged();
    }

    /// One flush cycle: drain accumulators, then push everything
    /// undurable through the gateway in arrival order.
    pub async fn flush(&self) {
        self.flush_records().await;

        let drained = self.state.drain_buckets();
        {
            let mut unflushed = self.state.unflushed.lock();
            for delta in drained {
                unflushed.push_back(delta);
            }
        }

        let cycle_ok = self.flush_deltas().await;
        if cycle_ok {
            self.consecutive_failures.store(0, Ordering::Relaxed);
            self.clear_recovered_spill();
        } else {
            let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(
                consecutive = %failures,
                budget = %self.cfg.max_consecutive_failures,
                "flush_cycle_failed"
            );
            if failures >= self.cfg.max_consecutive_failures {
                self.spill_unflushed();
                self.consecutive_failures.store(0, Ordering::Relaxed);
                return;
            }
        }

        self.enforce_buffer_bound();
    }

    /// Drop the spill log once every recovered delta has been applied
    fn clear_recovered_spill(&self) {
        if !self.spill_recovered.load(Ordering::Relaxed) {
            return;
        }
        if !self.state.unflushed.lock().is_empty() {
            return;
        }
        match self.spill.clear() {
            Ok(()) => self.spill_recovered.store(false, Ordering::Relaxed),
            Err(e) => warn!(error = %e, "spill_clear_failed"),
        }
    }

    /// Write pending dwell records and queue snapshots. These streams
    /// are append-only; a failed write puts the item back for the next
    /// cycle.
    async fn flush_records(&self) {
        let dwell: Vec<DwellRecord> = std::mem::take(&mut *self.state.pending_dwell.lock());
        for (i, record) in dwell.iter().enumerate() {
            if let Err(e) = self.gateway.write_dwell(record).await {
                warn!(error = %e, remaining = %(dwell.len() - i), "dwell_write_failed");
                self.state.pending_dwell.lock().extend(dwell[i..].iter().cloned());
                break;
            }
        }

        let queue: Vec<QueueSnapshot> = std::mem::take(&mut *self.state.pending_queue.lock());
        for (i, snapshot) in queue.iter().enumerate() {
            if let Err(e) = self.gateway.write_queue(snapshot).await {
                warn!(error = %e, remaining = %(queue.len() - i), "queue_write_failed");
                self.state.pending_queue.lock().extend(queue[i..].iter().cloned());
                break;
            }
        }
    }

    /// Apply queued deltas oldest-first. Returns false if the cycle
    /// stopped on a delta that exhausted its attempts.
    async fn flush_deltas(&self) -> bool {
        loop {
            let delta = match self.state.unflushed.lock().pop_front() {
                Some(d) => d,
                None => return true,
            };

            if self.state.applied.lock().contains(&delta.delta_id) {
                debug!(delta_id = %delta.delta_id, "flush_replay_skipped");
                self.metrics.record_flush_replay_skipped();
                continue;
            }

            if self.upsert_with_retry(&delta).await {
                let mut applied = self.state.applied.lock();
                applied.insert(delta.delta_id);
                // UUIDv7 ids sort by creation time: evict the oldest
                while applied.len() > self.cfg.watermark_capacity {
                    applied.pop_first();
                }
                drop(applied);
                self.metrics.record_flush_success();
                debug!(delta_id = %delta.delta_id, bucket = %delta.key, "delta_flushed");
            } else {
                self.metrics.record_flush_failure();
                // Keep arrival order for the next cycle
                self.state.unflushed.lock().push_front(delta);
                return false;
            }
        }
    }

    async fn upsert_with_retry(&self, delta: &BucketDelta) -> bool {
        for attempt in 0..self.cfg.max_flush_attempts {
            match self.gateway.upsert_bucket(delta).await {
                Ok(()) => return true,
                Err(e) => {
                    warn!(
                        delta_id = %delta.delta_id,
                        attempt = %(attempt + 1),
                        error = %e,
                        "bucket_upsert_failed"
                    );
                    if attempt + 1 < self.cfg.max_flush_attempts {
                        let backoff = self.cfg.backoff_base_ms * (1 << attempt);
                        tokio::time::sleep(Duration::from_millis(backoff)).await;
                    }
                }
            }
        }
        false
    }

    /// Move every buffered delta to the spill log. The log is rewritten
    /// as a whole, merged with whatever it already holds minus the
    /// already-applied, so a recovered copy is replaced rather than
    /// duplicated. If even the rewrite fails the deltas stay in memory.
    fn spill_unflushed(&self) {
        let drained: Vec<BucketDelta> =
            self.state.unflushed.lock().drain(..).collect();
        if drained.is_empty() {
            return;
        }
        error!(count = %drained.len(), "flush_budget_exhausted_spilling");

        let mut on_disk = self.spill.read_all();
        {
            let applied = self.state.applied.lock();
            on_disk.retain(|d| !applied.contains(&d.delta_id));
        }
        let mut ids: FxHashSet<Uuid> = on_disk.iter().map(|d| d.delta_id).collect();
        let mut merged = on_disk;
        let mut spilled = 0u64;
        for delta in &drained {
            if ids.insert(delta.delta_id) {
                merged.push(delta.clone());
                spilled += 1;
            }
        }

        match self.spill.rewrite(&merged) {
            Ok(()) => {
                for _ in 0..spilled {
                    self.metrics.record_delta_spilled();
                }
                // The log is now the only copy; nothing in it mirrors memory
                self.spill_recovered.store(false, Ordering::Relaxed);
            }
            Err(e) => {
                error!(error = %e, "spill_rewrite_failed");
                self.state.unflushed.lock().extend(drained);
            }
        }
    }

    /// Keep the in-memory buffer bounded by spilling the overflow
    fn enforce_buffer_bound(&self) {
        let mut overflow = Vec::new();
        {
            let mut unflushed = self.state.unflushed.lock();
            while unflushed.len() > self.cfg.max_buffered_deltas {
                if let Some(delta) = unflushed.pop_front() {
                    overflow.push(delta);
                }
            }
        }
        for delta in overflow {
            match self.spill.append(&delta) {
                Ok(()) => {
                    self.metrics.record_delta_spilled();
                    // The log now holds deltas present nowhere else and
                    // must survive until the next startup recovers it
                    self.spill_recovered.store(false, Ordering::Relaxed);
                }
                Err(e) => error!(delta_id = %delta.delta_id, error = %e, "spill_append_failed"),
            }
        }
    }

    /// Run until the event channel closes or shutdown is signalled,
    /// then flush whatever remains.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<AggregatorEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        self.recover_spill();

        let mut control_rx = match self.control_rx.take() {
            Some(rx) => rx,
            // Fresh aggregators always carry their receiver; a closed
            // channel just disables the control arm
            None => mpsc::channel(1).1,
        };

        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.cfg.flush_interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The immediate first tick would flush an empty state
        ticker.tick().await;

        info!(flush_interval_s = %self.cfg.flush_interval_secs, "aggregator_started");

        let agg = Arc::new(self);
        // Serializes flush cycles; a cycle runs off the loop so event
        // ingestion continues while the gateway round-trips
        let flush_gate = Arc::new(tokio::sync::Mutex::new(()));

        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Some(event) => agg.ingest(event),
                        None => break,
                    }
                }
                _ = ticker.tick() => {
                    Arc::clone(&agg).spawn_flush(&flush_gate);
                }
                Some(ControlCommand::FlushNow) = control_rx.recv() => {
                    debug!("flush_requested");
                    Arc::clone(&agg).spawn_flush(&flush_gate);
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        // Feeds woken by the same signal are still
                        // emitting synthetic closures and final deltas;
                        // keep receiving until every sender is dropped
                        while let Some(event) = events.recv().await {
                            agg.ingest(event);
                        }
                        break;
                    }
                }
            }
        }

        // Drain anything still queued, wait out any in-flight cycle,
        // then run the final flush synchronously
        while let Ok(event) = events.try_recv() {
            agg.ingest(event);
        }
        let _flushing = flush_gate.lock().await;
        agg.flush().await;

        let remaining = agg.state.unflushed.lock().len();
        if remaining > 0 {
            error!(count = %remaining, "shutdown_with_unflushed_deltas");
            agg.spill_unflushed();
        }
        info!("aggregator_stopped");
    }

    /// Start a flush cycle as its own task. A request landing while a
    /// cycle is already in flight is skipped; that cycle covers it.
    fn spawn_flush(self: Arc<Self>, gate: &Arc<tokio::sync::Mutex<()>>) {
        let gate = Arc::clone(gate);
        tokio::spawn(async move {
            if let Ok(_flushing) = gate.try_lock() {
                self.flush().await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::gateway::MemoryGateway;
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;

    fn cfg(spill: &std::path::Path) -> AggregatorConfig {
        AggregatorConfig {
            flush_interval_secs: 30,
            max_flush_attempts: 2,
            backoff_base_ms: 1,
            max_consecutive_failures: 2,
            max_buffered_deltas: 8,
            watermark_capacity: 64,
            spill_file: spill.join("spill.jsonl").to_str().unwrap().to_string(),
        }
    }

    fn key(hour: u32) -> BucketKey {
        let ts = Utc.with_ymd_and_hms(2025, 3, 14, hour, 0, 0).unwrap();
        BucketKey::new(ts, None)
    }

    fn section_sample(count: u64) -> HourlyBucket {
        let mut bucket = HourlyBucket::new();
        bucket.add_visitors(count);
        bucket.add_object("person", count);
        bucket
    }

    #[tokio::test]
    async fn test_entrance_deltas_merge_and_flush() {
        let dir = tempdir().unwrap();
        let gateway = Arc::new(MemoryGateway::new());
        let agg =
            Aggregator::new(cfg(dir.path()), gateway.clone(), Arc::new(Metrics::new()));

        agg.ingest(AggregatorEvent::EntranceDelta { key: key(15), visitors: 3 });
        agg.ingest(AggregatorEvent::EntranceDelta { key: key(15), visitors: 2 });
        agg.ingest(AggregatorEvent::EntranceDelta { key: key(16), visitors: 1 });
        agg.flush().await;

        // One delta per key, merged before draining
        let buckets = gateway.buckets();
        assert_eq!(buckets.len(), 2);
        assert_eq!(gateway.visitor_total(15), 5);
        assert_eq!(gateway.visitor_total(16), 1);
    }

    #[tokio::test]
    async fn test_flush_with_empty_state_writes_nothing() {
        let dir = tempdir().unwrap();
        let gateway = Arc::new(MemoryGateway::new());
        let agg =
            Aggregator::new(cfg(dir.path()), gateway.clone(), Arc::new(Metrics::new()));

        agg.flush().await;
        assert!(gateway.buckets().is_empty());
    }

    #[tokio::test]
    async fn test_failed_flush_retries_next_cycle_without_double_count() {
        let dir = tempdir().unwrap();
        let gateway = Arc::new(MemoryGateway::new());
        let agg =
            Aggregator::new(cfg(dir.path()), gateway.clone(), Arc::new(Metrics::new()));

        agg.ingest(AggregatorEvent::EntranceDelta { key: key(15), visitors: 4 });

        // Both attempts of the first cycle fail; the delta stays queued
        gateway.fail_next(2);
        agg.flush().await;
        assert!(gateway.buckets().is_empty());

        // New arrivals accumulate separately from the queued delta
        agg.ingest(AggregatorEvent::EntranceDelta { key: key(15), visitors: 1 });
        agg.flush().await;

        assert_eq!(gateway.visitor_total(15), 5);
        assert_eq!(gateway.buckets().len(), 2);
    }

    #[tokio::test]
    async fn test_replayed_delta_is_skipped() {
        let dir = tempdir().unwrap();
        let gateway = Arc::new(MemoryGateway::new());
        let metrics = Arc::new(Metrics::new());
        let agg = Aggregator::new(cfg(dir.path()), gateway.clone(), metrics.clone());

        agg.ingest(AggregatorEvent::EntranceDelta { key: key(15), visitors: 4 });
        agg.flush().await;
        assert_eq!(gateway.buckets().len(), 1);
        let applied = gateway.buckets()[0].clone();

        // Simulate a replay of the already-applied delta
        agg.state.unflushed.lock().push_back(applied);
        agg.flush().await;

        assert_eq!(gateway.buckets().len(), 1);
        assert_eq!(gateway.visitor_total(15), 4);
        let summary = metrics.report(std::time::Instant::now());
        assert_eq!(summary.flush_replay_skipped, 1);
    }

    #[tokio::test]
    async fn test_persistent_failure_spills_and_recovers() {
        let dir = tempdir().unwrap();
        let gateway = Arc::new(MemoryGateway::new());
        let metrics = Arc::new(Metrics::new());
        let agg = Aggregator::new(cfg(dir.path()), gateway.clone(), metrics.clone());

        agg.ingest(AggregatorEvent::EntranceDelta { key: key(15), visitors: 7 });

        // Two consecutive failed cycles exhaust the budget and spill
        gateway.fail_next(u32::MAX);
        agg.flush().await;
        agg.flush().await;
        assert!(agg.state.unflushed.lock().is_empty());

        // A fresh aggregator (new process) recovers the spill and
        // applies it once the gateway is back
        gateway.fail_next(0);
        let agg2 = Aggregator::new(cfg(dir.path()), gateway.clone(), metrics);
        agg2.recover_spill();
        agg2.flush().await;

        assert_eq!(gateway.visitor_total(15), 7);
        // Spill file is gone after recovery
        assert!(SpillLog::new(dir.path().join("spill.jsonl")).read_all().is_empty());
    }

    #[tokio::test]
    async fn test_section_samples_merge_into_section_bucket() {
        let dir = tempdir().unwrap();
        let gateway = Arc::new(MemoryGateway::new());
        let agg =
            Aggregator::new(cfg(dir.path()), gateway.clone(), Arc::new(Metrics::new()));

        let ts = Utc.with_ymd_and_hms(2025, 3, 14, 15, 10, 0).unwrap();
        let section_key = BucketKey::new(ts, Some("produce"));
        agg.ingest(AggregatorEvent::SectionSample {
            key: section_key.clone(),
            sample: section_sample(2),
        });
        agg.ingest(AggregatorEvent::SectionSample {
            key: section_key.clone(),
            sample: section_sample(3),
        });
        agg.flush().await;

        let buckets = gateway.buckets();
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].key, section_key);
        assert_eq!(buckets[0].bucket.visitor_count, 5);
        assert_eq!(buckets[0].bucket.object_counts["person"], 5);
    }

    #[tokio::test]
    async fn test_dwell_and_queue_streams_pass_through() {
        let dir = tempdir().unwrap();
        let gateway = Arc::new(MemoryGateway::new());
        let agg =
            Aggregator::new(cfg(dir.path()), gateway.clone(), Arc::new(Metrics::new()));

        let entry = Utc.with_ymd_and_hms(2025, 3, 14, 15, 0, 0).unwrap();
        agg.ingest(AggregatorEvent::DwellClosed(DwellRecord {
            track_id: crate::domain::types::TrackId(1),
            section_name: "produce".to_string(),
            entry_time: entry,
            exit_time: entry + chrono::Duration::seconds(30),
            duration_seconds: 30.0,
            date: entry.date_naive(),
            hour: 15,
        }));
        agg.ingest(AggregatorEvent::QueueSample(QueueSnapshot {
            ts: entry,
            queue_length: 2,
            estimated_wait_secs: 240.0,
            is_busy: false,
            estimated_transactions: 1,
            date: entry.date_naive(),
            hour: 15,
        }));
        agg.flush().await;

        assert_eq!(gateway.dwell_records().len(), 1);
        assert_eq!(gateway.queue_snapshots().len(), 1);
    }

    #[tokio::test]
    async fn test_buffer_bound_spills_overflow() {
        let dir = tempdir().unwrap();
        let gateway = Arc::new(MemoryGateway::new());
        let mut config = cfg(dir.path());
        config.max_buffered_deltas = 2;
        config.max_consecutive_failures = 100;
        let agg = Aggregator::new(config, gateway.clone(), Arc::new(Metrics::new()));

        gateway.fail_next(u32::MAX);
        for hour in 10..15 {
            agg.ingest(AggregatorEvent::EntranceDelta { key: key(hour), visitors: 1 });
            agg.flush().await;
        }

        assert!(agg.state.unflushed.lock().len() <= 2);
        let spilled = SpillLog::new(dir.path().join("spill.jsonl")).read_all();
        assert!(!spilled.is_empty());
    }

    #[tokio::test]
    async fn test_flush_now_flushes_before_cadence() {
        let dir = tempdir().unwrap();
        let gateway = Arc::new(MemoryGateway::new());
        let agg = Aggregator::new(cfg(dir.path()), gateway.clone(), Arc::new(Metrics::new()));
        let handle = agg.handle();

        let (tx, rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(agg.run(rx, shutdown_rx));

        tx.send(AggregatorEvent::EntranceDelta { key: key(15), visitors: 2 })
            .await
            .unwrap();
        // Give the run loop a chance to ingest before requesting a flush
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.flush_now().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Flushed well before the 30s cadence tick
        assert_eq!(gateway.visitor_total(15), 2);

        shutdown_tx.send(true).unwrap();
        drop(tx);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_drains_feed_final_deltas() {
        let dir = tempdir().unwrap();
        let gateway = Arc::new(MemoryGateway::new());
        let agg = Aggregator::new(cfg(dir.path()), gateway.clone(), Arc::new(Metrics::new()));

        let (tx, rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(agg.run(rx, shutdown_rx));

        // Shutdown fires while the feed still holds its sender and has
        // final deltas left to emit
        shutdown_tx.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(AggregatorEvent::EntranceDelta { key: key(15), visitors: 3 })
            .await
            .unwrap();
        drop(tx);

        task.await.unwrap();
        assert_eq!(gateway.visitor_total(15), 3);
    }

    #[tokio::test]
    async fn test_spill_log_survives_until_recovered_deltas_apply() {
        let dir = tempdir().unwrap();
        let gateway = Arc::new(MemoryGateway::new());
        let log = SpillLog::new(dir.path().join("spill.jsonl"));

        let ts = Utc.with_ymd_and_hms(2025, 3, 14, 15, 0, 0).unwrap();
        let mut bucket = HourlyBucket::new();
        bucket.add_visitors(7);
        log.append(&bucket.take_delta(BucketKey::new(ts, None))).unwrap();

        // Recovery alone must not touch the log; a crash before the
        // flush would otherwise lose the delta for good
        let agg = Aggregator::new(cfg(dir.path()), gateway.clone(), Arc::new(Metrics::new()));
        agg.recover_spill();
        drop(agg);
        assert_eq!(log.read_all().len(), 1);

        // The next run recovers again, applies, and only then clears
        let agg = Aggregator::new(cfg(dir.path()), gateway.clone(), Arc::new(Metrics::new()));
        agg.recover_spill();
        agg.flush().await;
        assert_eq!(gateway.visitor_total(15), 7);
        assert!(log.read_all().is_empty());
    }

    #[tokio::test]
    async fn test_watermark_evicts_oldest_past_capacity() {
        let dir = tempdir().unwrap();
        let gateway = Arc::new(MemoryGateway::new());
        let mut config = cfg(dir.path());
        config.watermark_capacity = 2;
        let agg = Aggregator::new(config, gateway.clone(), Arc::new(Metrics::new()));

        for hour in 10..14 {
            agg.ingest(AggregatorEvent::EntranceDelta { key: key(hour), visitors: 1 });
        }
        agg.flush().await;

        assert_eq!(gateway.buckets().len(), 4);
        assert_eq!(agg.state.applied.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_ingestion_continues_during_slow_flush() {
        let dir = tempdir().unwrap();
        let gateway = Arc::new(MemoryGateway::new());
        let metrics = Arc::new(Metrics::new());
        let agg = Aggregator::new(cfg(dir.path()), gateway.clone(), metrics.clone());
        let handle = agg.handle();

        let (tx, rx) = mpsc::channel(16);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(agg.run(rx, shutdown_rx));

        tx.send(AggregatorEvent::EntranceDelta { key: key(15), visitors: 2 })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // A slow gateway holds the flush cycle open
        gateway.set_upsert_delay_ms(150);
        handle.flush_now().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The loop keeps ingesting while the cycle is in flight
        tx.send(AggregatorEvent::EntranceDelta { key: key(16), visitors: 3 })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let summary = metrics.report(std::time::Instant::now());
        assert_eq!(summary.events_merged, 2);
        assert!(gateway.buckets().is_empty());

        drop(tx);
        task.await.unwrap();
        assert_eq!(gateway.visitor_total(15), 2);
        assert_eq!(gateway.visitor_total(16), 3);
    }

    #[tokio::test]
    async fn test_run_loop_final_flush_on_channel_close() {
        let dir = tempdir().unwrap();
        let gateway = Arc::new(MemoryGateway::new());
        let agg = Aggregator::new(cfg(dir.path()), gateway.clone(), Arc::new(Metrics::new()));

        let (tx, rx) = mpsc::channel(16);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        tx.send(AggregatorEvent::EntranceDelta { key: key(15), visitors: 9 })
            .await
            .unwrap();
        drop(tx);

        agg.run(rx, shutdown_rx).await;
        assert_eq!(gateway.visitor_total(15), 9);
    }
}
