//! Cashier queue length and wait estimation
//!
//! Observes the active track set of a cashier feed against two
//! configured zones: the queue area and the counter area. Queue length
//! is the number of active tracks centered in the queue zone. A track
//! moving from the queue into the counter zone is one serviced
//! transaction, counted exactly once however long it lingers at the
//! counter.

use crate::domain::bucket::QueueSnapshot;
use crate::domain::types::{BBox, Track, TrackId};
use crate::infra::config::QueueConfig;
use crate::infra::metrics::Metrics;
use chrono::{DateTime, Timelike, Utc};
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;
use tracing::debug;

/// Where a tracked customer currently stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CustomerState {
    Queued,
    AtCounter,
}

/// Queue state machine for one cashier feed
pub struct QueueEstimator {
    queue_zone: BBox,
    counter_zone: BBox,
    avg_service_time_secs: f64,
    busy_threshold: u32,
    states: FxHashMap<TrackId, CustomerState>,
    /// Tracks already counted as a transaction; survives a brief
    /// departure so re-entering the counter zone never double-counts
    transacted: FxHashSet<TrackId>,
    transactions: u64,
    metrics: Option<Arc<Metrics>>,
}

impl QueueEstimator {
    pub fn new(queue_zone: BBox, counter_zone: BBox, cfg: &QueueConfig) -> Self {
        Self {
            queue_zone,
            counter_zone,
            avg_service_time_secs: cfg.avg_service_time_secs,
            busy_threshold: cfg.busy_threshold,
            states: FxHashMap::default(),
            transacted: FxHashSet::default(),
            transactions: 0,
            metrics: None,
        }
    }

    pub fn with_metrics(
        queue_zone: BBox,
        counter_zone: BBox,
        cfg: &QueueConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        let mut estimator = Self::new(queue_zone, counter_zone, cfg);
        estimator.metrics = Some(metrics);
        estimator
    }

    /// Observe the current active track set and produce a snapshot.
    ///
    /// The counter zone wins when the zones overlap, so a customer
    /// straddling the boundary is serviced, not queued.
    pub fn observe<'a>(
        &mut self,
        active: impl Iterator<Item = &'a Track>,
        ts: DateTime<Utc>,
    ) -> QueueSnapshot {
        let mut queue_length = 0u32;

        for track in active {
            let (cx, cy) = track.last_bbox.center();
            if self.counter_zone.contains(cx, cy) {
                self.states.insert(track.id, CustomerState::AtCounter);
                if self.transacted.insert(track.id) {
                    self.transactions += 1;
                    debug!(track_id = %track.id, total = %self.transactions, "transaction_counted");
                    if let Some(ref m) = self.metrics {
                        m.record_transaction();
                    }
                }
            } else if self.queue_zone.contains(cx, cy) {
                queue_length += 1;
                self.states.insert(track.id, CustomerState::Queued);
            } else {
                // Departed: left both zones
                self.states.remove(&track.id);
            }
        }

        let is_busy = queue_length > self.busy_threshold;
        let snapshot = QueueSnapshot {
            ts,
            queue_length,
            estimated_wait_secs: queue_length as f64 * self.avg_service_time_secs,
            is_busy,
            estimated_transactions: self.transactions,
            date: ts.date_naive(),
            hour: ts.hour(),
        };
        if let Some(ref m) = self.metrics {
            m.record_queue_snapshot();
        }
        snapshot
    }

    /// Forget a closed track so its state can never leak into a later
    /// identity reusing the slot.
    pub fn handle_closed(&mut self, track_id: TrackId) {
        self.states.remove(&track_id);
        self.transacted.remove(&track_id);
    }

    pub fn transactions(&self) -> u64 {
        self.transactions
    }
}
