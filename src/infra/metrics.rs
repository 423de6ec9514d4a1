//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! All counter updates are lock-free; reporting is the only operation
//! that needs synchronization (via atomic swap).
//!
//! NOTE: All atomics use Relaxed ordering intentionally—these are statistical
//! counters only. Do NOT use these atomics for coordination or logic decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Exponential bucket boundaries for frame processing latency (microseconds)
/// Buckets: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200
const BUCKET_BOUNDS: [u64; 10] = [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];
pub const METRICS_NUM_BUCKETS: usize = 11;

/// Compute bucket index for a latency value using binary search
#[inline]
fn bucket_index(latency_us: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_us)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

/// Metrics collector shared across feed pipelines and the aggregator
#[derive(Debug, Default)]
pub struct Metrics {
    // Frame ingestion
    frames_processed: AtomicU64,
    detections_seen: AtomicU64,
    frame_latency_sum_us: AtomicU64,
    frame_latency_max_us: AtomicU64,
    frame_latency_buckets: [AtomicU64; METRICS_NUM_BUCKETS],

    // Track lifecycle
    tracks_created: AtomicU64,
    tracks_reactivated: AtomicU64,
    tracks_lost: AtomicU64,
    tracks_closed: AtomicU64,

    // Stage outputs
    dwell_records: AtomicU64,
    dwell_flicker_discarded: AtomicU64,
    entrance_deltas: AtomicU64,
    queue_snapshots: AtomicU64,
    transactions_counted: AtomicU64,

    // Aggregator channel
    events_merged: AtomicU64,
    events_dropped: AtomicU64,

    // Persistence
    flush_success: AtomicU64,
    flush_failure: AtomicU64,
    flush_replay_skipped: AtomicU64,
    deltas_spilled: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_frame(&self, detections: usize, latency_us: u64) {
        self.frames_processed.fetch_add(1, Ordering::Relaxed);
        self.detections_seen.fetch_add(detections as u64, Ordering::Relaxed);
        self.frame_latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);
        update_atomic_max(&self.frame_latency_max_us, latency_us);
        self.frame_latency_buckets[bucket_index(latency_us)].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_track_created(&self) {
        self.tracks_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_track_reactivated(&self) {
        self.tracks_reactivated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_track_lost(&self) {
        self.tracks_lost.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_track_closed(&self) {
        self.tracks_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dwell_record(&self) {
        self.dwell_records.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flicker_discarded(&self) {
        self.dwell_flicker_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_entrance_delta(&self) {
        self.entrance_deltas.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_queue_snapshot(&self) {
        self.queue_snapshots.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transaction(&self) {
        self.transactions_counted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_event_merged(&self) {
        self.events_merged.fetch_add(1, Ordering::Relaxed);
    }

    /// Channel overflow drop. A degradation signal, never an error.
    pub fn record_event_dropped(&self) {
        self.events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush_success(&self) {
        self.flush_success.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush_failure(&self) {
        self.flush_failure.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush_replay_skipped(&self) {
        self.flush_replay_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delta_spilled(&self) {
        self.deltas_spilled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn events_dropped(&self) -> u64 {
        self.events_dropped.load(Ordering::Relaxed)
    }

    /// Produce a point-in-time summary. Latency sum/max are swapped out
    /// so each report covers one interval; monotonic counters are read
    /// without reset.
    pub fn report(&self, elapsed: Instant) -> MetricsSummary {
        let frames = self.frames_processed.load(Ordering::Relaxed);
        let latency_sum = self.frame_latency_sum_us.swap(0, Ordering::Relaxed);
        let latency_max = self.frame_latency_max_us.swap(0, Ordering::Relaxed);

        let mut interval_frames = 0u64;
        for bucket in &self.frame_latency_buckets {
            interval_frames += bucket.swap(0, Ordering::Relaxed);
        }
        let avg_latency_us =
            if interval_frames > 0 { latency_sum / interval_frames } else { 0 };

        let secs = elapsed.elapsed().as_secs_f64();
        let frames_per_sec = if secs > 0.0 { interval_frames as f64 / secs } else { 0.0 };

        MetricsSummary {
            frames_total: frames,
            detections_total: self.detections_seen.load(Ordering::Relaxed),
            frames_per_sec,
            avg_latency_us,
            max_latency_us: latency_max,
            tracks_created: self.tracks_created.load(Ordering::Relaxed),
            tracks_reactivated: self.tracks_reactivated.load(Ordering::Relaxed),
            tracks_lost: self.tracks_lost.load(Ordering::Relaxed),
            tracks_closed: self.tracks_closed.load(Ordering::Relaxed),
            dwell_records: self.dwell_records.load(Ordering::Relaxed),
            dwell_flicker_discarded: self.dwell_flicker_discarded.load(Ordering::Relaxed),
            entrance_deltas: self.entrance_deltas.load(Ordering::Relaxed),
            queue_snapshots: self.queue_snapshots.load(Ordering::Relaxed),
            transactions_counted: self.transactions_counted.load(Ordering::Relaxed),
            events_merged: self.events_merged.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            flush_success: self.flush_success.load(Ordering::Relaxed),
            flush_failure: self.flush_failure.load(Ordering::Relaxed),
            flush_replay_skipped: self.flush_replay_skipped.load(Ordering::Relaxed),
            deltas_spilled: self.deltas_spilled.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of all metrics for logging
#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub frames_total: u64,
    pub detections_total: u64,
    pub frames_per_sec: f64,
    pub avg_latency_us: u64,
    pub max_latency_us: u64,
    pub tracks_created: u64,
    pub tracks_reactivated: u64,
    pub tracks_lost: u64,
    pub tracks_closed: u64,
    pub dwell_records: u64,
    pub dwell_flicker_discarded: u64,
    pub entrance_deltas: u64,
    pub queue_snapshots: u64,
    pub transactions_counted: u64,
    pub events_merged: u64,
    pub events_dropped: u64,
    pub flush_success: u64,
    pub flush_failure: u64,
    pub flush_replay_skipped: u64,
    pub deltas_spilled: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            frames = %self.frames_total,
            detections = %self.detections_total,
            fps = %format!("{:.1}", self.frames_per_sec),
            avg_latency_us = %self.avg_latency_us,
            max_latency_us = %self.max_latency_us,
            tracks_created = %self.tracks_created,
            tracks_reactivated = %self.tracks_reactivated,
            tracks_closed = %self.tracks_closed,
            dwell_records = %self.dwell_records,
            entrance_deltas = %self.entrance_deltas,
            queue_snapshots = %self.queue_snapshots,
            transactions = %self.transactions_counted,
            merged = %self.events_merged,
            dropped = %self.events_dropped,
            flush_ok = %self.flush_success,
            flush_err = %self.flush_failure,
            replay_skipped = %self.flush_replay_skipped,
            spilled = %self.deltas_spilled,
            "metrics_summary"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_index() {
        assert_eq!(bucket_index(0), 0);
        assert_eq!(bucket_index(100), 0);
        assert_eq!(bucket_index(101), 1);
        assert_eq!(bucket_index(51200), 9);
        assert_eq!(bucket_index(51201), 10);
        assert_eq!(bucket_index(u64::MAX), 10);
    }

    #[test]
    fn test_record_frame_and_report() {
        let metrics = Metrics::new();
        metrics.record_frame(3, 150);
        metrics.record_frame(0, 50);

        let summary = metrics.report(Instant::now());
        assert_eq!(summary.frames_total, 2);
        assert_eq!(summary.detections_total, 3);
        assert_eq!(summary.avg_latency_us, 100);
        assert_eq!(summary.max_latency_us, 150);
    }

    #[test]
    fn test_latency_window_resets_between_reports() {
        let metrics = Metrics::new();
        metrics.record_frame(1, 1000);
        let _ = metrics.report(Instant::now());

        let summary = metrics.report(Instant::now());
        assert_eq!(summary.avg_latency_us, 0);
        assert_eq!(summary.max_latency_us, 0);
        // Monotonic totals are not reset
        assert_eq!(summary.frames_total, 1);
    }

    #[test]
    fn test_lifecycle_counters() {
        let metrics = Metrics::new();
        metrics.record_track_created();
        metrics.record_track_created();
        metrics.record_track_reactivated();
        metrics.record_track_closed();
        metrics.record_event_dropped();

        let summary = metrics.report(Instant::now());
        assert_eq!(summary.tracks_created, 2);
        assert_eq!(summary.tracks_reactivated, 1);
        assert_eq!(summary.tracks_closed, 1);
        assert_eq!(summary.events_dropped, 1);
        assert_eq!(metrics.events_dropped(), 1);
    }

    #[test]
    fn test_atomic_max() {
        let max = AtomicU64::new(0);
        update_atomic_max(&max, 10);
        update_atomic_max(&max, 5);
        update_atomic_max(&max, 20);
        assert_eq!(max.load(Ordering::Relaxed), 20);
    }
}
