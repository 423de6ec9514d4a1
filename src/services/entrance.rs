//! Entrance visitor counting
//!
//! Counts each newly created track on an entrance feed exactly once,
//! bucketed by the hour of its first sighting. Reactivations are the
//! same physical person resurfacing and never increment. Accumulated
//! counts are released at a bounded cadence rather than per frame so
//! the aggregator channel carries coarse deltas.

use crate::domain::bucket::BucketKey;
use crate::domain::types::{TrackEvent, TrackEventKind};
use crate::infra::metrics::Metrics;
use chrono::{DateTime, Duration, Utc};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tracing::debug;

/// Per-feed entrance counter. Pending counts are keyed by the hour the
/// visitor first appeared, so a flush spanning an hour boundary still
/// credits each visitor to the right bucket.
pub struct EntranceCounter {
    pending: FxHashMap<BucketKey, u64>,
    flush_interval: Duration,
    last_flush: Option<DateTime<Utc>>,
    metrics: Option<Arc<Metrics>>,
}

impl EntranceCounter {
    pub fn new(flush_interval_ms: u64) -> Self {
        Self {
            pending: FxHashMap::default(),
            flush_interval: Duration::milliseconds(flush_interval_ms as i64),
            last_flush: None,
            metrics: None,
        }
    }

    pub fn with_metrics(flush_interval_ms: u64, metrics: Arc<Metrics>) -> Self {
        let mut counter = Self::new(flush_interval_ms);
        counter.metrics = Some(metrics);
        counter
    }

    /// Observe one track event. Only `Created` counts; a reactivated
    /// track was already counted when it first appeared.
    pub fn handle_event(&mut self, event: &TrackEvent) {
        if event.kind != TrackEventKind::Created {
            return;
        }
        let key = BucketKey::new(event.first_seen, None);
        *self.pending.entry(key).or_insert(0) += 1;
    }

    /// Release pending counts if the flush cadence has elapsed.
    /// The first call establishes the cadence baseline without flushing.
    pub fn maybe_flush(&mut self, now: DateTime<Utc>) -> Vec<(BucketKey, u64)> {
        match self.last_flush {
            None => {
                self.last_flush = Some(now);
                Vec::new()
            }
            Some(last) if now - last >= self.flush_interval => {
                self.last_flush = Some(now);
                self.drain()
            }
            Some(_) => Vec::new(),
        }
    }

    /// Release all pending counts unconditionally, used at shutdown
    pub fn drain(&mut self) -> Vec<(BucketKey, u64)> {
        if self.pending.is_empty() {
            return Vec::new();
        }
        let mut deltas: Vec<(BucketKey, u64)> = self.pending.drain().collect();
        // Stable emission order for deterministic downstream handling
        deltas.sort_by(|a, b| a.0.cmp(&b.0));

        for (key, count) in &deltas {
            debug!(bucket = %key, visitors = %count, "entrance_delta");
            if let Some(ref m) = self.metrics {
                m.record_entrance_delta();
            }
        }
        deltas
    }

    pub fn pending_total(&self) -> u64 {
        self.pending.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{BBox, TrackId};
    use chrono::{TimeZone, Timelike};

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 14, 15, 59, 0).unwrap() + Duration::seconds(secs)
    }

    fn event(kind: TrackEventKind, id: u64, at: DateTime<Utc>) -> TrackEvent {
        TrackEvent {
            kind,
            track_id: TrackId(id),
            bbox: BBox::new(0.0, 0.0, 10.0, 10.0),
            ts: at,
            first_seen: at,
            last_seen: at,
        }
    }

    #[test]
    fn test_created_counts_once() {
        let mut counter = EntranceCounter::new(5000);
        counter.handle_event(&event(TrackEventKind::Created, 1, ts(0)));
        counter.handle_event(&event(TrackEventKind::Updated, 1, ts(1)));
        counter.handle_event(&event(TrackEventKind::Lost, 1, ts(2)));
        counter.handle_event(&event(TrackEventKind::Closed, 1, ts(3)));

        assert_eq!(counter.pending_total(), 1);
    }

    #[test]
    fn test_reactivation_never_increments() {
        let mut counter = EntranceCounter::new(5000);
        counter.handle_event(&event(TrackEventKind::Created, 1, ts(0)));
        counter.handle_event(&event(TrackEventKind::Lost, 1, ts(1)));
        counter.handle_event(&event(TrackEventKind::Reactivated, 1, ts(2)));

        assert_eq!(counter.pending_total(), 1);
    }

    #[test]
    fn test_counts_keyed_by_first_seen_hour() {
        let mut counter = EntranceCounter::new(5000);
        // One visitor at 15:59, one at 16:00
        counter.handle_event(&event(TrackEventKind::Created, 1, ts(0)));
        counter.handle_event(&event(TrackEventKind::Created, 2, ts(60)));

        let deltas = counter.drain();
        assert_eq!(deltas.len(), 2);
        assert_eq!(deltas[0].0.hour, 15);
        assert_eq!(deltas[1].0.hour, 16);
        assert_eq!(deltas[0].1, 1);
        assert_eq!(deltas[1].1, 1);
        // Entrance buckets carry no section
        assert!(deltas[0].0.section.is_none());
    }

    #[test]
    fn test_flush_cadence() {
        let mut counter = EntranceCounter::new(5000);
        counter.handle_event(&event(TrackEventKind::Created, 1, ts(0)));

        // First call only sets the baseline
        assert!(counter.maybe_flush(ts(0)).is_empty());
        // Within the cadence: nothing released
        assert!(counter.maybe_flush(ts(2)).is_empty());
        assert_eq!(counter.pending_total(), 1);

        let deltas = counter.maybe_flush(ts(6));
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].1, 1);
        assert_eq!(counter.pending_total(), 0);
    }

    #[test]
    fn test_drain_empty_is_empty() {
        let mut counter = EntranceCounter::new(5000);
        assert!(counter.drain().is_empty());
    }

    #[test]
    fn test_hour_sanity() {
        // Guard against the fixture drifting away from the hour boundary
        assert_eq!(ts(0).hour(), 15);
        assert_eq!(ts(60).hour(), 16);
    }
}
