//! Section dwell tracking
//!
//! Consumes a section feed's track lifecycle events and turns zone
//! presence into dwell intervals. A track has at most one open interval;
//! leaving the zone or closing the track closes it. Intervals shorter
//! than the configured minimum are discarded as detection flicker.

use crate::domain::dwell::{DwellInterval, DwellRecord};
use crate::domain::types::{BBox, TrackEvent, TrackEventKind, TrackId};
use crate::infra::config::DwellConfig;
use crate::infra::metrics::Metrics;
use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Dwell state machine for one section feed
pub struct SectionDwellTracker {
    section_name: String,
    zone: BBox,
    min_dwell_secs: f64,
    open: FxHashMap<TrackId, DwellInterval>,
    metrics: Option<Arc<Metrics>>,
}

impl SectionDwellTracker {
    pub fn new(section_name: &str, zone: BBox, cfg: &DwellConfig) -> Self {
        Self {
            section_name: section_name.to_string(),
            zone,
            min_dwell_secs: cfg.min_dwell_secs,
            open: FxHashMap::default(),
            metrics: None,
        }
    }

    pub fn with_metrics(
        section_name: &str,
        zone: BBox,
        cfg: &DwellConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        let mut tracker = Self::new(section_name, zone, cfg);
        tracker.metrics = Some(metrics);
        tracker
    }

    /// Feed one track event through the state machine. Returns a record
    /// when an interval closes and survives the flicker filter.
    pub fn handle_event(&mut self, event: &TrackEvent) -> Option<DwellRecord> {
        match event.kind {
            TrackEventKind::Created | TrackEventKind::Updated | TrackEventKind::Reactivated => {
                let (cx, cy) = event.bbox.center();
                if self.zone.contains(cx, cy) {
                    self.enter(event.track_id, event.ts);
                    None
                } else {
                    self.exit(event.track_id, event.ts)
                }
            }
            // A lost track may still return; presence is decided at closure
            TrackEventKind::Lost => None,
            // last_seen is the effective end of presence, not the frame
            // on which the closure was decided
            TrackEventKind::Closed => self.exit(event.track_id, event.last_seen),
        }
    }

    fn enter(&mut self, track_id: TrackId, ts: DateTime<Utc>) {
        if self.open.contains_key(&track_id) {
            // Re-entering while already inside is a no-op
            return;
        }
        debug!(track_id = %track_id, section = %self.section_name, "dwell_entered");
        self.open.insert(track_id, DwellInterval::open(track_id, &self.section_name, ts));
    }

    fn exit(&mut self, track_id: TrackId, ts: DateTime<Utc>) -> Option<DwellRecord> {
        let mut interval = self.open.remove(&track_id)?;
        if let Err(e) = interval.close(ts) {
            // Logic fault on this track only; drop the interval and move on
            warn!(error = %e, section = %self.section_name, "dwell_interval_discarded");
            return None;
        }
        self.finish(interval)
    }

    fn finish(&self, interval: DwellInterval) -> Option<DwellRecord> {
        let duration = interval.duration_seconds();
        if duration < self.min_dwell_secs {
            debug!(
                track_id = %interval.track_id,
                section = %self.section_name,
                duration_s = %format!("{duration:.2}"),
                "dwell_flicker_discarded"
            );
            if let Some(ref m) = self.metrics {
                m.record_flicker_discarded();
            }
            return None;
        }

        let record = DwellRecord::from_interval(&interval)?;
        debug!(
            track_id = %record.track_id,
            section = %self.section_name,
            duration_s = %format!("{:.2}", record.duration_seconds),
            "dwell_recorded"
        );
        if let Some(ref m) = self.metrics {
            m.record_dwell_record();
        }
        Some(record)
    }

    /// Close every open interval at the given timestamp, used at feed
    /// shutdown as a backstop when no Closed event arrived for a track.
    pub fn close_all(&mut self, ts: DateTime<Utc>) -> Vec<DwellRecord> {
        let ids: Vec<TrackId> = self.open.keys().copied().collect();
        let mut records = Vec::new();
        for id in ids {
            if let Some(record) = self.exit(id, ts) {
                records.push(record);
            }
        }
        records
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }
}
