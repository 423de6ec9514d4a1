//! Per-feed track identity management
//!
//! Maintains a feed's active/lost track set across frames of noisy,
//! intermittent detections. Matching is deliberately deterministic:
//! detections are ordered by top-left position, then matched greedily
//! by descending IOU with ties broken by detection confidence and then
//! centroid distance, so a given frame sequence always produces the
//! same track assignment.
//!
//! A track that stops matching ages through miss counting (Active →
//! Lost at the miss limit) and a grace window (Lost → Closed). A Lost
//! track that re-matches inside the grace window returns to Active
//! under its original ID, so one physical person flickering in and out
//! of detection is never counted twice.

use crate::domain::types::{Detection, Track, TrackEvent, TrackEventKind, TrackId, TrackState};
use crate::infra::config::TrackerConfig;
use crate::infra::metrics::Metrics;
use chrono::{DateTime, Duration, Utc};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tracing::debug;

/// Candidate pairing between a live track and a detection
struct MatchCandidate {
    track_id: TrackId,
    det_idx: usize,
    iou: f64,
    confidence: f64,
    distance: f64,
}

/// Track registry for a single feed. Owned exclusively by that feed's
/// pipeline; never shared across feeds.
pub struct Tracker {
    cfg: TrackerConfig,
    grace: Duration,
    next_id: u64,
    tracks: FxHashMap<TrackId, Track>,
    metrics: Option<Arc<Metrics>>,
}

impl Tracker {
    pub fn new(cfg: TrackerConfig) -> Self {
        let grace = Duration::milliseconds(cfg.grace_ms as i64);
        Self { cfg, grace, next_id: 0, tracks: FxHashMap::default(), metrics: None }
    }

    /// Create a tracker with metrics recording
    pub fn with_metrics(cfg: TrackerConfig, metrics: Arc<Metrics>) -> Self {
        let mut tracker = Self::new(cfg);
        tracker.metrics = Some(metrics);
        tracker
    }

    /// Process one frame of detections. A frame with zero detections is
    /// valid and simply ages all live tracks.
    ///
    /// Returns the lifecycle events observed in this frame, matches
    /// first, then loss/closure transitions.
    pub fn update(&mut self, detections: &[Detection], ts: DateTime<Utc>) -> Vec<TrackEvent> {
        let mut events = Vec::new();

        // Deterministic detection order: top-left x, then y
        let mut order: Vec<usize> = (0..detections.len()).collect();
        order.sort_by(|&a, &b| {
            let da = &detections[a].bbox;
            let db = &detections[b].bbox;
            da.x.total_cmp(&db.x).then(da.y.total_cmp(&db.y))
        });

        // All track-detection pairs above the IOU threshold
        let mut candidates: Vec<MatchCandidate> = Vec::new();
        for track in self.tracks.values() {
            for &det_idx in &order {
                let det = &detections[det_idx];
                let iou = track.last_bbox.iou(&det.bbox);
                if iou >= self.cfg.iou_threshold {
                    candidates.push(MatchCandidate {
                        track_id: track.id,
                        det_idx,
                        iou,
                        confidence: det.confidence,
                        distance: track.last_bbox.center_distance(&det.bbox),
                    });
                }
            }
        }

        // Greedy: best overlap wins; ties go to higher confidence, then
        // smaller centroid distance
        candidates.sort_by(|a, b| {
            b.iou
                .total_cmp(&a.iou)
                .then(b.confidence.total_cmp(&a.confidence))
                .then(a.distance.total_cmp(&b.distance))
        });

        let mut matched_tracks: FxHashMap<TrackId, usize> = FxHashMap::default();
        let mut matched_dets = vec![false; detections.len()];
        for cand in &candidates {
            if matched_tracks.contains_key(&cand.track_id) || matched_dets[cand.det_idx] {
                continue;
            }
            matched_tracks.insert(cand.track_id, cand.det_idx);
            matched_dets[cand.det_idx] = true;
        }

        // Apply matches
        for (&track_id, &det_idx) in &matched_tracks {
            let track = match self.tracks.get_mut(&track_id) {
                Some(t) => t,
                None => continue,
            };
            let was_lost = track.state == TrackState::Lost;
            track.last_bbox = detections[det_idx].bbox;
            track.last_seen = ts;
            track.miss_count = 0;
            track.state = TrackState::Active;

            let kind =
                if was_lost { TrackEventKind::Reactivated } else { TrackEventKind::Updated };
            if was_lost {
                debug!(track_id = %track_id, "track_reactivated");
                if let Some(ref m) = self.metrics {
                    m.record_track_reactivated();
                }
            }
            events.push(Self::event(kind, track, ts));
        }

        // Unmatched detections spawn new tracks, in deterministic order
        for &det_idx in &order {
            if matched_dets[det_idx] {
                continue;
            }
            let id = TrackId(self.next_id);
            self.next_id += 1;
            let track = Track::new(id, detections[det_idx].bbox, ts);
            debug!(track_id = %id, "track_created");
            if let Some(ref m) = self.metrics {
                m.record_track_created();
            }
            events.push(Self::event(TrackEventKind::Created, &track, ts));
            self.tracks.insert(id, track);
        }

        // Age unmatched tracks: miss counting, loss, closure
        let miss_limit = self.cfg.miss_limit;
        let grace = self.grace;
        let metrics = self.metrics.clone();
        let mut closed: Vec<TrackEvent> = Vec::new();
        for track in self.tracks.values_mut() {
            if matched_tracks.contains_key(&track.id) {
                continue;
            }
            track.miss_count += 1;

            if track.state == TrackState::Active && track.miss_count >= miss_limit {
                track.state = TrackState::Lost;
                debug!(track_id = %track.id, miss_count = %track.miss_count, "track_lost");
                if let Some(ref m) = metrics {
                    m.record_track_lost();
                }
                events.push(Self::event(TrackEventKind::Lost, track, ts));
            }

            if track.state == TrackState::Lost && ts - track.last_seen >= grace {
                track.state = TrackState::Closed;
                debug!(
                    track_id = %track.id,
                    lost_ms = %(ts - track.last_seen).num_milliseconds(),
                    "track_closed"
                );
                if let Some(ref m) = metrics {
                    m.record_track_closed();
                }
                closed.push(Self::event(TrackEventKind::Closed, track, ts));
            }
        }
        self.tracks.retain(|_, t| t.state != TrackState::Closed);
        events.extend(closed);

        events
    }

    /// Force-close every live track, used at feed shutdown. Emits a
    /// synthetic Closed event per track so no downstream interval can
    /// survive dangling.
    pub fn close_all(&mut self, ts: DateTime<Utc>) -> Vec<TrackEvent> {
        let mut events = Vec::with_capacity(self.tracks.len());
        for track in self.tracks.values_mut() {
            track.state = TrackState::Closed;
            if let Some(ref m) = self.metrics {
                m.record_track_closed();
            }
            events.push(Self::event(TrackEventKind::Closed, track, ts));
        }
        self.tracks.clear();
        events
    }

    fn event(kind: TrackEventKind, track: &Track, ts: DateTime<Utc>) -> TrackEvent {
        TrackEvent {
            kind,
            track_id: track.id,
            bbox: track.last_bbox,
            ts,
            first_seen: track.first_seen,
            last_seen: track.last_seen,
        }
    }

    /// Tracks currently in the Active state
    pub fn active(&self) -> impl Iterator<Item = &Track> {
        self.tracks.values().filter(|t| t.state == TrackState::Active)
    }

    /// All live (Active or Lost) tracks
    pub fn live_count(&self) -> usize {
        self.tracks.len()
    }
}
