//! Shared types for the tracking core

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Newtype wrapper for track IDs to provide type safety.
/// IDs are monotonic and unique within a single feed only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct TrackId(pub u64);

impl std::fmt::Display for TrackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Newtype wrapper for feed identifiers
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct FeedId(pub String);

impl std::fmt::Display for FeedId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Analytic purpose of a camera feed, determining which downstream
/// stage consumes its track events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedRole {
    Entrance,
    Section,
    Cashier,
}

impl FeedRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedRole::Entrance => "entrance",
            FeedRole::Section => "section",
            FeedRole::Cashier => "cashier",
        }
    }
}

/// Gender attribute attached by the external classifier (optional per detection)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
}

/// Axis-aligned bounding box in frame coordinates (top-left origin)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BBox {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self { x, y, width, height }
    }

    /// Build from corner coordinates (x1, y1, x2, y2)
    pub fn from_corners(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self { x: x1, y: y1, width: x2 - x1, height: y2 - y1 }
    }

    #[inline]
    pub fn area(&self) -> f64 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Center point (cx, cy)
    #[inline]
    pub fn center(&self) -> (f64, f64) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    /// Whether a point lies inside this box (inclusive edges)
    pub fn contains(&self, px: f64, py: f64) -> bool {
        px >= self.x && px <= self.x + self.width && py >= self.y && py <= self.y + self.height
    }

    /// Intersection-over-union with another box, in [0, 1]
    pub fn iou(&self, other: &BBox) -> f64 {
        let ix1 = self.x.max(other.x);
        let iy1 = self.y.max(other.y);
        let ix2 = (self.x + self.width).min(other.x + other.width);
        let iy2 = (self.y + self.height).min(other.y + other.height);

        let iw = (ix2 - ix1).max(0.0);
        let ih = (iy2 - iy1).max(0.0);
        let intersection = iw * ih;
        if intersection <= 0.0 {
            return 0.0;
        }

        let union = self.area() + other.area() - intersection;
        if union <= 0.0 {
            return 0.0;
        }
        intersection / union
    }

    /// Euclidean distance between box centers
    pub fn center_distance(&self, other: &BBox) -> f64 {
        let (ax, ay) = self.center();
        let (bx, by) = other.center();
        let dx = ax - bx;
        let dy = ay - by;
        (dx * dx + dy * dy).sqrt()
    }
}

/// A single detection returned by the external model for one frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BBox,
    pub confidence: f64,
    /// Class label from the detector (e.g., "person", "chair")
    pub label: String,
    /// Optional attribute from the external demographic classifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<Gender>,
}

impl Detection {
    pub fn person(bbox: BBox, confidence: f64) -> Self {
        Self { bbox, confidence, label: "person".to_string(), gender: None }
    }

    pub fn is_person(&self) -> bool {
        self.label == "person"
    }
}

/// All detections for one frame of one feed, stamped by the ingestion boundary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameDetections {
    pub ts: DateTime<Utc>,
    pub detections: Vec<Detection>,
}

/// Track lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    Active,
    Lost,
    Closed,
}

impl TrackState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackState::Active => "active",
            TrackState::Lost => "lost",
            TrackState::Closed => "closed",
        }
    }
}

/// A hypothesized identity for one physical person within a single feed.
/// Owned exclusively by that feed's Tracker, never shared across feeds.
#[derive(Debug, Clone)]
pub struct Track {
    pub id: TrackId,
    pub state: TrackState,
    pub last_bbox: BBox,
    /// Consecutive frames without a matching detection
    pub miss_count: u32,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl Track {
    pub fn new(id: TrackId, bbox: BBox, ts: DateTime<Utc>) -> Self {
        Self {
            id,
            state: TrackState::Active,
            last_bbox: bbox,
            miss_count: 0,
            first_seen: ts,
            last_seen: ts,
        }
    }
}

/// Kind of track lifecycle transition observed in a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackEventKind {
    /// First unmatched detection spawned a fresh track
    Created,
    /// Existing active track matched a detection
    Updated,
    /// Lost track re-matched within the grace window (same identity, no re-count)
    Reactivated,
    /// Miss limit reached, track entered the grace window
    Lost,
    /// Grace window expired or feed shut down
    Closed,
}

impl TrackEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackEventKind::Created => "created",
            TrackEventKind::Updated => "updated",
            TrackEventKind::Reactivated => "reactivated",
            TrackEventKind::Lost => "lost",
            TrackEventKind::Closed => "closed",
        }
    }
}

/// Track lifecycle event emitted by the Tracker and consumed by the
/// role-specific downstream stage.
#[derive(Debug, Clone)]
pub struct TrackEvent {
    pub kind: TrackEventKind,
    pub track_id: TrackId,
    pub bbox: BBox,
    /// Frame timestamp that produced this event
    pub ts: DateTime<Utc>,
    pub first_seen: DateTime<Utc>,
    /// Last frame the track actually matched a detection. For `Closed`
    /// events this is the effective end of presence, not the closure frame.
    pub last_seen: DateTime<Utc>,
}
