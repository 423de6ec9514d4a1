//! Hour-bucketed aggregation model
//!
//! Buckets are keyed by (date, hour, optional section). All merge
//! operations are associative so concurrent feeds can fold into the
//! same bucket in any order. Flushed deltas carry a UUIDv7 id that the
//! aggregator's watermark uses to detect and skip replays.

use crate::domain::types::Gender;
use chrono::{DateTime, NaiveDate, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Heatmap grid resolution (cells per axis, normalized frame coordinates)
pub const HEATMAP_CELLS: usize = 16;

/// Aggregation key: calendar date, hour, and optional section name.
/// Entrance and cashier data use `section: None`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BucketKey {
    pub date: NaiveDate,
    pub hour: u32,
    pub section: Option<String>,
}

impl BucketKey {
    pub fn new(ts: DateTime<Utc>, section: Option<&str>) -> Self {
        Self { date: ts.date_naive(), hour: ts.hour(), section: section.map(|s| s.to_string()) }
    }
}

impl std::fmt::Display for BucketKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.section {
            Some(s) => write!(f, "{}/{:02}/{}", self.date, self.hour, s),
            None => write!(f, "{}/{:02}", self.date, self.hour),
        }
    }
}

/// Accumulable 2-D density grid over normalized frame coordinates.
/// Merging adds cell-wise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeatmapGrid {
    cells: Vec<u32>,
}

impl Default for HeatmapGrid {
    fn default() -> Self {
        Self { cells: vec![0; HEATMAP_CELLS * HEATMAP_CELLS] }
    }
}

impl HeatmapGrid {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bump the cell containing a normalized (0..1) position.
    /// Out-of-range positions are clamped to the grid edge.
    pub fn add_point(&mut self, nx: f64, ny: f64) {
        let col = ((nx.clamp(0.0, 1.0)) * HEATMAP_CELLS as f64) as usize;
        let row = ((ny.clamp(0.0, 1.0)) * HEATMAP_CELLS as f64) as usize;
        let col = col.min(HEATMAP_CELLS - 1);
        let row = row.min(HEATMAP_CELLS - 1);
        self.cells[row * HEATMAP_CELLS + col] += 1;
    }

    pub fn merge(&mut self, other: &HeatmapGrid) {
        for (dst, src) in self.cells.iter_mut().zip(other.cells.iter()) {
            *dst += src;
        }
    }

    pub fn cell(&self, row: usize, col: usize) -> u32 {
        self.cells[row * HEATMAP_CELLS + col]
    }

    pub fn total(&self) -> u64 {
        self.cells.iter().map(|&c| c as u64).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.iter().all(|&c| c == 0)
    }
}

/// In-memory accumulator for one bucket key.
/// Values are monotonically non-decreasing within a flush epoch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HourlyBucket {
    pub visitor_count: u64,
    pub male_count: u64,
    pub female_count: u64,
    /// Detected object label -> count (BTreeMap for stable serialization)
    pub object_counts: BTreeMap<String, u64>,
    #[serde(default)]
    pub heatmap: HeatmapGrid,
}

impl HourlyBucket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_visitors(&mut self, count: u64) {
        self.visitor_count += count;
    }

    pub fn add_gender(&mut self, gender: Gender) {
        match gender {
            Gender::Male => self.male_count += 1,
            Gender::Female => self.female_count += 1,
        }
    }

    pub fn add_object(&mut self, label: &str, count: u64) {
        *self.object_counts.entry(label.to_string()).or_insert(0) += count;
    }

    /// Associative merge: counts add, object maps add per key, heatmaps
    /// add cell-wise.
    pub fn merge(&mut self, other: &HourlyBucket) {
        self.visitor_count += other.visitor_count;
        self.male_count += other.male_count;
        self.female_count += other.female_count;
        for (label, count) in &other.object_counts {
            *self.object_counts.entry(label.clone()).or_insert(0) += count;
        }
        self.heatmap.merge(&other.heatmap);
    }

    pub fn is_empty(&self) -> bool {
        self.visitor_count == 0
            && self.male_count == 0
            && self.female_count == 0
            && self.object_counts.is_empty()
            && self.heatmap.is_empty()
    }

    /// Drain the accumulator into a flushable delta, leaving it empty
    pub fn take_delta(&mut self, key: BucketKey) -> BucketDelta {
        let drained = std::mem::take(self);
        BucketDelta { delta_id: Uuid::now_v7(), key, bucket: drained }
    }
}

/// A drained accumulator snapshot bound for the persistence gateway.
/// The UUIDv7 `delta_id` is the flush watermark token: a delta applied
/// once is never applied again, no matter how often it is replayed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketDelta {
    pub delta_id: Uuid,
    pub key: BucketKey,
    pub bucket: HourlyBucket,
}

/// Point-in-time cashier queue metrics. Derived, never mutated after
/// emission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub ts: DateTime<Utc>,
    pub queue_length: u32,
    pub estimated_wait_secs: f64,
    pub is_busy: bool,
    pub estimated_transactions: u64,
    pub date: NaiveDate,
    pub hour: u32,
}
