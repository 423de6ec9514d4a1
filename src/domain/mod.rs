//! Domain models - core business types for tracking and aggregation
//!
//! This module contains the canonical data types used throughout the system:
//! - `Track` / `TrackEvent` - per-feed person identity and lifecycle events
//! - `DwellInterval` / `DwellRecord` - section presence spans
//! - `BucketKey` / `HourlyBucket` / `BucketDelta` - hour-bucketed aggregates
//! - `QueueSnapshot` - cashier queue metrics
//! - `Detection` / `BBox` - detector output consumed at the ingestion boundary

pub mod bucket;
pub mod dwell;
pub mod types;
