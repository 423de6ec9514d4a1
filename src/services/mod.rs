//! Core services - tracking, counting, and aggregation
//!
//! - `tracker` - per-feed track identity across frames
//! - `dwell` - section presence intervals
//! - `entrance` - entrance visitor counting
//! - `queue` - cashier queue length and wait estimation
//! - `pipeline` - per-feed processing loop and channel plumbing
//! - `aggregator` - hour-bucketed merging and crash-safe flushing

pub mod aggregator;
pub mod dwell;
pub mod entrance;
pub mod pipeline;
pub mod queue;
pub mod tracker;

pub use aggregator::{Aggregator, AggregatorEvent, AggregatorHandle};
pub use dwell::SectionDwellTracker;
pub use entrance::EntranceCounter;
pub use pipeline::{FeedPipeline, FeedSender};
pub use queue::QueueEstimator;
pub use tracker::Tracker;
