//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml
//!
//! All tracking thresholds (miss limit, grace window, minimum dwell,
//! busy threshold, service time) are business tunables, not hard
//! requirements, so everything is exposed here with defaults.

use crate::domain::types::{BBox, FeedId, FeedRole};
use anyhow::{bail, Context};
use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct TrackerConfig {
    #[serde(default = "default_iou_threshold")]
    pub iou_threshold: f64,
    #[serde(default = "default_miss_limit")]
    pub miss_limit: u32,
    #[serde(default = "default_grace_ms")]
    pub grace_ms: u64,
}

fn default_iou_threshold() -> f64 {
    0.3
}

fn default_miss_limit() -> u32 {
    5
}

fn default_grace_ms() -> u64 {
    1000
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            iou_threshold: default_iou_threshold(),
            miss_limit: default_miss_limit(),
            grace_ms: default_grace_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DwellConfig {
    /// Intervals shorter than this are discarded as detection flicker
    #[serde(default = "default_min_dwell_secs")]
    pub min_dwell_secs: f64,
}

fn default_min_dwell_secs() -> f64 {
    3.0
}

impl Default for DwellConfig {
    fn default() -> Self {
        Self { min_dwell_secs: default_min_dwell_secs() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Average service time per customer, used for wait estimation
    #[serde(default = "default_avg_service_time_secs")]
    pub avg_service_time_secs: f64,
    /// Queue is busy when its length strictly exceeds this
    #[serde(default = "default_busy_threshold")]
    pub busy_threshold: u32,
    /// Emit a queue snapshot every N processed frames
    #[serde(default = "default_queue_sample_frames")]
    pub sample_interval_frames: u64,
}

fn default_avg_service_time_secs() -> f64 {
    120.0
}

fn default_busy_threshold() -> u32 {
    3
}

fn default_queue_sample_frames() -> u64 {
    30
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            avg_service_time_secs: default_avg_service_time_secs(),
            busy_threshold: default_busy_threshold(),
            sample_interval_frames: default_queue_sample_frames(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Bounded channel capacity between feeds and the aggregator
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// How long a feed blocks on a full channel before dropping its
    /// oldest pending event
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    /// Sample section statistics (counts, gender, heatmap) every N frames
    #[serde(default = "default_section_sample_frames")]
    pub section_sample_interval_frames: u64,
    /// Entrance counters emit accumulated deltas at this cadence
    #[serde(default = "default_entrance_flush_ms")]
    pub entrance_flush_interval_ms: u64,
}

fn default_channel_capacity() -> usize {
    1000
}

fn default_send_timeout_ms() -> u64 {
    50
}

fn default_section_sample_frames() -> u64 {
    30
}

fn default_entrance_flush_ms() -> u64 {
    5000
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            send_timeout_ms: default_send_timeout_ms(),
            section_sample_interval_frames: default_section_sample_frames(),
            entrance_flush_interval_ms: default_entrance_flush_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AggregatorConfig {
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
    /// Upsert attempts per delta within one flush cycle
    #[serde(default = "default_max_flush_attempts")]
    pub max_flush_attempts: u32,
    /// Base for exponential backoff between attempts
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// After this many consecutive failed cycles, buffered deltas are
    /// spilled to the fallback log
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    /// Bound on deltas buffered in memory while the gateway is down
    #[serde(default = "default_max_buffered_deltas")]
    pub max_buffered_deltas: usize,
    /// Applied delta ids remembered for replay detection; the oldest
    /// are evicted past this
    #[serde(default = "default_watermark_capacity")]
    pub watermark_capacity: usize,
    #[serde(default = "default_spill_file")]
    pub spill_file: String,
}

fn default_flush_interval_secs() -> u64 {
    30
}

fn default_max_flush_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    100
}

fn default_max_consecutive_failures() -> u32 {
    5
}

fn default_max_buffered_deltas() -> usize {
    256
}

fn default_watermark_capacity() -> usize {
    8192
}

fn default_spill_file() -> String {
    "data/spill.jsonl".to_string()
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            flush_interval_secs: default_flush_interval_secs(),
            max_flush_attempts: default_max_flush_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            max_consecutive_failures: default_max_consecutive_failures(),
            max_buffered_deltas: default_max_buffered_deltas(),
            watermark_capacity: default_watermark_capacity(),
            spill_file: default_spill_file(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EgressConfig {
    #[serde(default = "default_buckets_file")]
    pub buckets_file: String,
    #[serde(default = "default_dwell_file")]
    pub dwell_file: String,
    #[serde(default = "default_queue_file")]
    pub queue_file: String,
}

fn default_buckets_file() -> String {
    "data/hourly_buckets.jsonl".to_string()
}

fn default_dwell_file() -> String {
    "data/dwell_records.jsonl".to_string()
}

fn default_queue_file() -> String {
    "data/queue_snapshots.jsonl".to_string()
}

impl Default for EgressConfig {
    fn default() -> Self {
        Self {
            buckets_file: default_buckets_file(),
            dwell_file: default_dwell_file(),
            queue_file: default_queue_file(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval_secs")]
    pub interval_secs: u64,
}

fn default_metrics_interval_secs() -> u64 {
    10
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval_secs() }
    }
}

/// Raw per-feed entry as it appears in TOML
#[derive(Debug, Clone, Deserialize)]
pub struct TomlFeed {
    pub id: String,
    pub role: FeedRole,
    /// Section name, required for section feeds
    #[serde(default)]
    pub section: Option<String>,
    /// Section zone as [x1, y1, x2, y2] frame coordinates
    #[serde(default)]
    pub zone: Option<[f64; 4]>,
    /// Cashier queue zone as [x1, y1, x2, y2]
    #[serde(default)]
    pub queue_zone: Option<[f64; 4]>,
    /// Cashier counter zone as [x1, y1, x2, y2]
    #[serde(default)]
    pub counter_zone: Option<[f64; 4]>,
    /// Recorded detection log replayed as this feed's frame source
    #[serde(default)]
    pub replay_file: Option<String>,
    #[serde(default = "default_frame_width")]
    pub frame_width: f64,
    #[serde(default = "default_frame_height")]
    pub frame_height: f64,
}

fn default_frame_width() -> f64 {
    640.0
}

fn default_frame_height() -> f64 {
    480.0
}

/// Validated feed configuration used by the pipelines
#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub id: FeedId,
    pub role: FeedRole,
    pub section: Option<String>,
    pub zone: Option<BBox>,
    pub queue_zone: Option<BBox>,
    pub counter_zone: Option<BBox>,
    pub replay_file: Option<String>,
    pub frame_width: f64,
    pub frame_height: f64,
}

impl FeedConfig {
    fn from_toml(raw: TomlFeed) -> anyhow::Result<Self> {
        let corners = |c: [f64; 4]| BBox::from_corners(c[0], c[1], c[2], c[3]);

        match raw.role {
            FeedRole::Section => {
                if raw.section.is_none() {
                    bail!("feed '{}' has role=section but no section name", raw.id);
                }
                if raw.zone.is_none() {
                    bail!("feed '{}' has role=section but no zone", raw.id);
                }
            }
            FeedRole::Cashier => {
                if raw.queue_zone.is_none() || raw.counter_zone.is_none() {
                    bail!("feed '{}' has role=cashier but is missing queue_zone/counter_zone", raw.id);
                }
            }
            FeedRole::Entrance => {}
        }

        Ok(Self {
            id: FeedId(raw.id),
            role: raw.role,
            section: raw.section,
            zone: raw.zone.map(corners),
            queue_zone: raw.queue_zone.map(corners),
            counter_zone: raw.counter_zone.map(corners),
            replay_file: raw.replay_file,
            frame_width: raw.frame_width,
            frame_height: raw.frame_height,
        })
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub dwell: DwellConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub aggregator: AggregatorConfig,
    #[serde(default)]
    pub egress: EgressConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub feeds: Vec<TomlFeed>,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    tracker: TrackerConfig,
    dwell: DwellConfig,
    queue: QueueConfig,
    pipeline: PipelineConfig,
    aggregator: AggregatorConfig,
    egress: EgressConfig,
    metrics: MetricsConfig,
    feeds: Vec<FeedConfig>,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tracker: TrackerConfig::default(),
            dwell: DwellConfig::default(),
            queue: QueueConfig::default(),
            pipeline: PipelineConfig::default(),
            aggregator: AggregatorConfig::default(),
            egress: EgressConfig::default(),
            metrics: MetricsConfig::default(),
            feeds: Vec::new(),
            config_file: "default".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        // Intervals divide frame counters and the channel must hold at
        // least one event, so zero is a misconfiguration, not a tunable
        if toml_config.queue.sample_interval_frames == 0 {
            bail!("queue.sample_interval_frames must be at least 1");
        }
        if toml_config.pipeline.section_sample_interval_frames == 0 {
            bail!("pipeline.section_sample_interval_frames must be at least 1");
        }
        if toml_config.pipeline.channel_capacity == 0 {
            bail!("pipeline.channel_capacity must be at least 1");
        }

        let feeds = toml_config
            .feeds
            .into_iter()
            .map(FeedConfig::from_toml)
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(Self {
            tracker: toml_config.tracker,
            dwell: toml_config.dwell,
            queue: toml_config.queue,
            pipeline: toml_config.pipeline,
            aggregator: toml_config.aggregator,
            egress: toml_config.egress,
            metrics: toml_config.metrics,
            feeds,
            config_file: path.display().to_string(),
        })
    }

    /// Load configuration - tries TOML file first, falls back to defaults
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Warning: {}. Using defaults.", e);
                Self::default()
            }
        }
    }

    pub fn tracker(&self) -> &TrackerConfig {
        &self.tracker
    }

    pub fn dwell(&self) -> &DwellConfig {
        &self.dwell
    }

    pub fn queue(&self) -> &QueueConfig {
        &self.queue
    }

    pub fn pipeline(&self) -> &PipelineConfig {
        &self.pipeline
    }

    pub fn aggregator(&self) -> &AggregatorConfig {
        &self.aggregator
    }

    pub fn egress(&self) -> &EgressConfig {
        &self.egress
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics.interval_secs
    }

    pub fn feeds(&self) -> &[FeedConfig] {
        &self.feeds
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder method for tests to tighten tracker thresholds
    #[cfg(test)]
    pub fn with_tracker(mut self, tracker: TrackerConfig) -> Self {
        self.tracker = tracker;
        self
    }

    /// Builder method for tests to set the minimum dwell
    #[cfg(test)]
    pub fn with_min_dwell_secs(mut self, secs: f64) -> Self {
        self.dwell.min_dwell_secs = secs;
        self
    }
}
