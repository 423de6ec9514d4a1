//! Persistence gateway - durable sink for aggregates
//!
//! The aggregator speaks to storage through the `PersistenceGateway`
//! trait. The production implementation appends JSONL (one JSON object
//! per line) to per-stream files; tests substitute an in-memory
//! gateway with failure injection.
//!
//! Bucket upserts MUST be idempotent on `delta_id`: the aggregator
//! retries failed flushes and replays spilled deltas, so the same delta
//! may arrive more than once.

use crate::domain::bucket::{BucketDelta, QueueSnapshot};
use crate::domain::dwell::DwellRecord;
use crate::infra::config::EgressConfig;
use async_trait::async_trait;
use rustc_hash::FxHashSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("gateway serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("gateway unavailable: {0}")]
    Unavailable(String),
}

/// Durable sink for the three aggregate streams
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Apply a bucket delta. Must be idempotent on `delta_id`.
    async fn upsert_bucket(&self, delta: &BucketDelta) -> Result<(), GatewayError>;

    async fn write_dwell(&self, record: &DwellRecord) -> Result<(), GatewayError>;

    async fn write_queue(&self, snapshot: &QueueSnapshot) -> Result<(), GatewayError>;
}

/// File-backed gateway appending JSONL per stream
pub struct JsonlGateway {
    buckets_file: String,
    dwell_file: String,
    queue_file: String,
    /// Delta ids already written to the buckets file, seeded from the
    /// file itself so a replay after restart stays a single line
    applied: parking_lot::Mutex<FxHashSet<Uuid>>,
}

impl JsonlGateway {
    pub fn new(cfg: &EgressConfig) -> Self {
        let applied = Self::load_applied_ids(&cfg.buckets_file);
        info!(
            buckets = %cfg.buckets_file,
            dwell = %cfg.dwell_file,
            queue = %cfg.queue_file,
            applied = %applied.len(),
            "gateway_initialized"
        );
        Self {
            buckets_file: cfg.buckets_file.clone(),
            dwell_file: cfg.dwell_file.clone(),
            queue_file: cfg.queue_file.clone(),
            applied: parking_lot::Mutex::new(applied),
        }
    }

    fn load_applied_ids(buckets_file: &str) -> FxHashSet<Uuid> {
        let content = match std::fs::read_to_string(buckets_file) {
            Ok(c) => c,
            Err(_) => return FxHashSet::default(),
        };

        let mut ids = FxHashSet::default();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<BucketDelta>(line) {
                Ok(delta) => {
                    ids.insert(delta.delta_id);
                }
                Err(e) => warn!(error = %e, "bucket_line_malformed"),
            }
        }
        ids
    }

    /// Append a line, creating parent directories on first use
    fn append_line(file_path: &str, line: &str) -> std::io::Result<()> {
        let path = Path::new(file_path);

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{}", line)?;
        debug!(file = %file_path, bytes = %line.len(), "gateway_written");

        Ok(())
    }
}

#[async_trait]
impl PersistenceGateway for JsonlGateway {
    async fn upsert_bucket(&self, delta: &BucketDelta) -> Result<(), GatewayError> {
        if self.applied.lock().contains(&delta.delta_id) {
            debug!(delta_id = %delta.delta_id, "bucket_upsert_deduplicated");
            return Ok(());
        }
        let json = serde_json::to_string(delta)?;
        Self::append_line(&self.buckets_file, &json)?;
        self.applied.lock().insert(delta.delta_id);
        Ok(())
    }

    async fn write_dwell(&self, record: &DwellRecord) -> Result<(), GatewayError> {
        let json = serde_json::to_string(record)?;
        Self::append_line(&self.dwell_file, &json)?;
        Ok(())
    }

    async fn write_queue(&self, snapshot: &QueueSnapshot) -> Result<(), GatewayError> {
        let json = serde_json::to_string(snapshot)?;
        Self::append_line(&self.queue_file, &json)?;
        Ok(())
    }
}

/// In-memory gateway for tests. Can be armed to fail the next N calls
/// to exercise the aggregator's retry and spill paths, or to delay
/// upserts to exercise flush/ingest overlap.
#[derive(Default)]
pub struct MemoryGateway {
    buckets: parking_lot::Mutex<Vec<BucketDelta>>,
    dwell: parking_lot::Mutex<Vec<DwellRecord>>,
    queue: parking_lot::Mutex<Vec<QueueSnapshot>>,
    fail_next: std::sync::atomic::AtomicU32,
    upsert_delay_ms: std::sync::atomic::AtomicU64,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` gateway calls with `Unavailable`
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, std::sync::atomic::Ordering::SeqCst);
    }

    /// Make every bucket upsert take this long
    pub fn set_upsert_delay_ms(&self, ms: u64) {
        self.upsert_delay_ms.store(ms, std::sync::atomic::Ordering::SeqCst);
    }

    fn check_failure(&self) -> Result<(), GatewayError> {
        let remaining = self.fail_next.load(std::sync::atomic::Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next.store(remaining - 1, std::sync::atomic::Ordering::SeqCst);
            return Err(GatewayError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }

    pub fn buckets(&self) -> Vec<BucketDelta> {
        self.buckets.lock().clone()
    }

    pub fn dwell_records(&self) -> Vec<DwellRecord> {
        self.dwell.lock().clone()
    }

    pub fn queue_snapshots(&self) -> Vec<QueueSnapshot> {
        self.queue.lock().clone()
    }

    /// Total visitor count across all applied deltas for a given hour
    pub fn visitor_total(&self, hour: u32) -> u64 {
        self.buckets
            .lock()
            .iter()
            .filter(|d| d.key.hour == hour && d.key.section.is_none())
            .map(|d| d.bucket.visitor_count)
            .sum()
    }
}

#[async_trait]
impl PersistenceGateway for MemoryGateway {
    async fn upsert_bucket(&self, delta: &BucketDelta) -> Result<(), GatewayError> {
        let delay = self.upsert_delay_ms.load(std::sync::atomic::Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
        }
        self.check_failure()?;
        self.buckets.lock().push(delta.clone());
        Ok(())
    }

    async fn write_dwell(&self, record: &DwellRecord) -> Result<(), GatewayError> {
        self.check_failure()?;
        self.dwell.lock().push(record.clone());
        Ok(())
    }

    async fn write_queue(&self, snapshot: &QueueSnapshot) -> Result<(), GatewayError> {
        self.check_failure()?;
        self.queue.lock().push(snapshot.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::bucket::{BucketKey, HourlyBucket};
    use crate::domain::types::TrackId;
    use chrono::{TimeZone, Utc};
    use std::fs;
    use tempfile::tempdir;

    fn delta(visitors: u64) -> BucketDelta {
        let ts = Utc.with_ymd_and_hms(2025, 3, 14, 15, 0, 0).unwrap();
        let mut bucket = HourlyBucket::new();
        bucket.add_visitors(visitors);
        bucket.take_delta(BucketKey::new(ts, None))
    }

    #[tokio::test]
    async fn test_jsonl_gateway_appends_buckets() {
        let dir = tempdir().unwrap();
        let cfg = EgressConfig {
            buckets_file: dir.path().join("buckets.jsonl").to_str().unwrap().to_string(),
            dwell_file: dir.path().join("dwell.jsonl").to_str().unwrap().to_string(),
            queue_file: dir.path().join("queue.jsonl").to_str().unwrap().to_string(),
        };
        let gateway = JsonlGateway::new(&cfg);

        gateway.upsert_bucket(&delta(3)).await.unwrap();
        gateway.upsert_bucket(&delta(2)).await.unwrap();

        let content = fs::read_to_string(&cfg.buckets_file).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let parsed: BucketDelta = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed.bucket.visitor_count, 3);
        assert_eq!(parsed.key.hour, 15);
    }

    #[tokio::test]
    async fn test_jsonl_gateway_dedupes_replayed_delta() {
        let dir = tempdir().unwrap();
        let cfg = EgressConfig {
            buckets_file: dir.path().join("buckets.jsonl").to_str().unwrap().to_string(),
            dwell_file: dir.path().join("dwell.jsonl").to_str().unwrap().to_string(),
            queue_file: dir.path().join("queue.jsonl").to_str().unwrap().to_string(),
        };
        let gateway = JsonlGateway::new(&cfg);

        let d = delta(3);
        gateway.upsert_bucket(&d).await.unwrap();
        gateway.upsert_bucket(&d).await.unwrap();

        let content = fs::read_to_string(&cfg.buckets_file).unwrap();
        assert_eq!(content.lines().count(), 1);

        // A new gateway over the same file (restart) still dedupes
        let reopened = JsonlGateway::new(&cfg);
        reopened.upsert_bucket(&d).await.unwrap();
        let content = fs::read_to_string(&cfg.buckets_file).unwrap();
        assert_eq!(content.lines().count(), 1);

        // A fresh delta is still appended
        reopened.upsert_bucket(&delta(2)).await.unwrap();
        let content = fs::read_to_string(&cfg.buckets_file).unwrap();
        assert_eq!(content.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_jsonl_gateway_creates_parent_directories() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("deep").join("nested").join("buckets.jsonl");
        let cfg = EgressConfig {
            buckets_file: nested.to_str().unwrap().to_string(),
            dwell_file: dir.path().join("dwell.jsonl").to_str().unwrap().to_string(),
            queue_file: dir.path().join("queue.jsonl").to_str().unwrap().to_string(),
        };
        let gateway = JsonlGateway::new(&cfg);

        gateway.upsert_bucket(&delta(1)).await.unwrap();
        assert!(nested.exists());
    }

    #[tokio::test]
    async fn test_jsonl_gateway_writes_dwell_records() {
        let dir = tempdir().unwrap();
        let cfg = EgressConfig {
            buckets_file: dir.path().join("buckets.jsonl").to_str().unwrap().to_string(),
            dwell_file: dir.path().join("dwell.jsonl").to_str().unwrap().to_string(),
            queue_file: dir.path().join("queue.jsonl").to_str().unwrap().to_string(),
        };
        let gateway = JsonlGateway::new(&cfg);

        let entry = Utc.with_ymd_and_hms(2025, 3, 14, 15, 0, 0).unwrap();
        let record = DwellRecord {
            track_id: TrackId(7),
            section_name: "produce".to_string(),
            entry_time: entry,
            exit_time: entry + chrono::Duration::seconds(30),
            duration_seconds: 30.0,
            date: entry.date_naive(),
            hour: 15,
        };
        gateway.write_dwell(&record).await.unwrap();

        let content = fs::read_to_string(&cfg.dwell_file).unwrap();
        let parsed: DwellRecord = serde_json::from_str(content.trim()).unwrap();
        assert_eq!(parsed.section_name, "produce");
        assert!((parsed.duration_seconds - 30.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_memory_gateway_failure_injection() {
        let gateway = MemoryGateway::new();
        gateway.fail_next(2);

        assert!(gateway.upsert_bucket(&delta(1)).await.is_err());
        assert!(gateway.upsert_bucket(&delta(1)).await.is_err());
        assert!(gateway.upsert_bucket(&delta(1)).await.is_ok());
        assert_eq!(gateway.buckets().len(), 1);
    }
}
