//! Spill log - last-resort durability for bucket deltas
//!
//! When the persistence gateway stays down past the failure budget,
//! buffered deltas are appended here instead of being held in memory
//! forever. On startup the log is replayed through the normal flush
//! path, where the delta-id watermark makes re-application harmless.

use crate::domain::bucket::BucketDelta;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub struct SpillLog {
    file_path: PathBuf,
}

impl SpillLog {
    pub fn new<P: AsRef<Path>>(file_path: P) -> Self {
        Self { file_path: file_path.as_ref().to_path_buf() }
    }

    pub fn append(&self, delta: &BucketDelta) -> std::io::Result<()> {
        if let Some(parent) = self.file_path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let json = serde_json::to_string(delta)?;
        let mut file = OpenOptions::new().create(true).append(true).open(&self.file_path)?;
        writeln!(file, "{}", json)?;
        debug!(delta_id = %delta.delta_id, "delta_spilled");
        Ok(())
    }

    /// Replace the whole log with the given deltas. Written to a
    /// sibling file first and renamed over the log, so a crash leaves
    /// either the old contents or the new, never a partial file.
    pub fn rewrite(&self, deltas: &[BucketDelta]) -> std::io::Result<()> {
        if deltas.is_empty() {
            return self.clear();
        }

        if let Some(parent) = self.file_path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut lines = String::new();
        for delta in deltas {
            lines.push_str(&serde_json::to_string(delta)?);
            lines.push('\n');
        }

        let tmp = self.file_path.with_extension("tmp");
        std::fs::write(&tmp, lines)?;
        std::fs::rename(&tmp, &self.file_path)?;
        debug!(count = %deltas.len(), "spill_log_rewritten");
        Ok(())
    }

    /// Read every delta in the log. Malformed lines are skipped with a
    /// warning; a missing file is simply an empty log.
    pub fn read_all(&self) -> Vec<BucketDelta> {
        let content = match std::fs::read_to_string(&self.file_path) {
            Ok(c) => c,
            Err(_) => return Vec::new(),
        };

        let mut deltas = Vec::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<BucketDelta>(line) {
                Ok(delta) => deltas.push(delta),
                Err(e) => warn!(error = %e, "spill_line_malformed"),
            }
        }
        if !deltas.is_empty() {
            info!(count = %deltas.len(), "spill_log_loaded");
        }
        deltas
    }

    /// Remove the log after its contents have been durably applied
    pub fn clear(&self) -> std::io::Result<()> {
        match std::fs::remove_file(&self.file_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}
