//! Detection frame sources
//!
//! The pipelines consume frames through the `DetectionSource` trait so
//! the tracking core never knows whether frames come from a live
//! detector or a recorded log. The file source replays JSONL detection
//! logs (one frame object per line); a malformed line degrades to an
//! empty frame rather than killing the feed.

use crate::domain::types::FrameDetections;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

/// Ordered stream of detection frames for one feed
#[async_trait]
pub trait DetectionSource: Send {
    /// Next frame, or None when the source is exhausted
    async fn next_frame(&mut self) -> Option<FrameDetections>;
}

/// Replays a recorded JSONL detection log
pub struct JsonlReplay {
    frames: VecDeque<Result<FrameDetections, String>>,
}

impl JsonlReplay {
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read replay file {}: {e}", path.display()))?;

        let frames: VecDeque<Result<FrameDetections, String>> = content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(|e| e.to_string()))
            .collect();

        info!(file = %path.display(), frames = %frames.len(), "replay_opened");
        Ok(Self { frames })
    }
}

#[async_trait]
impl DetectionSource for JsonlReplay {
    async fn next_frame(&mut self) -> Option<FrameDetections> {
        match self.frames.pop_front()? {
            Ok(frame) => Some(frame),
            Err(e) => {
                warn!(error = %e, "replay_frame_malformed");
                // Empty frame keeps track aging ticking over
                Some(FrameDetections { ts: chrono::Utc::now(), detections: Vec::new() })
            }
        }
    }
}

/// Fixed in-memory frame sequence, used by tests
pub struct ScriptedSource {
    frames: VecDeque<FrameDetections>,
}

impl ScriptedSource {
    pub fn new(frames: Vec<FrameDetections>) -> Self {
        Self { frames: frames.into() }
    }
}

#[async_trait]
impl DetectionSource for ScriptedSource {
    async fn next_frame(&mut self) -> Option<FrameDetections> {
        self.frames.pop_front()
    }
}
