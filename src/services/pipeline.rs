//! Per-feed processing pipeline
//!
//! Each camera feed runs one pipeline task: frames come in through a
//! `DetectionSource`, pass through that feed's `Tracker`, and the
//! resulting lifecycle events are dispatched to the stage matching the
//! feed's role (entrance counting, section dwell, or queue estimation).
//! Stage outputs are forwarded to the aggregator over a bounded channel
//! with drop-oldest overflow handling, so one slow consumer degrades
//! counts instead of stalling frame processing.

use crate::domain::bucket::{BucketKey, HourlyBucket};
use crate::domain::types::{Detection, FeedRole, FrameDetections, TrackEvent, TrackEventKind};
use crate::infra::config::{Config, FeedConfig};
use crate::infra::metrics::Metrics;
use crate::io::replay::DetectionSource;
use crate::services::aggregator::AggregatorEvent;
use crate::services::dwell::SectionDwellTracker;
use crate::services::entrance::EntranceCounter;
use crate::services::queue::QueueEstimator;
use crate::services::tracker::Tracker;
use anyhow::anyhow;
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::watch;
use tracing::{info, warn};

/// Bounded sender with drop-oldest overflow.
///
/// Events are staged in a local outbox and pushed in order. When the
/// channel stays full past the send timeout, the oldest pending event
/// is shed and counted; frame processing never blocks indefinitely on
/// the aggregator.
pub struct FeedSender {
    tx: mpsc::Sender<AggregatorEvent>,
    outbox: VecDeque<AggregatorEvent>,
    send_timeout: Duration,
    metrics: Arc<Metrics>,
}

impl FeedSender {
    pub fn new(
        tx: mpsc::Sender<AggregatorEvent>,
        send_timeout_ms: u64,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            tx,
            outbox: VecDeque::new(),
            send_timeout: Duration::from_millis(send_timeout_ms),
            metrics,
        }
    }

    pub async fn send(&mut self, event: AggregatorEvent) {
        self.outbox.push_back(event);
        while let Some(event) = self.outbox.pop_front() {
            match self.tx.send_timeout(event, self.send_timeout).await {
                Ok(()) => {}
                Err(SendTimeoutError::Timeout(dropped)) => {
                    // Shed the oldest pending event and move on
                    drop(dropped);
                    self.metrics.record_event_dropped();
                    warn!(pending = %self.outbox.len(), "aggregator_event_dropped");
                    break;
                }
                Err(SendTimeoutError::Closed(_)) => {
                    self.outbox.clear();
                    break;
                }
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.outbox.len()
    }
}

/// Role-specific downstream stage of a pipeline
enum Stage {
    Entrance(EntranceCounter),
    Section { dwell: SectionDwellTracker, section: String },
    Cashier(QueueEstimator),
}

pub struct FeedPipeline {
    feed: FeedConfig,
    tracker: Tracker,
    stage: Stage,
    sender: FeedSender,
    metrics: Arc<Metrics>,
    section_sample_interval: u64,
    queue_sample_interval: u64,
    frame_count: u64,
}

impl FeedPipeline {
    pub fn new(
        feed: FeedConfig,
        config: &Config,
        tx: mpsc::Sender<AggregatorEvent>,
        metrics: Arc<Metrics>,
    ) -> anyhow::Result<Self> {
        let tracker = Tracker::with_metrics(config.tracker().clone(), Arc::clone(&metrics));

        let stage = match feed.role {
            FeedRole::Entrance => Stage::Entrance(EntranceCounter::with_metrics(
                config.pipeline().entrance_flush_interval_ms,
                Arc::clone(&metrics),
            )),
            FeedRole::Section => {
                let section = feed
                    .section
                    .clone()
                    .ok_or_else(|| anyhow!("section feed '{}' missing section name", feed.id))?;
                let zone = feed
                    .zone
                    .ok_or_else(|| anyhow!("section feed '{}' missing zone", feed.id))?;
                Stage::Section {
                    dwell: SectionDwellTracker::with_metrics(
                        &section,
                        zone,
                        config.dwell(),
                        Arc::clone(&metrics),
                    ),
                    section,
                }
            }
            FeedRole::Cashier => {
                let queue_zone = feed
                    .queue_zone
                    .ok_or_else(|| anyhow!("cashier feed '{}' missing queue_zone", feed.id))?;
                let counter_zone = feed
                    .counter_zone
                    .ok_or_else(|| anyhow!("cashier feed '{}' missing counter_zone", feed.id))?;
                Stage::Cashier(QueueEstimator::with_metrics(
                    queue_zone,
                    counter_zone,
                    config.queue(),
                    Arc::clone(&metrics),
                ))
            }
        };

        let sender =
            FeedSender::new(tx, config.pipeline().send_timeout_ms, Arc::clone(&metrics));

        Ok(Self {
            feed,
            tracker,
            stage,
            sender,
            metrics,
            section_sample_interval: config.pipeline().section_sample_interval_frames,
            queue_sample_interval: config.queue().sample_interval_frames,
            frame_count: 0,
        })
    }

    /// Run one frame through the tracker and the role stage
    pub async fn process_frame(&mut self, frame: FrameDetections) {
        let started = Instant::now();
        self.frame_count += 1;

        let persons: Vec<Detection> =
            frame.detections.iter().filter(|d| d.is_person()).cloned().collect();
        let events = self.tracker.update(&persons, frame.ts);

        match &mut self.stage {
            Stage::Entrance(counter) => {
                for event in &events {
                    counter.handle_event(event);
                }
                for (key, visitors) in counter.maybe_flush(frame.ts) {
                    self.sender.send(AggregatorEvent::EntranceDelta { key, visitors }).await;
                }
            }
            Stage::Section { dwell, section } => {
                for event in &events {
                    if let Some(record) = dwell.handle_event(event) {
                        self.sender.send(AggregatorEvent::DwellClosed(record)).await;
                    }
                }
                if self.frame_count % self.section_sample_interval == 0 {
                    let sample = Self::section_sample(&self.feed, &frame, &persons);
                    if !sample.is_empty() {
                        let key = BucketKey::new(frame.ts, Some(section));
                        self.sender.send(AggregatorEvent::SectionSample { key, sample }).await;
                    }
                }
            }
            Stage::Cashier(queue) => {
                for event in &events {
                    if event.kind == TrackEventKind::Closed {
                        queue.handle_closed(event.track_id);
                    }
                }
                if self.frame_count % self.queue_sample_interval == 0 {
                    let snapshot = queue.observe(self.tracker.active(), frame.ts);
                    self.sender.send(AggregatorEvent::QueueSample(snapshot)).await;
                }
            }
        }

        let latency_us = started.elapsed().as_micros() as u64;
        self.metrics.record_frame(frame.detections.len(), latency_us);
    }

    /// Sampled section statistics for one frame: zone occupancy and
    /// demographics from person detections, object counts from all
    /// detections in the zone, heatmap points over the whole frame.
    fn section_sample(
        feed: &FeedConfig,
        frame: &FrameDetections,
        persons: &[Detection],
    ) -> HourlyBucket {
        let mut sample = HourlyBucket::new();
        let zone = match feed.zone {
            Some(zone) => zone,
            None => return sample,
        };

        let mut in_zone = 0u64;
        for det in persons {
            let (cx, cy) = det.bbox.center();
            if zone.contains(cx, cy) {
                in_zone += 1;
                if let Some(gender) = det.gender {
                    sample.add_gender(gender);
                }
            }
            sample.heatmap.add_point(cx / feed.frame_width, cy / feed.frame_height);
        }
        sample.add_visitors(in_zone);

        for det in &frame.detections {
            let (cx, cy) = det.bbox.center();
            if zone.contains(cx, cy) {
                sample.add_object(&det.label, 1);
            }
        }

        sample
    }

    /// Drive the pipeline until the source is exhausted or shutdown is
    /// signalled, then emit synthetic closures and final deltas.
    pub async fn run(
        mut self,
        mut source: Box<dyn DetectionSource>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(feed = %self.feed.id, role = %self.feed.role.as_str(), "pipeline_started");

        loop {
            tokio::select! {
                frame = source.next_frame() => {
                    match frame {
                        Some(frame) => self.process_frame(frame).await,
                        None => break,
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.finish().await;
        info!(feed = %self.feed.id, frames = %self.frame_count, "pipeline_stopped");
    }

    /// Close every live track and release all pending stage output
    async fn finish(&mut self) {
        let now = Utc::now();
        let closures = self.tracker.close_all(now);
        self.dispatch_closures(&closures).await;

        match &mut self.stage {
            Stage::Entrance(counter) => {
                for (key, visitors) in counter.drain() {
                    self.sender.send(AggregatorEvent::EntranceDelta { key, visitors }).await;
                }
            }
            Stage::Section { dwell, .. } => {
                // Backstop for intervals the synthetic closures missed
                for record in dwell.close_all(now) {
                    self.sender.send(AggregatorEvent::DwellClosed(record)).await;
                }
            }
            Stage::Cashier(_) => {}
        }
    }

    async fn dispatch_closures(&mut self, closures: &[TrackEvent]) {
        match &mut self.stage {
            Stage::Entrance(counter) => {
                for event in closures {
                    counter.handle_event(event);
                }
            }
            Stage::Section { dwell, .. } => {
                for event in closures {
                    if let Some(record) = dwell.handle_event(event) {
                        self.sender.send(AggregatorEvent::DwellClosed(record)).await;
                    }
                }
            }
            Stage::Cashier(queue) => {
                for event in closures {
                    queue.handle_closed(event.track_id);
                }
            }
        }
    }
}
