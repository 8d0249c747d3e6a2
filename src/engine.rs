//! Engine context owned by the host process and shared with pipeline callbacks.
//!
//! `on_frame` and `on_image_sample` are called from the pipeline's own
//! threads. They never return errors and never panic on I/O or transport
//! failures; the worst they do is local file writes and queued publishes.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;

use crate::config::RelayConfig;
use crate::detect::{DetectionAggregator, DetectionEvent, FrameMetadata};
use crate::error::RelayError;
use crate::fanout::{FanOutPublisher, HeartbeatHandle, HEARTBEAT_INTERVAL};
use crate::snapshot::{CaptureHandle, ImageKind, SampleOutcome, SnapshotController};
use crate::storage::SnapshotStore;

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub struct Engine {
    aggregator: DetectionAggregator,
    controller: SnapshotController,
    fanout: Arc<FanOutPublisher>,
    heartbeat: Mutex<Option<HeartbeatHandle>>,
}

impl Engine {
    pub fn new(controller: SnapshotController, fanout: FanOutPublisher) -> Self {
        Self {
            aggregator: DetectionAggregator::new(),
            controller,
            fanout: Arc::new(fanout),
            heartbeat: Mutex::new(None),
        }
    }

    pub fn from_config(cfg: &RelayConfig, fanout: FanOutPublisher) -> Self {
        let controller = SnapshotController::with_grace(
            CaptureHandle::new(cfg.capture_config()),
            SnapshotStore::new(&cfg.snapshot.dir),
            cfg.snapshot.grace_ms,
        );
        Self::new(controller, fanout)
    }

    pub fn aggregator(&self) -> &DetectionAggregator {
        &self.aggregator
    }

    pub fn controller(&self) -> &SnapshotController {
        &self.controller
    }

    pub fn capture(&self) -> &CaptureHandle {
        self.controller.capture()
    }

    pub fn fanout(&self) -> &Arc<FanOutPublisher> {
        &self.fanout
    }

    /// Begin the 1 s heartbeat. A second call is a no-op.
    pub fn start_heartbeat(&self) -> Result<()> {
        self.start_heartbeat_every(HEARTBEAT_INTERVAL)
    }

    pub fn start_heartbeat_every(&self, interval: Duration) -> Result<()> {
        let mut slot = self.heartbeat.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(self.fanout.spawn_heartbeat(interval)?);
        }
        Ok(())
    }

    /// One frame from the pipeline. `None` means the frame carried no metadata.
    pub fn on_frame(&self, metadata: Option<&FrameMetadata>) -> Option<Arc<DetectionEvent>> {
        let Some(metadata) = metadata else {
            RelayError::UpstreamMetadataAbsent.report("frame");
            return None;
        };
        let event = self
            .aggregator
            .ingest(metadata.frame_id, &metadata.detections);
        log::debug!(
            "frame {}: {}",
            event.frame_id,
            self.aggregator.latest_counters()
        );
        self.fanout.publish_detections(&event);
        Some(event)
    }

    /// Periodic trigger check against the latest event.
    pub fn tick(&self, now_ms: u64) -> Option<String> {
        self.controller
            .check_trigger(now_ms, &self.aggregator.latest())
    }

    /// One image sample. Runs the trigger check first, as the sample itself is
    /// the pipeline's clock.
    pub fn on_image_sample(&self, kind: ImageKind, data: &[u8], now_ms: u64) -> SampleOutcome {
        self.tick(now_ms);
        let outcome = self.controller.on_sample(kind, data, now_ms);
        if outcome.should_publish() {
            self.fanout
                .publish_snapshot(data, now_ms, &self.aggregator.latest());
        }
        outcome
    }

    /// Stop the heartbeat and wait for its thread.
    pub fn shutdown(&self) -> Result<()> {
        let handle = self
            .heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match handle {
            Some(handle) => handle.stop(),
            None => Ok(()),
        }
    }
}
