//! Fan-out of detection events, annotated snapshots and liveness heartbeats.
//!
//! Every configured channel gets its own attempt. A channel that is down,
//! rejects the message or panics is reported and skipped; the remaining
//! channels still receive it and the caller never sees an error.

mod channels;
mod payload;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

pub use channels::{
    BridgeChannel, BridgeTopics, BrokerChannel, BrokerTopics, Outbound, OutboundChannel,
};
pub use payload::{
    BridgeImage, CameraDescriptor, Heartbeat, HeartbeatKind, SnapshotMeta, SnapshotPayload,
    StringMessage,
};

use crate::detect::DetectionEvent;
use crate::error::RelayError;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1000);
const STOP_POLL: Duration = Duration::from_millis(50);

/// Per-channel result of one fan-out.
#[derive(Debug, Default)]
pub struct DeliveryReport {
    pub delivered: Vec<String>,
    pub failed: Vec<(String, RelayError)>,
}

impl DeliveryReport {
    pub fn all_delivered(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn delivered_to(&self, channel: &str) -> bool {
        self.delivered.iter().any(|name| name == channel)
    }

    pub fn failed_on(&self, channel: &str) -> bool {
        self.failed.iter().any(|(name, _)| name == channel)
    }
}

pub struct FanOutPublisher {
    channels: Vec<Arc<dyn OutboundChannel>>,
    camera: CameraDescriptor,
}

impl FanOutPublisher {
    pub fn new(camera: CameraDescriptor) -> Self {
        Self {
            channels: Vec::new(),
            camera,
        }
    }

    pub fn with_channel(mut self, channel: Arc<dyn OutboundChannel>) -> Self {
        self.channels.push(channel);
        self
    }

    pub fn channel_names(&self) -> Vec<&str> {
        self.channels.iter().map(|c| c.name()).collect()
    }

    pub fn camera(&self) -> &CameraDescriptor {
        &self.camera
    }

    /// Serialize once, then hand the same text to every detection channel.
    pub fn publish_detections(&self, event: &DetectionEvent) -> DeliveryReport {
        let json = match event.to_json() {
            Ok(json) => json,
            Err(e) => {
                RelayError::from(e).report("detections");
                return DeliveryReport::default();
            }
        };
        self.fan_out(&Outbound::Detections { json: &json })
    }

    /// Publish an annotated image together with the detections it belongs to.
    pub fn publish_snapshot(
        &self,
        image: &[u8],
        ts_ms: u64,
        latest: &DetectionEvent,
    ) -> DeliveryReport {
        let snapshot = SnapshotPayload::annotated(
            image,
            ts_ms,
            Some(latest.frame_id),
            latest.detections.clone(),
            self.camera.clone(),
        );
        self.fan_out(&Outbound::Snapshot(&snapshot))
    }

    pub fn publish_heartbeat(&self) -> DeliveryReport {
        self.publish_heartbeat_at(crate::engine::now_ms())
    }

    pub fn publish_heartbeat_at(&self, ts_ms: u64) -> DeliveryReport {
        self.fan_out(&Outbound::Heartbeat(&Heartbeat::at(ts_ms)))
    }

    fn fan_out(&self, message: &Outbound<'_>) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        for channel in self.channels.iter().filter(|c| c.carries(message)) {
            let name = channel.name().to_string();
            let outcome = catch_unwind(AssertUnwindSafe(|| channel.deliver(message)))
                .unwrap_or_else(|_| {
                    Err(RelayError::Publish {
                        transport: name.clone(),
                        reason: "channel panicked".to_string(),
                    })
                });
            match outcome {
                Ok(()) => report.delivered.push(name),
                Err(e) => {
                    e.report(&format!("{} {}", name, message.label()));
                    report.failed.push((name, e));
                }
            }
        }
        report
    }

    /// Start the periodic liveness signal on its own thread.
    pub fn spawn_heartbeat(self: &Arc<Self>, interval: Duration) -> Result<HeartbeatHandle> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let publisher = self.clone();
        let join = std::thread::Builder::new()
            .name("heartbeat".to_string())
            .spawn(move || run_heartbeat(&publisher, interval, &shutdown_thread))
            .map_err(|e| anyhow!("failed to spawn heartbeat thread: {}", e))?;
        Ok(HeartbeatHandle {
            shutdown,
            join: Some(join),
        })
    }
}

fn run_heartbeat(publisher: &FanOutPublisher, interval: Duration, shutdown: &AtomicBool) {
    log::debug!("heartbeat every {}ms", interval.as_millis());
    loop {
        let deadline = Instant::now() + interval;
        while Instant::now() < deadline {
            if shutdown.load(Ordering::SeqCst) {
                return;
            }
            std::thread::sleep(STOP_POLL.min(deadline.saturating_duration_since(Instant::now())));
        }
        if shutdown.load(Ordering::SeqCst) {
            return;
        }
        publisher.publish_heartbeat();
    }
}

pub struct HeartbeatHandle {
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl HeartbeatHandle {
    pub fn stop(mut self) -> Result<()> {
        self.halt()
    }

    fn halt(&mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("heartbeat thread panicked"))?;
        }
        Ok(())
    }
}

impl Drop for HeartbeatHandle {
    fn drop(&mut self) {
        if let Err(e) = self.halt() {
            log::warn!("{}", e);
        }
    }
}
