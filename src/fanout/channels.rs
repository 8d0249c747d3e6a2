use std::sync::Arc;

use super::payload::{BridgeImage, Heartbeat, SnapshotPayload, StringMessage};
use crate::error::RelayResult;
use crate::transport::{JsonLinesSink, Transport};

/// One message handed to every channel by the fan-out publisher.
#[derive(Clone, Copy, Debug)]
pub enum Outbound<'a> {
    /// `json` is the serialized event, shared across channels.
    Detections { json: &'a str },
    Snapshot(&'a SnapshotPayload),
    Heartbeat(&'a Heartbeat),
}

impl Outbound<'_> {
    pub fn label(&self) -> &'static str {
        match self {
            Outbound::Detections { .. } => "detections",
            Outbound::Snapshot(_) => "snapshot",
            Outbound::Heartbeat(_) => "heartbeat",
        }
    }
}

/// An independent delivery path. Failures stay inside the channel's own result.
pub trait OutboundChannel: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this channel takes this kind of message at all.
    fn carries(&self, message: &Outbound<'_>) -> bool;

    fn deliver(&self, message: &Outbound<'_>) -> RelayResult<()>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerTopics {
    pub detections: String,
    pub heartbeat: String,
    pub snapshot: String,
}

impl Default for BrokerTopics {
    fn default() -> Self {
        Self {
            detections: "deepstream/detections".to_string(),
            heartbeat: "deepstream/detections".to_string(),
            snapshot: "deepstream/snap".to_string(),
        }
    }
}

/// Message broker: detections, heartbeat and the composite snapshot payload.
pub struct BrokerChannel {
    transport: Arc<dyn Transport>,
    topics: BrokerTopics,
}

impl BrokerChannel {
    pub fn new(transport: Arc<dyn Transport>, topics: BrokerTopics) -> Self {
        Self { transport, topics }
    }
}

impl OutboundChannel for BrokerChannel {
    fn name(&self) -> &str {
        self.transport.name()
    }

    fn carries(&self, _message: &Outbound<'_>) -> bool {
        true
    }

    fn deliver(&self, message: &Outbound<'_>) -> RelayResult<()> {
        match message {
            Outbound::Detections { json } => self
                .transport
                .publish(&self.topics.detections, json.as_bytes()),
            Outbound::Snapshot(snapshot) => {
                let payload = serde_json::to_vec(snapshot)?;
                self.transport.publish(&self.topics.snapshot, &payload)
            }
            Outbound::Heartbeat(heartbeat) => {
                let payload = serde_json::to_vec(heartbeat)?;
                self.transport.publish(&self.topics.heartbeat, &payload)
            }
        }
    }
}

/// Topic names on the pub/sub bridge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BridgeTopics {
    pub detections: String,
    pub image: String,
    pub snapshot_start: String,
    pub snapshot_stop: String,
    pub snapshot_period_ms: String,
}

impl BridgeTopics {
    pub fn with_prefix(prefix: &str) -> Self {
        let prefix = prefix.trim_end_matches('/');
        Self {
            detections: format!("{}/detections_json", prefix),
            image: format!("{}/image_osd_jpeg_b64", prefix),
            snapshot_start: format!("{}/snapshot/start", prefix),
            snapshot_stop: format!("{}/snapshot/stop", prefix),
            snapshot_period_ms: format!("{}/snapshot/period_ms", prefix),
        }
    }
}

impl Default for BridgeTopics {
    fn default() -> Self {
        Self::with_prefix("/deepstream")
    }
}

/// Pub/sub bridge: detections and annotated images wrapped as string messages.
pub struct BridgeChannel {
    transport: Arc<dyn Transport>,
    topics: BridgeTopics,
}

impl BridgeChannel {
    pub fn new(transport: Arc<dyn Transport>, topics: BridgeTopics) -> Self {
        Self { transport, topics }
    }

    fn publish_string(&self, topic: &str, data: &str) -> RelayResult<()> {
        let envelope = serde_json::to_vec(&StringMessage { data })?;
        self.transport.publish(topic, &envelope)
    }
}

impl OutboundChannel for BridgeChannel {
    fn name(&self) -> &str {
        self.transport.name()
    }

    fn carries(&self, message: &Outbound<'_>) -> bool {
        !matches!(message, Outbound::Heartbeat(_))
    }

    fn deliver(&self, message: &Outbound<'_>) -> RelayResult<()> {
        match message {
            Outbound::Detections { json } => self.publish_string(&self.topics.detections, json),
            Outbound::Snapshot(snapshot) => {
                let image = serde_json::to_string(&BridgeImage {
                    stamp: snapshot.ts_ms,
                    kind: "osd",
                    data_b64: &snapshot.image_b64,
                })?;
                self.publish_string(&self.topics.image, &image)
            }
            Outbound::Heartbeat(_) => Ok(()),
        }
    }
}

/// Local detection log.
impl OutboundChannel for JsonLinesSink {
    fn name(&self) -> &str {
        "jsonl"
    }

    fn carries(&self, message: &Outbound<'_>) -> bool {
        matches!(message, Outbound::Detections { .. })
    }

    fn deliver(&self, message: &Outbound<'_>) -> RelayResult<()> {
        match message {
            Outbound::Detections { json } => self.append(json),
            _ => Ok(()),
        }
    }
}
