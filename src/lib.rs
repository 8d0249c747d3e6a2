//! Detection Relay
//!
//! Turns the per-frame output of a perception pipeline into running class
//! counters, paired on-disk snapshots and best-effort publishes to external
//! subscribers.
//!
//! # Architecture
//!
//! Pipeline callbacks drive an [`Engine`]:
//!
//! 1. **Aggregate**: each frame's detections become an immutable [`DetectionEvent`].
//! 2. **Trigger**: a periodic check opens a snapshot window when capture is due.
//! 3. **Persist**: `clean` and `osd` samples inside the window are written atomically
//!    under one base name, with the triggering event as metadata.
//! 4. **Fan out**: detections, annotated images and heartbeats go to every
//!    configured channel; one failing channel never affects the rest.
//!
//! Capture cadence can be changed at runtime through the control topics on the
//! pub/sub bridge. A separate directory poller republishes new snapshot files.
//!
//! # Module Structure
//!
//! - `detect`: detection types and the aggregator
//! - `snapshot`: capture configuration and the window state machine
//! - `storage`: atomic writes and the snapshot directory layout
//! - `transport`: MQTT client, in-memory bus, JSON-lines sink
//! - `fanout`: outbound channels, payloads, heartbeat
//! - `control`: remote capture control
//! - `sidecar`: directory poller
//! - `engine`: the context object tying the above together
//! - `pipeline`: the pipeline's stdout line protocol

pub mod config;
pub mod control;
pub mod detect;
pub mod engine;
pub mod error;
pub mod fanout;
pub mod pipeline;
pub mod sidecar;
pub mod snapshot;
pub mod storage;
pub mod transport;

pub use config::RelayConfig;
pub use control::{ControlCommand, ControlListener};
pub use detect::{
    ClassCounters, Detection, DetectionAggregator, DetectionEvent, FrameMetadata, ObjectClass,
    RawDetection,
};
pub use engine::{now_ms, Engine};
pub use error::{ErrorPolicy, RelayError, RelayResult};
pub use fanout::{
    BridgeChannel, BridgeTopics, BrokerChannel, BrokerTopics, CameraDescriptor, DeliveryReport,
    FanOutPublisher, OutboundChannel, SnapshotPayload,
};
pub use sidecar::{DirectoryPoller, LastDetections};
pub use snapshot::{CaptureConfig, CaptureHandle, ImageKind, SampleOutcome, SnapshotController};
pub use storage::{write_atomic, SnapshotStore};
pub use transport::{JsonLinesSink, MemoryTransport, MqttTransport, Subscriber, Transport};
