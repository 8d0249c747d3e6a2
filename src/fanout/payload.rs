use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::detect::Detection;

/// Camera capabilities attached to snapshot payloads. Informational only.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraDescriptor {
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub fps: String,
    pub caps: String,
}

impl Default for CameraDescriptor {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            width: 640,
            height: 480,
            fps: "30/1".to_string(),
            caps: "image/jpeg".to_string(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub osd: bool,
}

/// Snapshot topic payload.
///
/// `frame_id` is `null` only from the sidecar, before it has seen any detections.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnapshotPayload {
    pub ts_ms: u64,
    pub frame_id: Option<u64>,
    pub cam: CameraDescriptor,
    pub image_b64: String,
    pub detections: Vec<Detection>,
    pub meta: SnapshotMeta,
}

impl SnapshotPayload {
    pub fn annotated(
        image: &[u8],
        ts_ms: u64,
        frame_id: Option<u64>,
        detections: Vec<Detection>,
        cam: CameraDescriptor,
    ) -> Self {
        Self {
            ts_ms,
            frame_id,
            cam,
            image_b64: STANDARD.encode(image),
            detections,
            meta: SnapshotMeta { osd: true },
        }
    }

    pub fn decode_image(&self) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(&self.image_b64)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    #[serde(rename = "type")]
    pub kind: HeartbeatKind,
    pub ts: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeartbeatKind {
    Heartbeat,
}

impl Heartbeat {
    pub fn at(ts: u64) -> Self {
        Self {
            kind: HeartbeatKind::Heartbeat,
            ts,
        }
    }
}

/// `std_msgs/String` message shape used on the bridge.
#[derive(Debug, Serialize, Deserialize)]
pub struct StringMessage<'a> {
    pub data: &'a str,
}

/// Image message carried inside a bridge [`StringMessage`].
#[derive(Debug, Serialize)]
pub struct BridgeImage<'a> {
    pub stamp: u64,
    pub kind: &'a str,
    pub data_b64: &'a str,
}
