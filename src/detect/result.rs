use serde::{Deserialize, Serialize};

/// Object classes emitted by the primary detector.
///
/// Serialized as the detector's integer class id (0..=3).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "u8")]
pub enum ObjectClass {
    Vehicle,
    Bicycle,
    Person,
    RoadSign,
}

impl ObjectClass {
    pub const ALL: [ObjectClass; 4] = [
        ObjectClass::Vehicle,
        ObjectClass::Bicycle,
        ObjectClass::Person,
        ObjectClass::RoadSign,
    ];

    pub fn class_id(self) -> u8 {
        match self {
            ObjectClass::Vehicle => 0,
            ObjectClass::Bicycle => 1,
            ObjectClass::Person => 2,
            ObjectClass::RoadSign => 3,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ObjectClass::Vehicle => "vehicle",
            ObjectClass::Bicycle => "bicycle",
            ObjectClass::Person => "person",
            ObjectClass::RoadSign => "roadsign",
        }
    }
}

impl TryFrom<i64> for ObjectClass {
    type Error = String;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ObjectClass::Vehicle),
            1 => Ok(ObjectClass::Bicycle),
            2 => Ok(ObjectClass::Person),
            3 => Ok(ObjectClass::RoadSign),
            other => Err(format!("unknown class_id {}", other)),
        }
    }
}

impl From<ObjectClass> for u8 {
    fn from(class: ObjectClass) -> Self {
        class.class_id()
    }
}

/// One recognized object. Geometry is in frame pixels as reported by the detector.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class_id: ObjectClass,
    pub left: f32,
    pub top: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

/// Detection as handed over by the pipeline, before class validation.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct RawDetection {
    pub class_id: i64,
    pub left: f32,
    pub top: f32,
    pub width: f32,
    pub height: f32,
    #[serde(default)]
    pub confidence: f32,
}

impl RawDetection {
    pub fn new(class_id: i64, left: f32, top: f32, width: f32, height: f32, confidence: f32) -> Self {
        Self {
            class_id,
            left,
            top,
            width,
            height,
            confidence,
        }
    }
}

/// Per-frame metadata as delivered by the pipeline.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct FrameMetadata {
    #[serde(alias = "frame")]
    pub frame_id: u64,
    #[serde(default)]
    pub detections: Vec<RawDetection>,
}

/// Immutable result of one ingested frame.
///
/// Wire shape (detections topic and `<base>_meta.json`):
/// `{"frame": <int>, "detections": [...]}`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionEvent {
    #[serde(rename = "frame", alias = "frame_id")]
    pub frame_id: u64,
    #[serde(default)]
    pub detections: Vec<Detection>,
}

impl DetectionEvent {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Per-class counts for exactly one frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClassCounters {
    counts: [u32; 4],
}

impl ClassCounters {
    pub fn from_detections(detections: &[Detection]) -> Self {
        let mut counters = Self::default();
        for det in detections {
            counters.counts[det.class_id.class_id() as usize] += 1;
        }
        counters
    }

    pub fn get(&self, class: ObjectClass) -> u32 {
        self.counts[class.class_id() as usize]
    }

    pub fn total(&self) -> u32 {
        self.counts.iter().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjectClass, u32)> + '_ {
        ObjectClass::ALL.iter().map(|class| (*class, self.get(*class)))
    }
}

impl std::fmt::Display for ClassCounters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "objects={} vehicle={} bicycle={} person={} roadsign={}",
            self.total(),
            self.get(ObjectClass::Vehicle),
            self.get(ObjectClass::Bicycle),
            self.get(ObjectClass::Person),
            self.get(ObjectClass::RoadSign)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_id_serializes_as_integer() {
        let det = Detection {
            class_id: ObjectClass::Person,
            left: 1.0,
            top: 2.0,
            width: 3.0,
            height: 4.0,
            confidence: 0.5,
        };
        let json = serde_json::to_value(&det).expect("serialize");
        assert_eq!(json["class_id"], 2);
        assert_eq!(json["confidence"], 0.5);
    }

    #[test]
    fn unknown_class_id_rejected() {
        assert!(ObjectClass::try_from(4).is_err());
        assert!(ObjectClass::try_from(-1).is_err());
        assert_eq!(ObjectClass::try_from(3), Ok(ObjectClass::RoadSign));
    }

    #[test]
    fn event_uses_frame_key() {
        let ev = DetectionEvent {
            frame_id: 42,
            detections: vec![],
        };
        assert_eq!(ev.to_json().unwrap(), r#"{"frame":42,"detections":[]}"#);
    }

    #[test]
    fn frame_metadata_accepts_frame_alias() {
        let meta: FrameMetadata = serde_json::from_str(
            r#"{"frame": 7, "detections": [{"class_id": 0, "left": 1, "top": 2, "width": 3, "height": 4, "confidence": 0.9}]}"#,
        )
        .expect("parse");
        assert_eq!(meta.frame_id, 7);
        assert_eq!(meta.detections.len(), 1);
        assert_eq!(meta.detections[0].class_id, 0);
    }

    #[test]
    fn counters_display_lists_every_class() {
        let counters = ClassCounters::default();
        assert_eq!(
            counters.to_string(),
            "objects=0 vehicle=0 bicycle=0 person=0 roadsign=0"
        );
    }
}
