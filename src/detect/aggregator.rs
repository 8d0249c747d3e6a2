use std::sync::{Arc, PoisonError, RwLock};

use super::result::{ClassCounters, Detection, DetectionEvent, ObjectClass, RawDetection};

/// The latest ingested frame together with its counts.
///
/// Published as one `Arc` so readers never observe an event paired with
/// another frame's counters.
#[derive(Clone, Debug, Default)]
pub struct AggregatedFrame {
    pub event: Arc<DetectionEvent>,
    pub counters: ClassCounters,
}

/// Holds the most recent detection event and its per-class counters.
///
/// `ingest` runs on the pipeline's processing thread: no I/O, no blocking beyond
/// the pointer swap under the write lock.
#[derive(Debug, Default)]
pub struct DetectionAggregator {
    latest: RwLock<Option<Arc<AggregatedFrame>>>,
}

impl DetectionAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the event for one frame and make it the latest known one.
    ///
    /// Detections with a class id outside the detector's label set are dropped.
    pub fn ingest(&self, frame_id: u64, raw: &[RawDetection]) -> Arc<DetectionEvent> {
        let detections: Vec<Detection> = raw
            .iter()
            .filter_map(|det| match ObjectClass::try_from(det.class_id) {
                Ok(class_id) => Some(Detection {
                    class_id,
                    left: det.left,
                    top: det.top,
                    width: det.width,
                    height: det.height,
                    confidence: det.confidence,
                }),
                Err(e) => {
                    log::debug!("frame {}: dropping detection: {}", frame_id, e);
                    None
                }
            })
            .collect();

        let counters = ClassCounters::from_detections(&detections);
        let event = Arc::new(DetectionEvent {
            frame_id,
            detections,
        });
        let frame = Arc::new(AggregatedFrame {
            event: event.clone(),
            counters,
        });

        *self.latest.write().unwrap_or_else(PoisonError::into_inner) = Some(frame);
        event
    }

    pub fn latest_frame(&self) -> Option<Arc<AggregatedFrame>> {
        self.latest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Latest event, or an empty frame-0 event before the first ingest.
    pub fn latest(&self) -> Arc<DetectionEvent> {
        self.latest_frame()
            .map(|frame| frame.event.clone())
            .unwrap_or_default()
    }

    pub fn latest_counters(&self) -> ClassCounters {
        self.latest_frame()
            .map(|frame| frame.counters)
            .unwrap_or_default()
    }
}
