mod aggregator;
mod result;

pub use aggregator::{AggregatedFrame, DetectionAggregator};
pub use result::{
    ClassCounters, Detection, DetectionEvent, FrameMetadata, ObjectClass, RawDetection,
};
