//! Line protocol spoken by the perception pipeline on its stdout.
//!
//! ```text
//! JSON_DET:{"frame": 12, "detections": [...]}
//! IMG:osd:/run/ds/frame_000123.jpg
//! ```
//!
//! The pipeline also echoes each detection object bare, and repeats its last
//! detection line on every image sample. Bare objects are ignored and repeats
//! of the previous frame id are skipped by [`read_pipeline`].

use std::io::BufRead;
use std::path::PathBuf;

use crate::detect::FrameMetadata;
use crate::engine::{now_ms, Engine};
use crate::error::RelayError;
use crate::snapshot::ImageKind;

const DETECTION_PREFIX: &str = "JSON_DET:";
const IMAGE_PREFIX: &str = "IMG:";

#[derive(Debug)]
pub enum PipelineLine {
    /// `None` when the line claimed to be a frame but its metadata did not parse.
    Frame(Option<FrameMetadata>),
    Image { kind: ImageKind, path: PathBuf },
    /// Anything else the pipeline prints.
    Other,
}

pub fn parse_line(line: &str) -> PipelineLine {
    let line = line.trim();
    if let Some(rest) = line.strip_prefix(IMAGE_PREFIX) {
        return match rest.split_once(':') {
            Some((kind, path)) if !path.trim().is_empty() => match kind.parse() {
                Ok(kind) => PipelineLine::Image {
                    kind,
                    path: PathBuf::from(path.trim()),
                },
                Err(e) => {
                    log::debug!("ignoring image line: {}", e);
                    PipelineLine::Other
                }
            },
            _ => PipelineLine::Other,
        };
    }
    let Some(json) = line.strip_prefix(DETECTION_PREFIX) else {
        return PipelineLine::Other;
    };
    let json = json.trim();
    match serde_json::from_str::<FrameMetadata>(json) {
        Ok(metadata) => PipelineLine::Frame(Some(metadata)),
        Err(e) => {
            log::debug!("unparseable frame metadata: {}", e);
            PipelineLine::Frame(None)
        }
    }
}

/// Feed pipeline output into `engine` until `input` ends or fails.
///
/// Returns the number of frames ingested.
pub fn read_pipeline<R: BufRead>(engine: &Engine, input: R) -> usize {
    let mut last_frame_id = None;
    let mut ingested = 0;
    for line in input.lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                log::warn!("pipeline read failed: {}", e);
                break;
            }
        };
        match parse_line(&line) {
            PipelineLine::Frame(Some(metadata)) => {
                if last_frame_id == Some(metadata.frame_id) {
                    log::trace!("frame {} repeated, skipped", metadata.frame_id);
                    continue;
                }
                last_frame_id = Some(metadata.frame_id);
                if engine.on_frame(Some(&metadata)).is_some() {
                    ingested += 1;
                }
            }
            PipelineLine::Frame(None) => {
                engine.on_frame(None);
            }
            PipelineLine::Image { kind, path } => {
                let arrived = now_ms();
                match std::fs::read(&path) {
                    Ok(bytes) => {
                        engine.on_image_sample(kind, &bytes, arrived);
                    }
                    Err(e) => RelayError::file_io(&path, e).report("pipeline image"),
                }
            }
            PipelineLine::Other => {}
        }
    }
    ingested
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fanout::{BrokerChannel, BrokerTopics, CameraDescriptor, FanOutPublisher};
    use crate::snapshot::{CaptureConfig, CaptureHandle, SnapshotController};
    use crate::storage::SnapshotStore;
    use crate::transport::MemoryTransport;
    use std::io::Cursor;
    use std::sync::Arc;

    fn engine_on(broker: Arc<MemoryTransport>, dir: &std::path::Path) -> Engine {
        let fanout = FanOutPublisher::new(CameraDescriptor::default()).with_channel(Arc::new(
            BrokerChannel::new(broker, BrokerTopics::default()),
        ));
        let controller = SnapshotController::new(
            CaptureHandle::new(CaptureConfig::new(false, 0)),
            SnapshotStore::new(dir),
        );
        Engine::new(controller, fanout)
    }

    #[test]
    fn prefixed_detection_line() {
        let line = r#"JSON_DET:{"frame": 7, "detections": [{"class_id": 0, "left": 1.5, "top": 2, "width": 3, "height": 4, "confidence": 0.9}]}"#;
        match parse_line(line) {
            PipelineLine::Frame(Some(meta)) => {
                assert_eq!(meta.frame_id, 7);
                assert_eq!(meta.detections.len(), 1);
                assert_eq!(meta.detections[0].class_id, 0);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn prefixed_line_with_frame_id_key() {
        match parse_line(r#"JSON_DET:{"frame_id": 3, "detections": []}"#) {
            PipelineLine::Frame(Some(meta)) => assert_eq!(meta.frame_id, 3),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn bare_object_is_other() {
        assert!(matches!(
            parse_line(r#"{"frame": 3, "detections": []}"#),
            PipelineLine::Other
        ));
    }

    #[test]
    fn echoed_frame_is_published_once() {
        let dir = tempfile::tempdir().unwrap();
        let broker = Arc::new(MemoryTransport::new("mqtt"));
        let engine = engine_on(broker.clone(), dir.path());

        let det = r#"{"frame": 7, "detections": [{"class_id": 2, "left": 1, "top": 2, "width": 3, "height": 4, "confidence": 0.5}]}"#;
        let output = format!("{det}\nJSON_DET:{det}\nFrame Number = 7\n");
        assert_eq!(read_pipeline(&engine, Cursor::new(output)), 1);
        assert_eq!(broker.published_on("deepstream/detections").len(), 1);
        assert_eq!(engine.aggregator().latest().frame_id, 7);
    }

    #[test]
    fn repeated_detection_line_is_skipped_until_frame_changes() {
        let dir = tempfile::tempdir().unwrap();
        let broker = Arc::new(MemoryTransport::new("mqtt"));
        let engine = engine_on(broker.clone(), dir.path());

        let output = [
            r#"JSON_DET:{"frame": 1, "detections": []}"#,
            r#"JSON_DET:{"frame": 1, "detections": []}"#,
            "IMG:osd:/nonexistent/frame.jpg",
            r#"JSON_DET:{"frame": 1, "detections": []}"#,
            r#"JSON_DET:{"frame": 2, "detections": []}"#,
        ]
        .join("\n");
        assert_eq!(read_pipeline(&engine, Cursor::new(output)), 2);
        assert_eq!(broker.published_on("deepstream/detections").len(), 2);
    }

    #[test]
    fn broken_metadata_is_absent_frame() {
        assert!(matches!(
            parse_line("JSON_DET:{not json"),
            PipelineLine::Frame(None)
        ));
    }

    #[test]
    fn image_lines() {
        match parse_line("IMG:osd:/tmp/a.jpg") {
            PipelineLine::Image { kind, path } => {
                assert_eq!(kind, ImageKind::Osd);
                assert_eq!(path, PathBuf::from("/tmp/a.jpg"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(parse_line("IMG:raw:/tmp/a.jpg"), PipelineLine::Other));
        assert!(matches!(parse_line("IMG:clean:"), PipelineLine::Other));
    }

    #[test]
    fn chatter_is_other() {
        assert!(matches!(parse_line("Frame Number = 10"), PipelineLine::Other));
        assert!(matches!(parse_line(""), PipelineLine::Other));
    }
}
