//! Directory poller that republishes new snapshot files to the broker.
//!
//! Runs beside the engine, not inside it. Each published file carries the most
//! recent detections seen on the detections topic, which need not match the
//! image content.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use serde::Deserialize;

use crate::detect::Detection;
use crate::error::{RelayError, RelayResult};
use crate::fanout::{CameraDescriptor, SnapshotPayload};
use crate::transport::{Subscriber, Transport};

pub const POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const RECENT_FILES: usize = 10;
const STOP_POLL: Duration = Duration::from_millis(50);

#[derive(Clone, Debug, Default, PartialEq)]
pub struct DetectionSnapshot {
    pub frame_id: Option<u64>,
    pub detections: Vec<Detection>,
}

#[derive(Debug, Deserialize)]
struct DetectionsMessage {
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(default, alias = "frame")]
    frame_id: Option<u64>,
    #[serde(default)]
    detections: Vec<Detection>,
}

/// Most recent detections observed on the detections topic.
#[derive(Debug, Default)]
pub struct LastDetections {
    inner: Mutex<DetectionSnapshot>,
}

impl LastDetections {
    pub fn get(&self) -> DetectionSnapshot {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Heartbeats share the topic and leave the stored value alone.
    pub fn observe(&self, payload: &[u8]) {
        let message: DetectionsMessage = match serde_json::from_slice(payload) {
            Ok(message) => message,
            Err(e) => {
                log::debug!("ignoring unparseable detections message: {}", e);
                return;
            }
        };
        if message.kind.as_deref() == Some("heartbeat") {
            return;
        }
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner) = DetectionSnapshot {
            frame_id: message.frame_id,
            detections: message.detections,
        };
    }

    pub fn subscribe(self: &Arc<Self>, subscriber: &dyn Subscriber, topic: &str) -> RelayResult<()> {
        let this = self.clone();
        subscriber.subscribe(
            topic,
            Arc::new(move |_topic: &str, payload: &[u8]| this.observe(payload)),
        )
    }
}

pub struct DirectoryPoller {
    dir: PathBuf,
    transport: Arc<dyn Transport>,
    topic: String,
    camera: CameraDescriptor,
    last: Arc<LastDetections>,
    seen: HashSet<PathBuf>,
}

impl DirectoryPoller {
    pub fn new(
        dir: impl Into<PathBuf>,
        transport: Arc<dyn Transport>,
        topic: impl Into<String>,
        camera: CameraDescriptor,
        last: Arc<LastDetections>,
    ) -> Self {
        Self {
            dir: dir.into(),
            transport,
            topic: topic.into(),
            camera,
            last,
            seen: HashSet::new(),
        }
    }

    pub fn has_seen(&self, path: &Path) -> bool {
        self.seen.contains(path)
    }

    /// One pass over the newest files. Returns how many were published.
    ///
    /// A file only joins the seen set once it is published, so a failed read or
    /// publish is retried on the next pass.
    pub fn poll_once(&mut self, now_ms: u64) -> usize {
        let mut published = 0;
        for path in self.recent_files() {
            if self.seen.contains(&path) {
                continue;
            }
            match self.publish_file(&path, now_ms) {
                Ok(()) => {
                    log::debug!("published {}", path.display());
                    self.seen.insert(path);
                    published += 1;
                }
                Err(e) => e.report("sidecar"),
            }
        }
        published
    }

    fn recent_files(&self) -> Vec<PathBuf> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                RelayError::file_io(&self.dir, e).report("sidecar");
                return Vec::new();
            }
        };
        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| name.to_lowercase().ends_with(".jpg"))
            .collect();
        names.sort();
        let skip = names.len().saturating_sub(RECENT_FILES);
        names
            .into_iter()
            .skip(skip)
            .map(|name| self.dir.join(name))
            .collect()
    }

    fn publish_file(&self, path: &Path, now_ms: u64) -> RelayResult<()> {
        let image = std::fs::read(path).map_err(|e| RelayError::file_io(path, e))?;
        let last = self.last.get();
        let payload = SnapshotPayload::annotated(
            &image,
            now_ms,
            last.frame_id,
            last.detections,
            self.camera.clone(),
        );
        let bytes = serde_json::to_vec(&payload)?;
        self.transport.publish(&self.topic, &bytes)
    }

    pub fn spawn(mut self, interval: Duration) -> Result<PollerHandle> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        log::info!(
            "polling {} every {}ms -> {}",
            self.dir.display(),
            interval.as_millis(),
            self.topic
        );
        let join = std::thread::Builder::new()
            .name("snap-poller".to_string())
            .spawn(move || {
                while !shutdown_thread.load(Ordering::SeqCst) {
                    self.poll_once(crate::engine::now_ms());
                    let deadline = Instant::now() + interval;
                    while Instant::now() < deadline && !shutdown_thread.load(Ordering::SeqCst) {
                        std::thread::sleep(
                            STOP_POLL.min(deadline.saturating_duration_since(Instant::now())),
                        );
                    }
                }
            })
            .map_err(|e| anyhow!("failed to spawn poller thread: {}", e))?;
        Ok(PollerHandle {
            shutdown,
            join: Some(join),
        })
    }
}

pub struct PollerHandle {
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl PollerHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("poller thread panicked"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::ObjectClass;
    use crate::transport::MemoryTransport;
    use std::fs;

    fn poller(dir: &Path, bus: Arc<MemoryTransport>, last: Arc<LastDetections>) -> DirectoryPoller {
        DirectoryPoller::new(dir, bus, "deepstream/snap", CameraDescriptor::default(), last)
    }

    #[test]
    fn publishes_each_path_once_even_if_rewritten() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let bus = Arc::new(MemoryTransport::new("mqtt"));
        let mut poller = poller(dir.path(), bus.clone(), Arc::default());
        let path = dir.path().join("100_osd.jpg");
        fs::write(&path, b"first")?;

        assert_eq!(poller.poll_once(1), 1);
        fs::write(&path, b"second")?;
        assert_eq!(poller.poll_once(2), 0);
        assert!(poller.has_seen(&path));
        assert_eq!(bus.published_on("deepstream/snap").len(), 1);
        Ok(())
    }

    #[test]
    fn only_newest_ten_jpegs_are_considered() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        for i in 0..12u64 {
            fs::write(dir.path().join(format!("{}_clean.jpg", 1000 + i)), b"x")?;
        }
        fs::write(dir.path().join("1011_meta.json"), b"{}")?;
        fs::write(dir.path().join("1011_clean.jpg.tmp"), b"partial")?;
        let bus = Arc::new(MemoryTransport::new("mqtt"));
        let mut poller = poller(dir.path(), bus.clone(), Arc::default());

        assert_eq!(poller.poll_once(1), 10);
        assert!(!poller.has_seen(&dir.path().join("1000_clean.jpg")));
        assert!(!poller.has_seen(&dir.path().join("1001_clean.jpg")));
        assert!(poller.has_seen(&dir.path().join("1011_clean.jpg")));
        Ok(())
    }

    #[test]
    fn failed_publish_is_retried_next_pass() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join("5_osd.jpg"), b"x")?;
        let bus = Arc::new(MemoryTransport::unavailable("mqtt"));
        let mut poller = poller(dir.path(), bus.clone(), Arc::default());

        assert_eq!(poller.poll_once(1), 0);
        bus.set_available(true);
        assert_eq!(poller.poll_once(2), 1);
        Ok(())
    }

    #[test]
    fn missing_directory_is_not_fatal() {
        let bus = Arc::new(MemoryTransport::new("mqtt"));
        let mut poller = poller(Path::new("/nonexistent/autocap"), bus, Arc::default());
        assert_eq!(poller.poll_once(1), 0);
    }

    #[test]
    fn payload_carries_last_detections() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join("7_osd.jpg"), b"img")?;
        let bus = Arc::new(MemoryTransport::new("mqtt"));
        let last = Arc::new(LastDetections::default());
        last.subscribe(bus.as_ref(), "deepstream/detections")?;
        bus.publish(
            "deepstream/detections",
            br#"{"frame":12,"detections":[{"class_id":2,"left":1,"top":2,"width":3,"height":4,"confidence":0.8}]}"#,
        )?;
        bus.publish("deepstream/detections", br#"{"type":"heartbeat","ts":99}"#)?;

        let mut poller = poller(dir.path(), bus.clone(), last);
        poller.poll_once(555);

        let raw = bus.published_on("deepstream/snap");
        let payload: SnapshotPayload = serde_json::from_slice(&raw[0])?;
        assert_eq!(payload.ts_ms, 555);
        assert_eq!(payload.frame_id, Some(12));
        assert_eq!(payload.detections[0].class_id, ObjectClass::Person);
        assert_eq!(payload.decode_image()?, b"img");
        Ok(())
    }

    #[test]
    fn frame_id_is_null_before_any_detections() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join("7_osd.jpg"), b"img")?;
        let bus = Arc::new(MemoryTransport::new("mqtt"));
        let mut poller = poller(dir.path(), bus.clone(), Arc::default());
        poller.poll_once(1);
        let value: serde_json::Value =
            serde_json::from_slice(&bus.published_on("deepstream/snap")[0])?;
        assert!(value["frame_id"].is_null());
        assert_eq!(value["detections"], serde_json::json!([]));
        Ok(())
    }

    #[test]
    fn accepts_frame_id_key() {
        let last = LastDetections::default();
        last.observe(br#"{"frame_id":4,"detections":[]}"#);
        assert_eq!(last.get().frame_id, Some(4));
    }

    #[test]
    fn stop_joins_the_poller_thread() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join("1_osd.jpg"), b"x")?;
        let bus = Arc::new(MemoryTransport::new("mqtt"));
        let handle = poller(dir.path(), bus.clone(), Arc::default())
            .spawn(Duration::from_millis(10))?;
        std::thread::sleep(Duration::from_millis(100));
        handle.stop()?;
        assert_eq!(bus.published_on("deepstream/snap").len(), 1);
        Ok(())
    }
}
