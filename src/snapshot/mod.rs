//! Paired snapshot capture.
//!
//! A periodic check opens a [`SnapshotWindow`] when capture is enabled and the
//! debounce period has elapsed. Within the window's grace period the first
//! `clean` and `osd` samples are persisted under the same base name together
//! with one metadata file. Late samples are dropped. A new trigger overwrites
//! whatever window is pending; at most one window is ever in flight.
//!
//! The deadline is only checked when a sample arrives. No timer fires.

use std::collections::HashSet;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::detect::DetectionEvent;
use crate::error::RelayError;
use crate::storage::SnapshotStore;

pub const DEFAULT_GRACE_MS: u64 = 500;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ImageKind {
    /// Frame before the on-screen overlay. Kept local.
    Clean,
    /// Annotated frame with boxes and labels. The only kind sent to subscribers.
    Osd,
}

impl ImageKind {
    pub fn suffix(self) -> &'static str {
        match self {
            ImageKind::Clean => "clean",
            ImageKind::Osd => "osd",
        }
    }

    pub fn extension(self) -> &'static str {
        "jpg"
    }

    pub fn is_published(self) -> bool {
        matches!(self, ImageKind::Osd)
    }
}

impl FromStr for ImageKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "clean" => Ok(ImageKind::Clean),
            "osd" => Ok(ImageKind::Osd),
            other => Err(anyhow::anyhow!(
                "unknown image kind '{}': expected 'clean' or 'osd'",
                other
            )),
        }
    }
}

impl std::fmt::Display for ImageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.suffix())
    }
}

/// Runtime-adjustable capture cadence.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CaptureConfig {
    pub enabled: bool,
    pub period_ms: u64,
    /// Wall-clock ms of the last trigger; `None` until the first one.
    pub last_fire_at: Option<u64>,
}

impl CaptureConfig {
    pub fn new(enabled: bool, period_ms: u64) -> Self {
        Self {
            enabled,
            period_ms,
            last_fire_at: None,
        }
    }

    /// `period_ms == 0` disables triggering regardless of `enabled`.
    pub fn is_due(&self, now_ms: u64) -> bool {
        if !self.enabled || self.period_ms == 0 {
            return false;
        }
        match self.last_fire_at {
            Some(last) => now_ms.saturating_sub(last) >= self.period_ms,
            None => true,
        }
    }
}

/// Shared handle to the capture configuration.
///
/// The controller reads it on the pipeline thread; the control listener writes
/// it from the pub/sub delivery thread.
#[derive(Clone, Debug, Default)]
pub struct CaptureHandle {
    inner: Arc<Mutex<CaptureConfig>>,
}

impl CaptureHandle {
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(config)),
        }
    }

    pub fn get(&self) -> CaptureConfig {
        *self.lock()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.lock().enabled = enabled;
    }

    pub fn set_period_ms(&self, period_ms: u64) {
        self.lock().period_ms = period_ms;
    }

    /// Record a trigger at `now_ms` if one is due. Check and update are one step.
    fn try_fire(&self, now_ms: u64) -> bool {
        let mut cfg = self.lock();
        if cfg.is_due(now_ms) {
            cfg.last_fire_at = Some(now_ms);
            true
        } else {
            false
        }
    }

    fn lock(&self) -> MutexGuard<'_, CaptureConfig> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotWindow {
    pub base_name: String,
    pub opened_at: u64,
    pub deadline: u64,
    /// Serialized latest detection event at trigger time.
    pub meta: String,
    pub meta_persisted: bool,
    pub received_kinds: HashSet<ImageKind>,
}

impl SnapshotWindow {
    fn open(now_ms: u64, grace_ms: u64, meta: String) -> Self {
        Self {
            base_name: now_ms.to_string(),
            opened_at: now_ms,
            deadline: now_ms.saturating_add(grace_ms),
            meta,
            meta_persisted: false,
            received_kinds: HashSet::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.received_kinds.contains(&ImageKind::Clean) && self.received_kinds.contains(&ImageKind::Osd)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    WindowOpen,
}

/// What happened to one image sample.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SampleOutcome {
    /// No window has been opened since the last completion.
    NoWindow,
    /// Arrived after the pending window's deadline; nothing was written.
    Late { base_name: String },
    Accepted(AcceptedSample),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AcceptedSample {
    pub base_name: String,
    pub kind: ImageKind,
    /// `None` when the write failed.
    pub image_path: Option<PathBuf>,
    pub meta_written: bool,
    pub window_closed: bool,
}

impl SampleOutcome {
    /// True when the sample should go to remote subscribers.
    pub fn should_publish(&self) -> bool {
        match self {
            SampleOutcome::Accepted(sample) => sample.kind.is_published(),
            _ => false,
        }
    }
}

struct SamplePlan {
    base_name: String,
    meta: Option<String>,
    window_closed: bool,
}

pub struct SnapshotController {
    config: CaptureHandle,
    window: Mutex<Option<SnapshotWindow>>,
    grace_ms: u64,
    store: SnapshotStore,
}

impl SnapshotController {
    pub fn new(config: CaptureHandle, store: SnapshotStore) -> Self {
        Self::with_grace(config, store, DEFAULT_GRACE_MS)
    }

    pub fn with_grace(config: CaptureHandle, store: SnapshotStore, grace_ms: u64) -> Self {
        Self {
            config,
            window: Mutex::new(None),
            grace_ms,
            store,
        }
    }

    pub fn capture(&self) -> &CaptureHandle {
        &self.config
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    pub fn state(&self) -> ControllerState {
        if self.lock_window().is_some() {
            ControllerState::WindowOpen
        } else {
            ControllerState::Idle
        }
    }

    pub fn window(&self) -> Option<SnapshotWindow> {
        self.lock_window().clone()
    }

    /// Periodic check. Opens a fresh window when due, replacing any pending one.
    ///
    /// Returns the new window's base name.
    pub fn check_trigger(&self, now_ms: u64, latest: &DetectionEvent) -> Option<String> {
        if !self.config.try_fire(now_ms) {
            return None;
        }
        let meta = match latest.to_json() {
            Ok(meta) => meta,
            Err(e) => {
                RelayError::from(e).report("snapshot meta");
                return None;
            }
        };
        let window = SnapshotWindow::open(now_ms, self.grace_ms, meta);
        let base_name = window.base_name.clone();

        let mut slot = self.lock_window();
        if let Some(old) = slot.as_ref() {
            log::debug!(
                "snapshot window {} replaced (received: {:?})",
                old.base_name,
                old.received_kinds
            );
        }
        *slot = Some(window);
        log::debug!("snapshot window {} opened", base_name);
        Some(base_name)
    }

    /// Handle one image sample arriving at `now_ms`.
    ///
    /// Window bookkeeping happens under the lock; file writes happen after it is
    /// released, so the other kind's callback is never held up by disk I/O.
    pub fn on_sample(&self, kind: ImageKind, data: &[u8], now_ms: u64) -> SampleOutcome {
        let plan = {
            let mut slot = self.lock_window();
            let Some(window) = slot.as_mut() else {
                return SampleOutcome::NoWindow;
            };
            if now_ms > window.deadline {
                log::debug!(
                    "late {} sample for window {} dropped ({}ms past deadline)",
                    kind,
                    window.base_name,
                    now_ms - window.deadline
                );
                return SampleOutcome::Late {
                    base_name: window.base_name.clone(),
                };
            }

            let meta = if window.meta_persisted {
                None
            } else {
                window.meta_persisted = true;
                Some(window.meta.clone())
            };
            window.received_kinds.insert(kind);
            let window_closed = window.is_complete();
            let base_name = window.base_name.clone();
            if window_closed {
                *slot = None;
            }
            SamplePlan {
                base_name,
                meta,
                window_closed,
            }
        };

        let image_path = match self.store.write_image(&plan.base_name, kind, data) {
            Ok(path) => Some(path),
            Err(e) => {
                e.report("snapshot image");
                None
            }
        };
        let meta_written = match plan.meta {
            Some(meta) => match self.store.write_meta(&plan.base_name, &meta) {
                Ok(_) => true,
                Err(e) => {
                    e.report("snapshot meta");
                    false
                }
            },
            None => false,
        };
        if plan.window_closed {
            log::info!("snapshot pair {} complete", plan.base_name);
        }

        SampleOutcome::Accepted(AcceptedSample {
            base_name: plan.base_name,
            kind,
            image_path,
            meta_written,
            window_closed: plan.window_closed,
        })
    }

    fn lock_window(&self) -> MutexGuard<'_, Option<SnapshotWindow>> {
        self.window.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
