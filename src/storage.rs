//! Durable snapshot persistence.
//!
//! Files land under the snapshot directory as
//! `<epoch_ms>_clean.jpg`, `<epoch_ms>_osd.jpg` and `<epoch_ms>_meta.json`.
//! Every write goes through [`write_atomic`], so a reader polling the directory
//! never sees a partially written file at its final name.

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{RelayError, RelayResult};
use crate::snapshot::ImageKind;

pub const TMP_SUFFIX: &str = ".tmp";
pub const META_SUFFIX: &str = "_meta.json";

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Write `data` to a private `<path>.<pid>.<seq>.tmp`, then rename over `path`.
///
/// Concurrent writers to one path each rename a complete file; the last
/// rename wins. No fsync: a crash between rename and volume flush may still lose the file.
/// On failure the temp file may be left behind.
pub fn write_atomic(path: &Path, data: &[u8]) -> RelayResult<()> {
    let tmp_path = tmp_path_for(path);
    {
        let mut file = File::create(&tmp_path).map_err(|e| RelayError::file_io(&tmp_path, e))?;
        file.write_all(data)
            .map_err(|e| RelayError::file_io(&tmp_path, e))?;
    }
    fs::rename(&tmp_path, path).map_err(|e| RelayError::file_io(path, e))?;
    Ok(())
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
    let mut name = OsString::from(path.as_os_str());
    name.push(format!(".{}.{}{}", std::process::id(), seq, TMP_SUFFIX));
    PathBuf::from(name)
}

/// Snapshot directory with the paired-image naming scheme.
#[derive(Clone, Debug)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn image_path(&self, base_name: &str, kind: ImageKind) -> PathBuf {
        self.root
            .join(format!("{}_{}.{}", base_name, kind.suffix(), kind.extension()))
    }

    pub fn meta_path(&self, base_name: &str) -> PathBuf {
        self.root.join(format!("{}{}", base_name, META_SUFFIX))
    }

    pub fn write_image(&self, base_name: &str, kind: ImageKind, data: &[u8]) -> RelayResult<PathBuf> {
        self.ensure_root()?;
        let path = self.image_path(base_name, kind);
        write_atomic(&path, data)?;
        Ok(path)
    }

    pub fn write_meta(&self, base_name: &str, meta_json: &str) -> RelayResult<PathBuf> {
        self.ensure_root()?;
        let path = self.meta_path(base_name);
        write_atomic(&path, meta_json.as_bytes())?;
        Ok(path)
    }

    /// The directory is created on demand; it may be removed while running.
    fn ensure_root(&self) -> RelayResult<()> {
        fs::create_dir_all(&self.root).map_err(|e| RelayError::file_io(&self.root, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_atomic_replaces_and_leaves_no_tmp() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("1700000000000_osd.jpg");
        write_atomic(&path, b"first")?;
        write_atomic(&path, b"second")?;
        assert_eq!(fs::read(&path)?, b"second");
        assert_eq!(fs::read_dir(dir.path())?.count(), 1);
        Ok(())
    }

    #[test]
    fn tmp_names_are_unique_per_call() {
        let path = Path::new("/snaps/5_clean.jpg");
        let a = tmp_path_for(path);
        let b = tmp_path_for(path);
        assert_ne!(a, b);
        for tmp in [a, b] {
            let name = tmp.to_string_lossy().into_owned();
            assert!(name.starts_with("/snaps/5_clean.jpg."));
            assert!(name.ends_with(TMP_SUFFIX));
        }
    }

    #[test]
    fn concurrent_writes_to_one_path_never_expose_a_mix() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("42_osd.jpg");
        let payloads: Vec<Vec<u8>> = (0..8u8).map(|i| vec![i; 64 * 1024]).collect();

        let handles: Vec<_> = payloads
            .iter()
            .cloned()
            .map(|data| {
                let path = path.clone();
                std::thread::spawn(move || {
                    for _ in 0..20 {
                        write_atomic(&path, &data).expect("write");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }

        let written = fs::read(&path)?;
        assert!(payloads.contains(&written));
        assert_eq!(fs::read_dir(dir.path())?.count(), 1);
        Ok(())
    }

    #[test]
    fn write_atomic_reports_missing_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("missing").join("x.jpg");
        let err = write_atomic(&path, b"data").unwrap_err();
        assert!(matches!(err, RelayError::FileIo { .. }));
        assert!(!path.exists());
    }

    #[test]
    fn store_creates_directory_and_uses_layout() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = SnapshotStore::new(dir.path().join("autocap"));
        let clean = store.write_image("1000", ImageKind::Clean, b"jpeg-clean")?;
        let osd = store.write_image("1000", ImageKind::Osd, b"jpeg-osd")?;
        let meta = store.write_meta("1000", r#"{"frame":3,"detections":[]}"#)?;

        assert!(clean.ends_with("1000_clean.jpg"));
        assert!(osd.ends_with("1000_osd.jpg"));
        assert!(meta.ends_with("1000_meta.json"));
        assert_eq!(fs::read(clean)?, b"jpeg-clean");
        assert_eq!(fs::read_to_string(meta)?, r#"{"frame":3,"detections":[]}"#);
        Ok(())
    }
}
