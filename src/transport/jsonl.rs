use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use crate::error::{RelayError, RelayResult};

/// Append-only JSON-lines file, one record per line.
///
/// The file is opened per append so external rotation (truncate or move) is
/// picked up without a restart.
#[derive(Debug)]
pub struct JsonLinesSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonLinesSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, line: &str) -> RelayResult<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| RelayError::file_io(&self.path, e))?;
        let mut record = String::with_capacity(line.len() + 1);
        record.push_str(line);
        record.push('\n');
        file.write_all(record.as_bytes())
            .map_err(|e| RelayError::file_io(&self.path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_one_record_per_line() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let sink = JsonLinesSink::new(dir.path().join("detections.jsonl"));
        sink.append(r#"{"frame":1,"detections":[]}"#)?;
        sink.append(r#"{"frame":2,"detections":[]}"#)?;
        let text = std::fs::read_to_string(sink.path())?;
        assert_eq!(
            text,
            "{\"frame\":1,\"detections\":[]}\n{\"frame\":2,\"detections\":[]}\n"
        );
        Ok(())
    }

    #[test]
    fn missing_parent_is_file_io_error() {
        let sink = JsonLinesSink::new("/nonexistent-dir/detections.jsonl");
        assert!(matches!(
            sink.append("{}").unwrap_err(),
            RelayError::FileIo { .. }
        ));
    }
}
