//! Runtime error taxonomy and the policy that decides what happens to each kind.
//!
//! Nothing in here is allowed to reach the pipeline callback: every runtime kind
//! maps to [`ErrorPolicy::Ignore`] and is logged once through [`RelayError::report`].
//! Startup code uses `anyhow` instead and aborts on failure.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    /// Publish attempted with no live connection.
    #[error("transport '{transport}' unavailable")]
    TransportUnavailable { transport: String },

    /// The transport accepted the call but rejected the message.
    #[error("transport '{transport}' publish failed: {reason}")]
    Publish { transport: String, reason: String },

    /// Temp write or rename failed.
    #[error("file i/o failed for {}: {source}", path.display())]
    FileIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Non-integer `period_ms`, unknown topic or unexpected payload shape.
    #[error("malformed control message: {0}")]
    MalformedControlMessage(String),

    /// The pipeline delivered a frame without detection metadata.
    #[error("upstream metadata absent")]
    UpstreamMetadataAbsent,

    #[error("payload serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Log and carry on; the operation is treated as best-effort.
    Ignore,
    /// Propagate to the caller.
    Surface,
}

impl RelayError {
    pub fn file_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileIo {
            path: path.into(),
            source,
        }
    }

    pub fn policy(&self) -> ErrorPolicy {
        match self {
            Self::TransportUnavailable { .. }
            | Self::Publish { .. }
            | Self::FileIo { .. }
            | Self::MalformedControlMessage(_)
            | Self::UpstreamMetadataAbsent
            | Self::Serialize(_) => ErrorPolicy::Ignore,
        }
    }

    /// Central sink for swallowed errors.
    pub fn report(&self, context: &str) {
        match self {
            Self::TransportUnavailable { .. } | Self::UpstreamMetadataAbsent => {
                log::debug!("{}: {}", context, self)
            }
            _ => log::warn!("{}: {}", context, self),
        }
    }
}

pub type RelayResult<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_errors_are_never_surfaced() {
        let errors = [
            RelayError::TransportUnavailable {
                transport: "mqtt".to_string(),
            },
            RelayError::Publish {
                transport: "bridge".to_string(),
                reason: "queue full".to_string(),
            },
            RelayError::file_io("/tmp/x.jpg", std::io::Error::other("disk full")),
            RelayError::MalformedControlMessage("abc".to_string()),
            RelayError::UpstreamMetadataAbsent,
        ];
        for err in &errors {
            assert_eq!(err.policy(), ErrorPolicy::Ignore, "{err}");
        }
    }

    #[test]
    fn file_io_message_names_path() {
        let err = RelayError::file_io("/data/1_osd.jpg", std::io::Error::other("denied"));
        let text = err.to_string();
        assert!(text.contains("/data/1_osd.jpg"));
        assert!(text.contains("denied"));
    }
}
