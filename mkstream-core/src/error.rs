//! Error type shared by every stage of the streaming pipeline.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed vint: {0}")]
    MalformedVint(String),
    #[error("Truncated element at byte {position}: {reason}")]
    TruncatedElement { position: u64, reason: String },
    #[error("Invalid container: {0}")]
    InvalidContainer(String),
    #[error("Missing index: {0}")]
    MissingIndex(String),
    #[error("Cluster at byte {0} does not start with a timestamp")]
    ClusterOrderViolation(u64),
    #[error("Unsupported lacing: {0}")]
    UnsupportedLacing(String),
    #[error("Unsupported codec: {0}")]
    UnsupportedCodec(String),
    #[error("Decode failed: {0}")]
    Decode(String),
    #[error("Seek target {requested_ms}ms outside 0..={total_ms}ms")]
    OutOfRange { requested_ms: u64, total_ms: u64 },
    #[error("Audio device error: {0}")]
    Device(String),
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Operation cancelled")]
    Cancelled,
}

impl StreamError {
    pub(crate) fn truncated(position: u64, reason: impl Into<String>) -> Self {
        StreamError::TruncatedElement {
            position,
            reason: reason.into(),
        }
    }

    /// Setup errors are raised before streaming starts; the caller abandons the song.
    pub fn is_setup_error(&self) -> bool {
        matches!(
            self,
            StreamError::InvalidContainer(_)
                | StreamError::MissingIndex(_)
                | StreamError::UnsupportedCodec(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, StreamError>;
