//! Session configuration.
//!
//! Every field has a default, so a config file only needs to name what it changes:
//!
//! ```json
//! { "queue_capacity": 64, "range_style": "header" }
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, StreamError};

/// Chunk size of a streaming range request (bytes).
pub const DEFAULT_CHUNK_SIZE: u64 = 9_898_989;
/// Chunk size used while reading the header and index.
pub const DEFAULT_HEADER_CHUNK_SIZE: u64 = 10 * 1024;

/// How the byte range is communicated to the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RangeStyle {
    /// `?range=<start>-<end>` appended to the URL
    Query,
    /// `Range: bytes=<start>-<end>` request header
    Header,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Bytes requested per range fetch once streaming
    pub chunk_size: u64,
    /// Bytes requested per range fetch while loading the header/index
    pub header_chunk_size: u64,
    /// Extra attempts for a failed range fetch
    pub fetch_retries: u32,
    /// Delay before the first retry, grows linearly
    pub retry_backoff_ms: u64,
    pub range_style: RangeStyle,
    /// Connect/read timeout of a range request
    pub http_timeout_ms: u64,
    /// Decoded packets buffered between producer and feeder
    pub queue_capacity: usize,
    /// Hardware buffers registered with the device
    pub hardware_buffers: usize,
    /// Feeder poll cadence
    pub feed_interval_ms: u64,
    pub sample_rate: u32,
    pub channels: u16,
    /// Accepted EBML DocType values
    pub doc_types: Vec<String>,
    /// 0.0 - 1.0
    pub volume: f32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            header_chunk_size: DEFAULT_HEADER_CHUNK_SIZE,
            fetch_retries: 2,
            retry_backoff_ms: 250,
            range_style: RangeStyle::Query,
            http_timeout_ms: 15_000,
            queue_capacity: 128,
            hardware_buffers: 50,
            feed_interval_ms: 100,
            sample_rate: 48_000,
            channels: 2,
            doc_types: vec!["webm".to_string(), "matroska".to_string()],
            volume: 0.5,
        }
    }
}

impl SessionConfig {
    /// Load a JSON config file and validate it
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: SessionConfig = serde_json::from_str(&text)
            .map_err(|e| StreamError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        tracing::debug!("Loaded session config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 || self.header_chunk_size == 0 {
            return Err(StreamError::Config("chunk sizes must be non-zero".into()));
        }
        if self.queue_capacity == 0 {
            return Err(StreamError::Config("queue_capacity must be at least 1".into()));
        }
        if self.hardware_buffers == 0 {
            return Err(StreamError::Config("hardware_buffers must be at least 1".into()));
        }
        if self.feed_interval_ms == 0 {
            return Err(StreamError::Config("feed_interval_ms must be non-zero".into()));
        }
        if !matches!(self.channels, 1 | 2) {
            return Err(StreamError::Config(format!(
                "unsupported channel count {}",
                self.channels
            )));
        }
        if !matches!(self.sample_rate, 8_000 | 12_000 | 16_000 | 24_000 | 48_000) {
            return Err(StreamError::Config(format!(
                "unsupported sample rate {}",
                self.sample_rate
            )));
        }
        if self.doc_types.is_empty() {
            return Err(StreamError::Config("doc_types must not be empty".into()));
        }
        if !(0.0..=1.0).contains(&self.volume) {
            return Err(StreamError::Config("volume must be within 0.0 - 1.0".into()));
        }
        Ok(())
    }

    pub fn feed_interval(&self) -> Duration {
        Duration::from_millis(self.feed_interval_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_is_valid() {
        let config = SessionConfig::default();
        config.validate().expect("default config");
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.feed_interval(), Duration::from_millis(100));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        write!(file, r#"{{ "queue_capacity": 8, "range_style": "header" }}"#).expect("write");

        let config = SessionConfig::from_json_file(file.path()).expect("config");
        assert_eq!(config.queue_capacity, 8);
        assert_eq!(config.range_style, RangeStyle::Header);
        assert_eq!(config.sample_rate, 48_000);
    }

    #[test]
    fn test_rejects_bad_values() {
        let config = SessionConfig {
            queue_capacity: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(StreamError::Config(_))));

        let config = SessionConfig {
            sample_rate: 44_100,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_json() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        write!(file, "{{ not json").expect("write");
        let err = SessionConfig::from_json_file(file.path()).unwrap_err();
        assert!(matches!(err, StreamError::Config(_)));
    }
}
