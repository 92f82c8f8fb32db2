//! # mkstream Core
//!
//! Stream the audio of a Matroska/WebM file over HTTP range requests, decode it,
//! and keep a device buffer queue fed, with seeking that does not restart the transfer.

// ============================================================================
// Foundation
// ============================================================================
pub mod config;
pub mod error;

// ============================================================================
// Network
// ============================================================================
pub mod range_source;

// ============================================================================
// Container
// ============================================================================
pub mod mkv;

// ============================================================================
// Decode / Playback
// ============================================================================
pub mod audio;
pub mod decode;
pub mod pcm_queue;
pub mod sink;

// ============================================================================
// Session
// ============================================================================
pub mod session;

pub use config::{RangeStyle, SessionConfig};
pub use error::{Result, StreamError};
pub use session::{Session, SessionStatus};

// ============================================================================
// Version
// ============================================================================
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
