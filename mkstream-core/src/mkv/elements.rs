//! Matroska element IDs used by the audio demuxer.

// ============================================================================
// EBML Header
// ============================================================================

pub const EBML_HEADER: u64 = 0x1A45DFA3;
pub const DOC_TYPE: u64 = 0x4282;

// ============================================================================
// Segment
// ============================================================================

pub const SEGMENT: u64 = 0x18538067;
pub const SEEK_HEAD: u64 = 0x114D9B74;
pub const SEEK: u64 = 0x4DBB;
pub const SEEK_ID: u64 = 0x53AB;
pub const SEEK_POSITION: u64 = 0x53AC;

pub const INFO: u64 = 0x1549A966;
pub const TIMESTAMP_SCALE: u64 = 0x2AD7B1;
pub const DURATION: u64 = 0x4489;

// ============================================================================
// Tracks
// ============================================================================

pub const TRACKS: u64 = 0x1654AE6B;
pub const TRACK_ENTRY: u64 = 0xAE;
pub const TRACK_NUMBER: u64 = 0xD7;
pub const TRACK_TYPE: u64 = 0x83;
pub const CODEC_ID: u64 = 0x86;
pub const CODEC_PRIVATE: u64 = 0x63A2;
pub const AUDIO: u64 = 0xE1;
pub const SAMPLING_FREQUENCY: u64 = 0xB5;
pub const CHANNELS: u64 = 0x9F;
pub const BIT_DEPTH: u64 = 0x6264;

/// TrackType value for audio tracks
pub const TRACK_TYPE_AUDIO: u64 = 2;

// ============================================================================
// Cues
// ============================================================================

pub const CUES: u64 = 0x1C53BB6B;
pub const CUE_POINT: u64 = 0xBB;
pub const CUE_TIME: u64 = 0xB3;
pub const CUE_TRACK_POSITIONS: u64 = 0xB7;
pub const CUE_TRACK: u64 = 0xF7;
pub const CUE_CLUSTER_POSITION: u64 = 0xF1;

// ============================================================================
// Clusters
// ============================================================================

pub const CLUSTER: u64 = 0x1F43B675;
pub const TIMESTAMP: u64 = 0xE7;
pub const SIMPLE_BLOCK: u64 = 0xA3;
pub const BLOCK_GROUP: u64 = 0xA0;
pub const BLOCK: u64 = 0xA1;

pub const VOID: u64 = 0xEC;
pub const CRC32: u64 = 0xBF;

/// Nanoseconds per timestamp tick when the segment does not say otherwise
pub const DEFAULT_TIMESTAMP_SCALE: u64 = 1_000_000;
