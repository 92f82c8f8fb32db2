//! # Frame Decode
//!
//! One stateful codec instance per session turns compressed frames into interleaved
//! 16-bit little-endian PCM held in pooled buffers.
//!
//! Supported codec IDs:
//! - `A_OPUS` via libopus (feature `opus`)
//! - `A_PCM/INT/LIT` 16-bit, copied through

use crate::config::SessionConfig;
use crate::error::{Result, StreamError};
use crate::mkv::AudioTrackDescriptor;
use crate::pcm_queue::{BufferPool, PcmPacket};

pub const CODEC_OPUS: &str = "A_OPUS";
pub const CODEC_PCM_LE: &str = "A_PCM/INT/LIT";

/// One second at 48 kHz; no sane frame is longer
const MAX_SAMPLES_PER_CHANNEL: usize = 48_000;

// ============================================================================
// Opus TOC
// ============================================================================

/// Number of frames in an Opus packet, from its TOC byte (and the frame count byte for code 3)
pub fn opus_frame_count(packet: &[u8]) -> Result<usize> {
    let toc = *packet
        .first()
        .ok_or_else(|| StreamError::Decode("empty opus packet".into()))?;
    match toc & 0x03 {
        0 => Ok(1),
        1 | 2 => Ok(2),
        _ => {
            let count = packet
                .get(1)
                .ok_or_else(|| StreamError::Decode("code 3 packet without frame count".into()))?
                & 0x3F;
            if count == 0 {
                return Err(StreamError::Decode("code 3 packet with zero frames".into()));
            }
            Ok(count as usize)
        }
    }
}

/// Samples per channel of one frame at `sample_rate`
pub fn opus_samples_per_frame(toc: u8, sample_rate: u32) -> usize {
    let config = toc >> 3;
    // In units of 0.5 ms
    let half_ms = match config {
        0..=11 => [20, 40, 80, 120][(config & 0x03) as usize],
        12..=15 => [20, 40][(config & 0x01) as usize],
        _ => [5, 10, 20, 40][(config & 0x03) as usize],
    };
    sample_rate as usize * half_ms / 2000
}

// ============================================================================
// Packet Decoder Trait
// ============================================================================

/// A codec instance. Calls are strictly sequential.
pub trait PacketDecoder: Send {
    fn codec_id(&self) -> &'static str;

    /// Samples per channel `packet` will decode to
    fn samples_per_channel(&self, packet: &[u8]) -> Result<usize>;

    /// Decode into interleaved `pcm`; returns samples per channel written
    fn decode(&mut self, packet: &[u8], pcm: &mut [i16]) -> Result<usize>;
}

/// Raw 16-bit little-endian PCM blocks
pub struct PcmPassthrough {
    channels: usize,
}

impl PcmPassthrough {
    pub fn new(channels: u16) -> Self {
        Self {
            channels: channels.max(1) as usize,
        }
    }
}

impl PacketDecoder for PcmPassthrough {
    fn codec_id(&self) -> &'static str {
        CODEC_PCM_LE
    }

    fn samples_per_channel(&self, packet: &[u8]) -> Result<usize> {
        let frame_bytes = 2 * self.channels;
        if packet.len() % frame_bytes != 0 {
            return Err(StreamError::Decode(format!(
                "{} bytes is not a whole number of {} channel frames",
                packet.len(),
                self.channels
            )));
        }
        Ok(packet.len() / frame_bytes)
    }

    fn decode(&mut self, packet: &[u8], pcm: &mut [i16]) -> Result<usize> {
        let samples = self.samples_per_channel(packet)?;
        for (out, bytes) in pcm.iter_mut().zip(packet.chunks_exact(2)) {
            *out = i16::from_le_bytes([bytes[0], bytes[1]]);
        }
        Ok(samples)
    }
}

#[cfg(feature = "opus")]
pub struct OpusPacketDecoder {
    decoder: opus::Decoder,
    sample_rate: u32,
}

#[cfg(feature = "opus")]
impl OpusPacketDecoder {
    pub fn new(sample_rate: u32, channels: u16) -> Result<Self> {
        let layout = match channels {
            1 => opus::Channels::Mono,
            _ => opus::Channels::Stereo,
        };
        let decoder = opus::Decoder::new(sample_rate, layout)
            .map_err(|e| StreamError::Decode(format!("opus init: {}", e)))?;
        Ok(Self {
            decoder,
            sample_rate,
        })
    }
}

#[cfg(feature = "opus")]
impl PacketDecoder for OpusPacketDecoder {
    fn codec_id(&self) -> &'static str {
        CODEC_OPUS
    }

    fn samples_per_channel(&self, packet: &[u8]) -> Result<usize> {
        let frames = opus_frame_count(packet)?;
        Ok(frames * opus_samples_per_frame(packet[0], self.sample_rate))
    }

    fn decode(&mut self, packet: &[u8], pcm: &mut [i16]) -> Result<usize> {
        self.decoder
            .decode(packet, pcm, false)
            .map_err(|e| StreamError::Decode(format!("opus: {}", e)))
    }
}

/// Pick a codec instance for `track`, producing `config`'s output format
pub fn decoder_for(
    track: &AudioTrackDescriptor,
    config: &SessionConfig,
) -> Result<Box<dyn PacketDecoder>> {
    match track.codec_id.as_str() {
        CODEC_OPUS => opus_decoder(config),
        CODEC_PCM_LE => {
            if track.bit_depth.unwrap_or(16) != 16
                || track.channels != config.channels
                || track.sample_rate != config.sample_rate
            {
                return Err(StreamError::UnsupportedCodec(format!(
                    "{} {}-bit {}Hz/{}ch cannot be played at {}Hz/{}ch",
                    CODEC_PCM_LE,
                    track.bit_depth.unwrap_or(16),
                    track.sample_rate,
                    track.channels,
                    config.sample_rate,
                    config.channels
                )));
            }
            Ok(Box::new(PcmPassthrough::new(track.channels)))
        }
        other => Err(StreamError::UnsupportedCodec(other.to_string())),
    }
}

#[cfg(feature = "opus")]
fn opus_decoder(config: &SessionConfig) -> Result<Box<dyn PacketDecoder>> {
    Ok(Box::new(OpusPacketDecoder::new(
        config.sample_rate,
        config.channels,
    )?))
}

#[cfg(not(feature = "opus"))]
fn opus_decoder(_config: &SessionConfig) -> Result<Box<dyn PacketDecoder>> {
    Err(StreamError::UnsupportedCodec(format!(
        "{} (built without the opus feature)",
        CODEC_OPUS
    )))
}

// ============================================================================
// Frame Decoder
// ============================================================================

pub struct FrameDecoder {
    decoder: Box<dyn PacketDecoder>,
    pool: BufferPool,
    channels: usize,
    scratch: Vec<i16>,
}

impl FrameDecoder {
    pub fn new(decoder: Box<dyn PacketDecoder>, pool: BufferPool, channels: u16) -> Self {
        Self {
            decoder,
            pool,
            channels: channels.max(1) as usize,
            scratch: Vec::new(),
        }
    }

    pub fn codec_id(&self) -> &'static str {
        self.decoder.codec_id()
    }

    /// Decode one frame into a pooled packet tagged with `generation`.
    /// On failure the buffer goes straight back to the pool.
    pub fn decode(&mut self, frame: &[u8], timestamp_ms: u64, generation: u64) -> Result<PcmPacket> {
        let per_channel = self.decoder.samples_per_channel(frame)?;
        if per_channel > MAX_SAMPLES_PER_CHANNEL {
            return Err(StreamError::Decode(format!(
                "frame claims {} samples per channel",
                per_channel
            )));
        }

        let samples = per_channel * self.channels;
        self.scratch.resize(samples, 0);
        let mut buffer = self.pool.checkout(samples * 2);

        let decoded = self.decoder.decode(frame, &mut self.scratch)?;
        let decoded = decoded.min(per_channel) * self.channels;

        for (bytes, sample) in buffer.chunks_exact_mut(2).zip(&self.scratch[..decoded]) {
            bytes.copy_from_slice(&sample.to_le_bytes());
        }
        buffer.set_len(decoded * 2);

        Ok(PcmPacket {
            buffer,
            generation,
            timestamp_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm_track(channels: u16) -> AudioTrackDescriptor {
        AudioTrackDescriptor {
            track_number: 1,
            codec_id: CODEC_PCM_LE.to_string(),
            channels,
            sample_rate: 48_000,
            bit_depth: Some(16),
            codec_private: Vec::new(),
        }
    }

    #[test]
    fn test_opus_toc_frame_counts() {
        assert_eq!(opus_frame_count(&[0b1111_1000]).unwrap(), 1);
        assert_eq!(opus_frame_count(&[0b1111_1001]).unwrap(), 2);
        assert_eq!(opus_frame_count(&[0b1111_1010]).unwrap(), 2);
        assert_eq!(opus_frame_count(&[0b1111_1011, 0x05]).unwrap(), 5);
        assert!(opus_frame_count(&[0b1111_1011]).is_err());
        assert!(opus_frame_count(&[]).is_err());
    }

    #[test]
    fn test_opus_samples_per_frame() {
        // CELT 20 ms (config 31) and SILK 60 ms (config 3) at 48 kHz
        assert_eq!(opus_samples_per_frame(31 << 3, 48_000), 960);
        assert_eq!(opus_samples_per_frame(3 << 3, 48_000), 2880);
        // CELT 2.5 ms (config 16)
        assert_eq!(opus_samples_per_frame(16 << 3, 48_000), 120);
        // Hybrid 10 ms at 24 kHz
        assert_eq!(opus_samples_per_frame(12 << 3, 24_000), 240);
    }

    #[test]
    fn test_pcm_frame_packs_little_endian() {
        let pool = BufferPool::new();
        let mut decoder = FrameDecoder::new(Box::new(PcmPassthrough::new(2)), pool.clone(), 2);

        let samples: [i16; 4] = [1, -2, 300, -32768];
        let frame: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        let packet = decoder.decode(&frame, 40, 3).expect("decode");

        assert_eq!(packet.length(), 8);
        assert_eq!(packet.bytes(), &frame[..]);
        assert_eq!(packet.timestamp_ms, 40);
        assert_eq!(packet.generation, 3);
        assert_eq!(pool.outstanding(), 1);
        drop(packet);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_decode_error_returns_buffer() {
        struct Failing;
        impl PacketDecoder for Failing {
            fn codec_id(&self) -> &'static str {
                "A_TEST"
            }
            fn samples_per_channel(&self, _packet: &[u8]) -> Result<usize> {
                Ok(960)
            }
            fn decode(&mut self, _packet: &[u8], _pcm: &mut [i16]) -> Result<usize> {
                Err(StreamError::Decode("corrupt".into()))
            }
        }

        let pool = BufferPool::new();
        let mut decoder = FrameDecoder::new(Box::new(Failing), pool.clone(), 2);
        let err = decoder.decode(&[0xFC], 0, 0).unwrap_err();
        assert!(matches!(err, StreamError::Decode(_)));
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.stats().available, 1);
    }

    #[test]
    fn test_decoder_selection() {
        let config = SessionConfig::default();
        assert!(decoder_for(&pcm_track(2), &config).is_ok());

        let err = decoder_for(&pcm_track(1), &config).err().expect("channel mismatch");
        assert!(matches!(err, StreamError::UnsupportedCodec(_)));

        let mut vorbis = pcm_track(2);
        vorbis.codec_id = "A_VORBIS".to_string();
        let err = decoder_for(&vorbis, &config).err().expect("vorbis");
        assert!(err.is_setup_error());
    }

    #[cfg(not(feature = "opus"))]
    #[test]
    fn test_opus_requires_feature() {
        let mut track = pcm_track(2);
        track.codec_id = CODEC_OPUS.to_string();
        let err = decoder_for(&track, &SessionConfig::default()).err().expect("no opus");
        assert!(matches!(err, StreamError::UnsupportedCodec(_)));
    }
}
