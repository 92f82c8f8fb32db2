//! Synthetic WebM files for the integration tests.
//!
//! Audio is 16-bit little-endian PCM (`A_PCM/INT/LIT`) so no codec library is
//! needed. Every sample of a block carries the block index, which lets tests tell
//! which part of the song reached the device.

#![allow(dead_code)]

use mkstream_core::mkv::elements as ids;
use mkstream_core::mkv::parser::{min_vint_length, write_vint};

/// Where the Cues element goes, if anywhere
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CuesPlacement {
    /// After the last cluster, found through the SeekHead
    End,
    BeforeClusters,
    Missing,
}

#[derive(Debug, Clone)]
pub struct Fixture {
    pub doc_type: &'static str,
    pub sample_rate: u32,
    pub channels: u16,
    pub duration_ms: u64,
    pub cluster_ms: u64,
    pub block_ms: u64,
    /// Defaults to one cue per cluster
    pub cue_times: Option<Vec<u64>>,
    pub cues: CuesPlacement,
    pub write_duration: bool,
    pub unknown_segment_size: bool,
    /// CRC-32 element ahead of each cluster timestamp
    pub cluster_crc: bool,
    /// Non-audio track 2 with one block per cluster
    pub video_track: bool,
    /// Track named by every CueTrackPositions; `None` writes cue points without positions
    pub cue_track: Option<u64>,
}

impl Default for Fixture {
    fn default() -> Self {
        Self {
            doc_type: "webm",
            sample_rate: 48_000,
            channels: 2,
            duration_ms: 6000,
            cluster_ms: 2000,
            block_ms: 20,
            cue_times: None,
            cues: CuesPlacement::End,
            write_duration: true,
            unknown_segment_size: false,
            cluster_crc: false,
            video_track: false,
            cue_track: Some(1),
        }
    }
}

impl Fixture {
    /// Small mono fixture for session tests
    pub fn small() -> Self {
        Self {
            sample_rate: 8000,
            channels: 1,
            ..Default::default()
        }
    }

    pub fn samples_per_block(&self) -> usize {
        (self.sample_rate as u64 * self.block_ms / 1000) as usize * self.channels as usize
    }

    /// Interleaved samples between `from_ms` and the end of the song
    pub fn samples_after(&self, from_ms: u64) -> u64 {
        let blocks = (self.duration_ms - from_ms).div_ceil(self.block_ms);
        blocks * self.samples_per_block() as u64
    }

    pub fn build(&self) -> Vec<u8> {
        let header = master(
            ids::EBML_HEADER,
            &[
                uint(0x4286, 1),
                uint(0x42F7, 1),
                string(ids::DOC_TYPE, self.doc_type),
            ],
        );

        let info = {
            let mut fields = vec![uint(ids::TIMESTAMP_SCALE, 1_000_000)];
            if self.write_duration {
                fields.push(float(ids::DURATION, self.duration_ms as f64));
            }
            master(ids::INFO, &fields)
        };
        let tracks = self.tracks();
        let clusters: Vec<Vec<u8>> = (0..self.duration_ms)
            .step_by(self.cluster_ms as usize)
            .map(|start| self.cluster(start))
            .collect();

        // Fixed-width offsets keep element sizes independent of their values
        let seek_head_len = seek_head(0).len() as u64;
        let cues_len = self.cues_element(&[]).len() as u64;

        let mut offset = seek_head_len + info.len() as u64 + tracks.len() as u64;
        let cues_offset_before = offset;
        if self.cues == CuesPlacement::BeforeClusters {
            offset += cues_len;
        }
        let mut cluster_offsets = Vec::with_capacity(clusters.len());
        for cluster in &clusters {
            cluster_offsets.push(offset);
            offset += cluster.len() as u64;
        }
        let cues_offset = match self.cues {
            CuesPlacement::BeforeClusters => cues_offset_before,
            CuesPlacement::End => offset,
            // Points at the SeekHead itself
            CuesPlacement::Missing => 0,
        };

        let cues = self.cues_element(&cluster_offsets);
        let mut body = Vec::new();
        body.extend(seek_head(cues_offset));
        body.extend(&info);
        body.extend(&tracks);
        if self.cues == CuesPlacement::BeforeClusters {
            body.extend(&cues);
        }
        for cluster in &clusters {
            body.extend(cluster);
        }
        if self.cues == CuesPlacement::End {
            body.extend(&cues);
        }

        let mut file = header;
        if self.unknown_segment_size {
            file.extend(id_bytes(ids::SEGMENT));
            file.extend([0x01, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]);
            file.extend(body);
        } else {
            file.extend(element(ids::SEGMENT, &body));
        }
        file
    }

    fn tracks(&self) -> Vec<u8> {
        let audio = master(
            ids::TRACK_ENTRY,
            &[
                uint(ids::TRACK_NUMBER, 1),
                uint(ids::TRACK_TYPE, ids::TRACK_TYPE_AUDIO),
                string(ids::CODEC_ID, "A_PCM/INT/LIT"),
                master(
                    ids::AUDIO,
                    &[
                        float(ids::SAMPLING_FREQUENCY, self.sample_rate as f64),
                        uint(ids::CHANNELS, self.channels as u64),
                        uint(ids::BIT_DEPTH, 16),
                    ],
                ),
            ],
        );
        let mut entries = Vec::new();
        if self.video_track {
            entries.push(master(
                ids::TRACK_ENTRY,
                &[
                    uint(ids::TRACK_NUMBER, 2),
                    uint(ids::TRACK_TYPE, 1),
                    string(ids::CODEC_ID, "V_VP9"),
                ],
            ));
        }
        entries.push(audio);
        master(ids::TRACKS, &entries)
    }

    fn cluster(&self, start_ms: u64) -> Vec<u8> {
        let mut children = Vec::new();
        if self.cluster_crc {
            children.push(element(ids::CRC32, &[0, 0, 0, 0]));
        }
        children.push(uint(ids::TIMESTAMP, start_ms));

        let end_ms = (start_ms + self.cluster_ms).min(self.duration_ms);
        for time in (start_ms..end_ms).step_by(self.block_ms as usize) {
            let index = (time / self.block_ms) as i16;
            let pcm: Vec<u8> = std::iter::repeat(index.to_le_bytes())
                .take(self.samples_per_block())
                .flatten()
                .collect();
            children.push(simple_block(1, (time - start_ms) as i16, &pcm));
            if self.video_track && time == start_ms {
                children.push(simple_block(2, 0, &[0xAB; 16]));
            }
        }
        master(ids::CLUSTER, &children)
    }

    fn cues_element(&self, cluster_offsets: &[u64]) -> Vec<u8> {
        let times = self.cue_times.clone().unwrap_or_else(|| {
            (0..self.duration_ms).step_by(self.cluster_ms as usize).collect()
        });
        let points: Vec<Vec<u8>> = times
            .iter()
            .map(|&time| {
                let cluster = (time / self.cluster_ms) as usize;
                let position = cluster_offsets.get(cluster).copied().unwrap_or(0);
                let mut fields = vec![uint(ids::CUE_TIME, time)];
                if let Some(track) = self.cue_track {
                    fields.push(master(
                        ids::CUE_TRACK_POSITIONS,
                        &[
                            uint(ids::CUE_TRACK, track),
                            uint_fixed(ids::CUE_CLUSTER_POSITION, position),
                        ],
                    ));
                }
                master(ids::CUE_POINT, &fields)
            })
            .collect();
        master(ids::CUES, &points)
    }
}

// ============================================================================
// EBML writers
// ============================================================================

pub fn id_bytes(id: u64) -> Vec<u8> {
    let len = (8 - id.leading_zeros() as usize / 8).max(1);
    id.to_be_bytes()[8 - len..].to_vec()
}

pub fn element(id: u64, payload: &[u8]) -> Vec<u8> {
    let mut out = id_bytes(id);
    let size = payload.len() as u64;
    write_vint(&mut out, size, min_vint_length(size)).expect("size vint");
    out.extend_from_slice(payload);
    out
}

pub fn master(id: u64, children: &[Vec<u8>]) -> Vec<u8> {
    element(id, &children.concat())
}

pub fn uint(id: u64, value: u64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = (value.leading_zeros() as usize / 8).min(7);
    element(id, &bytes[skip..])
}

pub fn uint_fixed(id: u64, value: u64) -> Vec<u8> {
    element(id, &value.to_be_bytes())
}

pub fn float(id: u64, value: f64) -> Vec<u8> {
    element(id, &value.to_be_bytes())
}

pub fn string(id: u64, value: &str) -> Vec<u8> {
    element(id, value.as_bytes())
}

pub fn simple_block(track: u8, offset: i16, frame: &[u8]) -> Vec<u8> {
    let mut payload = vec![0x80 | track];
    payload.extend(offset.to_be_bytes());
    payload.push(0x80);
    payload.extend_from_slice(frame);
    element(ids::SIMPLE_BLOCK, &payload)
}

fn seek_head(cues_offset: u64) -> Vec<u8> {
    master(
        ids::SEEK_HEAD,
        &[master(
            ids::SEEK,
            &[
                element(ids::SEEK_ID, &id_bytes(ids::CUES)),
                uint_fixed(ids::SEEK_POSITION, cues_offset),
            ],
        )],
    )
}

/// Sample value a block at `time_ms` carries
pub fn block_marker(time_ms: u64, block_ms: u64) -> i16 {
    (time_ms / block_ms) as i16
}
