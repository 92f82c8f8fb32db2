// Matroska/WebM audio demuxer
// Reads the header and index once, then walks clusters lazily from a cue point

pub mod block;
pub mod ebml;
pub mod elements;
pub mod parser;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::{Read, Seek};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, StreamError};
use block::SampleBlock;
use ebml::{Children, ContainerElement, EbmlReader};

// ============================================================================
// Data Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioTrackDescriptor {
    pub track_number: u64,
    pub codec_id: String,
    pub channels: u16,
    pub sample_rate: u32,
    pub bit_depth: Option<u8>,
    #[serde(skip)]
    pub codec_private: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CueTrackPosition {
    pub track: u64,
    /// Absolute byte offset of the cluster
    pub cluster_position: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CuePoint {
    pub time_ms: u64,
    pub track_positions: Vec<CueTrackPosition>,
}

impl CuePoint {
    pub fn position_for(&self, track: u64) -> Option<i64> {
        self.track_positions
            .iter()
            .find(|p| p.track == track)
            .map(|p| p.cluster_position)
    }

    /// Cluster to start from for `track`. Clusters interleave every track, so a cue that
    /// only indexes another track still points at a cluster holding this one.
    pub fn cluster_for(&self, track: u64) -> Option<i64> {
        self.position_for(track)
            .or_else(|| self.track_positions.first().map(|p| p.cluster_position))
    }
}

/// Summary of an opened container
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MkvInfo {
    pub doc_type: String,
    pub duration_ms: u64,
    pub timestamp_scale: u64,
    pub tracks: Vec<AudioTrackDescriptor>,
    pub cue_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemuxerState {
    Unopened,
    HeaderValidated,
    IndexLoaded,
    Streaming,
    Seeking,
    Finished,
}

/// A block forwarded by the cluster walk
#[derive(Debug)]
pub struct TimedBlock<'a> {
    /// Cluster timestamp + block offset
    pub time_ms: u64,
    pub block: SampleBlock<'a>,
}

// ============================================================================
// Seek Control
// ============================================================================

/// Seek target plus the two cancellation scopes of one session.
///
/// `outer` abandons the song. Each producer run gets an inner child token; a seek
/// cancels only that child, so the run can tell "restart" from "stop".
pub struct SeekControl {
    outer: CancellationToken,
    inner: Mutex<CancellationToken>,
    target_ms: AtomicU64,
    total_ms: u64,
}

impl SeekControl {
    pub fn new(total_ms: u64) -> Self {
        let outer = CancellationToken::new();
        let inner = outer.child_token();
        Self {
            outer,
            inner: Mutex::new(inner),
            target_ms: AtomicU64::new(0),
            total_ms,
        }
    }

    pub fn outer(&self) -> &CancellationToken {
        &self.outer
    }

    pub fn total_ms(&self) -> u64 {
        self.total_ms
    }

    pub fn target_ms(&self) -> u64 {
        self.target_ms.load(Ordering::Relaxed)
    }

    pub fn check(&self, time_ms: u64) -> Result<()> {
        if time_ms > self.total_ms {
            return Err(StreamError::OutOfRange {
                requested_ms: time_ms,
                total_ms: self.total_ms,
            });
        }
        Ok(())
    }

    /// Record a new target and cancel the in-flight walk
    pub fn seek(&self, time_ms: u64) -> Result<()> {
        self.seek_with(time_ms, || Ok(()))
    }

    /// Like `seek`, running `before_cancel` (typically a flush) between recording the
    /// target and cancelling the walk. Runs under the same lock as `begin_run`, so a
    /// new run sees either none or all of the seek.
    pub fn seek_with<F>(&self, time_ms: u64, before_cancel: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        self.check(time_ms)?;
        let inner = self.inner.lock();
        self.target_ms.store(time_ms, Ordering::SeqCst);
        let prepared = before_cancel();
        inner.cancel();
        tracing::debug!("Seek requested to {}ms", time_ms);
        prepared
    }

    /// Start a producer run: a fresh inner token, the target to start from, and
    /// whatever `snapshot` captures while no seek can interleave.
    pub fn begin_run<T, F>(&self, snapshot: F) -> (CancellationToken, u64, T)
    where
        F: FnOnce() -> T,
    {
        let mut inner = self.inner.lock();
        let token = self.outer.child_token();
        *inner = token.clone();
        let target = self.target_ms.load(Ordering::SeqCst);
        (token, target, snapshot())
    }

    pub fn cancel_all(&self) {
        self.outer.cancel();
    }
}

// ============================================================================
// Demuxer
// ============================================================================

pub struct MatroskaDemuxer<S: Read + Seek> {
    reader: EbmlReader<S>,
    state: DemuxerState,
    doc_type: String,
    timestamp_scale: u64,
    duration_ms: u64,
    segment_data_start: u64,
    segment_end: Option<u64>,
    tracks: Vec<AudioTrackDescriptor>,
    cues: Vec<CuePoint>,
    /// Reused payload buffer for blocks
    block_buf: Vec<u8>,
}

impl<S: Read + Seek> MatroskaDemuxer<S> {
    /// Validate the header and load tracks, cues and duration
    pub fn open(source: S, doc_types: &[String]) -> Result<Self> {
        let mut demuxer = Self {
            reader: EbmlReader::new(source)?,
            state: DemuxerState::Unopened,
            doc_type: String::new(),
            timestamp_scale: elements::DEFAULT_TIMESTAMP_SCALE,
            duration_ms: 0,
            segment_data_start: 0,
            segment_end: None,
            tracks: Vec::new(),
            cues: Vec::new(),
            block_buf: Vec::with_capacity(4096),
        };

        let header_end = demuxer.validate_header(doc_types)?;
        demuxer.load_index(header_end)?;

        tracing::info!(
            "Opened {} container: {} audio track(s), {} cue(s), {}ms",
            demuxer.doc_type,
            demuxer.tracks.len(),
            demuxer.cues.len(),
            demuxer.duration_ms
        );
        Ok(demuxer)
    }

    pub fn state(&self) -> DemuxerState {
        self.state
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration_ms
    }

    pub fn tracks(&self) -> &[AudioTrackDescriptor] {
        &self.tracks
    }

    /// The track that gets played
    pub fn audio_track(&self) -> &AudioTrackDescriptor {
        &self.tracks[0]
    }

    pub fn cues(&self) -> &[CuePoint] {
        &self.cues
    }

    pub fn info(&self) -> MkvInfo {
        MkvInfo {
            doc_type: self.doc_type.clone(),
            duration_ms: self.duration_ms,
            timestamp_scale: self.timestamp_scale,
            tracks: self.tracks.clone(),
            cue_count: self.cues.len(),
        }
    }

    pub fn reader_mut(&mut self) -> &mut EbmlReader<S> {
        &mut self.reader
    }

    pub fn mark_seeking(&mut self) {
        self.state = DemuxerState::Seeking;
    }

    /// Index of the greatest cue at or before `time_ms`, falling back to the first cue
    pub fn cue_floor(&self, time_ms: u64) -> usize {
        self.cues
            .iter()
            .rposition(|cue| cue.time_ms <= time_ms)
            .unwrap_or(0)
    }

    // ========================================================================
    // Header / Index
    // ========================================================================

    fn validate_header(&mut self, doc_types: &[String]) -> Result<u64> {
        let header = self.reader.read_element_at(0)?;
        if !header.is(elements::EBML_HEADER) {
            return Err(StreamError::InvalidContainer(format!(
                "expected EBML header, found element {:#x}",
                header.id
            )));
        }
        let header_end = header
            .end()
            .ok_or_else(|| StreamError::InvalidContainer("EBML header of unknown size".into()))?;

        let mut doc_type = None;
        let mut children = self.reader.children(&header);
        while let Some(child) = children.next(&mut self.reader)? {
            if child.is(elements::DOC_TYPE) {
                doc_type = self.reader.read_string(&child)?;
            }
        }

        let doc_type = doc_type
            .ok_or_else(|| StreamError::InvalidContainer("missing DocType".into()))?;
        if !doc_types.iter().any(|accepted| accepted == &doc_type) {
            return Err(StreamError::InvalidContainer(format!(
                "unsupported DocType {:?}",
                doc_type
            )));
        }

        self.doc_type = doc_type;
        self.state = DemuxerState::HeaderValidated;
        Ok(header_end)
    }

    fn load_index(&mut self, mut position: u64) -> Result<()> {
        let segment = loop {
            let element = self.reader.read_element_at(position)?;
            if element.is(elements::SEGMENT) {
                break element;
            }
            position = element
                .end()
                .ok_or_else(|| StreamError::InvalidContainer("no Segment element".into()))?;
        };
        self.segment_data_start = segment.position as u64;
        self.segment_end = segment.end();

        let mut duration_ticks = None;
        let mut cue_ticks: Vec<(u64, Vec<CueTrackPosition>)> = Vec::new();
        let mut cues_offset = None;
        let mut have_cues = false;

        let mut children = self.reader.children(&segment);
        while let Some(child) = children.next(&mut self.reader)? {
            match child.id {
                elements::SEEK_HEAD => cues_offset = self.parse_seek_head(&child)?,
                elements::INFO => duration_ticks = self.parse_info(&child)?,
                elements::TRACKS => self.parse_tracks(&child)?,
                elements::CUES => {
                    cue_ticks = self.parse_cues(&child)?;
                    have_cues = true;
                }
                elements::CLUSTER => {
                    // Clusters are not needed for the index; jump straight to the
                    // cues if the seek head told us where they are.
                    if !have_cues {
                        if let Some(offset) = cues_offset {
                            let cues = self
                                .reader
                                .read_element_at(self.segment_data_start + offset)?;
                            if cues.is(elements::CUES) {
                                cue_ticks = self.parse_cues(&cues)?;
                                have_cues = true;
                            }
                        }
                    }
                    if have_cues || child.has_unknown_size() {
                        break;
                    }
                }
                _ => {}
            }

            if have_cues && !self.tracks.is_empty() && duration_ticks.is_some() {
                break;
            }
        }

        if self.tracks.is_empty() {
            return Err(StreamError::MissingIndex("no audio track".into()));
        }
        if !have_cues || cue_ticks.is_empty() {
            return Err(StreamError::MissingIndex("no cue points".into()));
        }
        let duration_ticks =
            duration_ticks.ok_or_else(|| StreamError::MissingIndex("no duration".into()))?;

        self.duration_ms = (duration_ticks * self.timestamp_scale as f64 / 1_000_000.0) as u64;
        let mut cues: Vec<CuePoint> = cue_ticks
            .into_iter()
            .filter(|(_, track_positions)| !track_positions.is_empty())
            .map(|(ticks, track_positions)| CuePoint {
                time_ms: self.ticks_to_ms(ticks as i64),
                track_positions,
            })
            .collect();
        if cues.is_empty() {
            return Err(StreamError::MissingIndex("no cue points with cluster positions".into()));
        }
        cues.sort_by_key(|cue| cue.time_ms);
        let track = self.tracks[0].track_number;
        if !cues.iter().any(|cue| cue.position_for(track).is_some()) {
            tracing::debug!("Cues do not index track {}, using other tracks' clusters", track);
        }
        self.cues = cues;

        self.state = DemuxerState::IndexLoaded;
        Ok(())
    }

    /// Segment-relative offset of the Cues element, if listed
    fn parse_seek_head(&mut self, seek_head: &ContainerElement) -> Result<Option<u64>> {
        let mut cues_offset = None;
        let mut entries = self.reader.children(seek_head);
        while let Some(entry) = entries.next(&mut self.reader)? {
            if !entry.is(elements::SEEK) {
                continue;
            }
            let mut id = None;
            let mut offset = None;
            let mut fields = self.reader.children(&entry);
            while let Some(field) = fields.next(&mut self.reader)? {
                match field.id {
                    elements::SEEK_ID => {
                        let raw = self.reader.read_bytes(&field)?;
                        id = Some(raw.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64));
                    }
                    elements::SEEK_POSITION => offset = self.reader.read_unsigned(&field)?,
                    _ => {}
                }
            }
            if id == Some(elements::CUES) {
                cues_offset = offset;
            }
        }
        Ok(cues_offset)
    }

    /// Reads the timestamp scale, returns the duration in ticks
    fn parse_info(&mut self, info: &ContainerElement) -> Result<Option<f64>> {
        let mut duration = None;
        let mut fields = self.reader.children(info);
        while let Some(field) = fields.next(&mut self.reader)? {
            match field.id {
                elements::TIMESTAMP_SCALE => {
                    if let Some(scale) = self.reader.read_unsigned(&field)? {
                        if scale > 0 {
                            self.timestamp_scale = scale;
                        }
                    }
                }
                elements::DURATION => duration = self.reader.read_float(&field)?,
                _ => {}
            }
        }
        Ok(duration)
    }

    fn parse_tracks(&mut self, tracks: &ContainerElement) -> Result<()> {
        let mut entries = self.reader.children(tracks);
        while let Some(entry) = entries.next(&mut self.reader)? {
            if !entry.is(elements::TRACK_ENTRY) {
                continue;
            }
            if let Some(track) = self.parse_track_entry(&entry)? {
                tracing::debug!(
                    "Audio track {}: {} {}Hz/{}ch",
                    track.track_number,
                    track.codec_id,
                    track.sample_rate,
                    track.channels
                );
                self.tracks.push(track);
            }
        }
        Ok(())
    }

    fn parse_track_entry(&mut self, entry: &ContainerElement) -> Result<Option<AudioTrackDescriptor>> {
        let mut number = None;
        let mut track_type = None;
        let mut codec_id = None;
        let mut codec_private = Vec::new();
        let mut sample_rate = 8000.0;
        let mut channels = 1u64;
        let mut bit_depth = None;

        let mut fields = self.reader.children(entry);
        while let Some(field) = fields.next(&mut self.reader)? {
            match field.id {
                elements::TRACK_NUMBER => number = self.reader.read_unsigned(&field)?,
                elements::TRACK_TYPE => track_type = self.reader.read_unsigned(&field)?,
                elements::CODEC_ID => codec_id = self.reader.read_string(&field)?,
                elements::CODEC_PRIVATE => codec_private = self.reader.read_bytes(&field)?,
                elements::AUDIO => {
                    let mut audio = self.reader.children(&field);
                    while let Some(setting) = audio.next(&mut self.reader)? {
                        match setting.id {
                            elements::SAMPLING_FREQUENCY => {
                                if let Some(rate) = self.reader.read_float(&setting)? {
                                    sample_rate = rate;
                                }
                            }
                            elements::CHANNELS => {
                                if let Some(count) = self.reader.read_unsigned(&setting)? {
                                    channels = count;
                                }
                            }
                            elements::BIT_DEPTH => {
                                bit_depth = self
                                    .reader
                                    .read_unsigned(&setting)?
                                    .and_then(|depth| u8::try_from(depth).ok());
                            }
                            _ => {}
                        }
                    }
                }
                _ => {}
            }
        }

        if track_type != Some(elements::TRACK_TYPE_AUDIO) {
            return Ok(None);
        }
        let track_number =
            number.ok_or_else(|| StreamError::MissingIndex("audio track without number".into()))?;

        Ok(Some(AudioTrackDescriptor {
            track_number,
            codec_id: codec_id.unwrap_or_default(),
            channels: channels.min(u16::MAX as u64) as u16,
            sample_rate: sample_rate.round() as u32,
            bit_depth,
            codec_private,
        }))
    }

    /// Cue times stay in ticks until the timestamp scale is known
    fn parse_cues(
        &mut self,
        cues: &ContainerElement,
    ) -> Result<Vec<(u64, Vec<CueTrackPosition>)>> {
        let mut points = Vec::new();
        let mut entries = self.reader.children(cues);
        while let Some(entry) = entries.next(&mut self.reader)? {
            if !entry.is(elements::CUE_POINT) {
                continue;
            }
            let mut time = None;
            let mut positions = Vec::new();
            let mut fields = self.reader.children(&entry);
            while let Some(field) = fields.next(&mut self.reader)? {
                match field.id {
                    elements::CUE_TIME => time = self.reader.read_unsigned(&field)?,
                    elements::CUE_TRACK_POSITIONS => {
                        if let Some(position) = self.parse_cue_track_position(&field)? {
                            positions.push(position);
                        }
                    }
                    _ => {}
                }
            }
            if let Some(time) = time {
                points.push((time, positions));
            }
        }
        Ok(points)
    }

    fn parse_cue_track_position(
        &mut self,
        element: &ContainerElement,
    ) -> Result<Option<CueTrackPosition>> {
        let mut track = None;
        let mut cluster = None;
        let mut fields = self.reader.children(element);
        while let Some(field) = fields.next(&mut self.reader)? {
            match field.id {
                elements::CUE_TRACK => track = self.reader.read_unsigned(&field)?,
                elements::CUE_CLUSTER_POSITION => cluster = self.reader.read_unsigned(&field)?,
                _ => {}
            }
        }
        Ok(match (track, cluster) {
            (Some(track), Some(cluster)) => Some(CueTrackPosition {
                track,
                cluster_position: (self.segment_data_start + cluster) as i64,
            }),
            _ => None,
        })
    }

    fn ticks_to_ms(&self, ticks: i64) -> u64 {
        if ticks <= 0 {
            return 0;
        }
        (ticks as u128 * self.timestamp_scale as u128 / 1_000_000) as u64
    }

    // ========================================================================
    // Cluster Walk
    // ========================================================================

    /// Walk every cluster from the cue at or before `from_ms` to the end of the segment,
    /// forwarding blocks of the audio track whose absolute time is at least `from_ms`.
    ///
    /// Returns `Err(StreamError::Cancelled)` as soon as `cancel` fires.
    pub fn walk<F>(&mut self, from_ms: u64, cancel: &CancellationToken, mut on_block: F) -> Result<()>
    where
        F: FnMut(&TimedBlock<'_>) -> Result<()>,
    {
        let track = self.audio_track().track_number;
        let start = self.cue_floor(from_ms);
        let positions: Vec<u64> = self.cues[start..]
            .iter()
            .filter_map(|cue| cue.cluster_for(track))
            .map(|position| position as u64)
            .collect();

        tracing::debug!(
            "Walking clusters from cue {} ({}ms) for target {}ms",
            start,
            self.cues[start].time_ms,
            from_ms
        );
        self.state = DemuxerState::Streaming;

        let mut cursor = None::<u64>;
        for (index, &cue_position) in positions.iter().enumerate() {
            // Cues may share a cluster, and clusters between cues are walked in order.
            if cursor.is_some_and(|pos| pos > cue_position) {
                continue;
            }
            let stop = positions[index + 1..]
                .iter()
                .copied()
                .find(|&next| next > cue_position)
                .or(self.segment_end);

            let mut position = cue_position;
            loop {
                if let Some(stop) = stop {
                    if position >= stop {
                        break;
                    }
                }
                if cancel.is_cancelled() {
                    return Err(StreamError::Cancelled);
                }
                match self.walk_element(position, from_ms, track, cancel, &mut on_block)? {
                    Some(next) => position = next,
                    None => break,
                }
            }
            cursor = Some(position);
        }

        self.state = DemuxerState::Finished;
        Ok(())
    }

    /// Handle the top-level element at `position`; returns where the next one starts
    fn walk_element<F>(
        &mut self,
        position: u64,
        from_ms: u64,
        track: u64,
        cancel: &CancellationToken,
        on_block: &mut F,
    ) -> Result<Option<u64>>
    where
        F: FnMut(&TimedBlock<'_>) -> Result<()>,
    {
        self.reader.seek_to(position)?;
        let element = match self.reader.read_element()? {
            Some(element) => element,
            None => return Ok(None),
        };

        if !element.is(elements::CLUSTER) {
            return Ok(element.end());
        }

        let mut children = self.reader.children(&element);
        let cluster_ticks = self.read_cluster_timestamp(&element, &mut children)?;

        while let Some(child) = children.next(&mut self.reader)? {
            if cancel.is_cancelled() {
                return Err(StreamError::Cancelled);
            }
            match child.id {
                elements::SIMPLE_BLOCK => {
                    self.forward_block(&child, cluster_ticks, from_ms, track, on_block)?
                }
                elements::BLOCK_GROUP => {
                    let mut group = self.reader.children(&child);
                    while let Some(member) = group.next(&mut self.reader)? {
                        if member.is(elements::BLOCK) {
                            self.forward_block(&member, cluster_ticks, from_ms, track, on_block)?;
                        }
                    }
                }
                _ => {}
            }
        }

        Ok(Some(children.position()))
    }

    fn read_cluster_timestamp(
        &mut self,
        cluster: &ContainerElement,
        children: &mut Children,
    ) -> Result<u64> {
        let cluster_start = cluster.position as u64;
        loop {
            let child = children
                .next(&mut self.reader)?
                .ok_or(StreamError::ClusterOrderViolation(cluster_start))?;
            match child.id {
                // CRC-32 is required to be the first child when present
                elements::CRC32 => continue,
                elements::TIMESTAMP => {
                    return self
                        .reader
                        .read_unsigned(&child)?
                        .ok_or(StreamError::ClusterOrderViolation(cluster_start));
                }
                _ => return Err(StreamError::ClusterOrderViolation(cluster_start)),
            }
        }
    }

    fn forward_block<F>(
        &mut self,
        element: &ContainerElement,
        cluster_ticks: u64,
        from_ms: u64,
        track: u64,
        on_block: &mut F,
    ) -> Result<()>
    where
        F: FnMut(&TimedBlock<'_>) -> Result<()>,
    {
        let mut payload = std::mem::take(&mut self.block_buf);
        let result = self.reader.read_payload(element, &mut payload).and_then(|()| {
            let block = SampleBlock::parse(&payload)?;
            if block.track_number != track {
                return Ok(());
            }
            let ticks = cluster_ticks as i64 + block.timestamp_offset as i64;
            let time_ms = self.ticks_to_ms(ticks);
            if time_ms < from_ms {
                tracing::trace!("Dropping block at {}ms before target {}ms", time_ms, from_ms);
                return Ok(());
            }
            on_block(&TimedBlock { time_ms, block })
        });
        self.block_buf = payload;
        result
    }
}
