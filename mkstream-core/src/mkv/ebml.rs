//! EBML element reader over any `Read + Seek` source.
//!
//! The reader never buffers whole elements: it reads element headers on demand and
//! leaves payloads in the source until a typed read asks for them. Combined with
//! [`ByteRangeSource`](crate::range_source::ByteRangeSource) this means clusters that
//! are skipped are never downloaded.

use std::io::{ErrorKind, Read, Seek, SeekFrom};

use super::elements;
use super::parser::{read_element_id, read_vint, vint_length};
use crate::error::{Result, StreamError};

/// Size value carried by elements whose size vint is all ones
pub const UNKNOWN_SIZE: i64 = -1;

/// Strings longer than this are not metadata we care about
const MAX_STRING_LEN: i64 = 64 * 1024;

/// Largest payload read into memory (blocks, CodecPrivate)
pub const MAX_PAYLOAD_LEN: i64 = 16 * 1024 * 1024;

/// One EBML element header. `position` is the byte offset of the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerElement {
    pub id: u64,
    pub size: i64,
    pub position: i64,
}

impl ContainerElement {
    pub fn is(&self, id: u64) -> bool {
        self.id == id
    }

    pub fn has_unknown_size(&self) -> bool {
        self.size == UNKNOWN_SIZE
    }

    /// Offset just past the payload, `None` for unknown-size elements
    pub fn end(&self) -> Option<u64> {
        if self.has_unknown_size() {
            None
        } else {
            Some(self.position as u64 + self.size as u64)
        }
    }
}

pub struct EbmlReader<S: Read + Seek> {
    source: S,
    pos: u64,
    len: u64,
}

impl<S: Read + Seek> EbmlReader<S> {
    pub fn new(mut source: S) -> Result<Self> {
        let pos = source.stream_position()?;
        let len = source.seek(SeekFrom::End(0))?;
        source.seek(SeekFrom::Start(pos))?;
        Ok(Self { source, pos, len })
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Total length of the underlying stream
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get_ref(&self) -> &S {
        &self.source
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.source
    }

    pub fn into_inner(self) -> S {
        self.source
    }

    /// Move to an absolute offset; a no-op when already there
    pub fn seek_to(&mut self, position: u64) -> Result<()> {
        if position != self.pos {
            self.pos = self.source.seek(SeekFrom::Start(position))?;
        }
        Ok(())
    }

    pub fn skip(&mut self, size: i64) -> Result<()> {
        if size < 0 {
            return Err(StreamError::truncated(self.pos, "cannot skip an unknown-size element"));
        }
        self.seek_to(self.pos + size as u64)
    }

    /// Read the element header at `position`
    pub fn read_element_at(&mut self, position: u64) -> Result<ContainerElement> {
        self.seek_to(position)?;
        self.read_element()?
            .ok_or_else(|| StreamError::truncated(position, "no element at end of stream"))
    }

    /// Read the element header at the current position; `None` at a clean end of stream.
    pub fn read_element(&mut self) -> Result<Option<ContainerElement>> {
        let start = self.pos;
        let mut header = [0u8; 16];

        if self.fill(&mut header[..1])? == 0 {
            return Ok(None);
        }
        let id_len = vint_length(header[0])?;
        self.read_exact_at(start, &mut header[1..id_len])?;

        let size_start = id_len;
        self.read_exact_at(start, &mut header[size_start..size_start + 1])?;
        let size_len = vint_length(header[size_start])?;
        self.read_exact_at(start, &mut header[size_start + 1..size_start + size_len])?;

        let id = read_element_id(&mut &header[..id_len])?;
        let size = read_vint(&mut &header[size_start..size_start + size_len])?;

        let size = if size.is_unknown_size() {
            UNKNOWN_SIZE
        } else {
            size.to_i64()?
        };

        Ok(Some(ContainerElement {
            id: id.value,
            size,
            position: self.pos as i64,
        }))
    }

    /// Cursor over the children of `parent`
    pub fn children(&self, parent: &ContainerElement) -> Children {
        let mut children = Children::within(parent.position as u64, parent.size);
        children.segment_level = parent.is(elements::SEGMENT);
        children
    }

    pub fn read_unsigned(&mut self, element: &ContainerElement) -> Result<Option<u64>> {
        if !(0..=8).contains(&element.size) {
            return Ok(None);
        }
        let mut bytes = [0u8; 8];
        let len = element.size as usize;
        self.read_payload_into(element, &mut bytes[..len])?;
        Ok(Some(
            bytes[..len].iter().fold(0u64, |acc, b| (acc << 8) | *b as u64),
        ))
    }

    pub fn read_float(&mut self, element: &ContainerElement) -> Result<Option<f64>> {
        match element.size {
            0 => Ok(Some(0.0)),
            4 => {
                let mut bytes = [0u8; 4];
                self.read_payload_into(element, &mut bytes)?;
                Ok(Some(f32::from_be_bytes(bytes) as f64))
            }
            8 => {
                let mut bytes = [0u8; 8];
                self.read_payload_into(element, &mut bytes)?;
                Ok(Some(f64::from_be_bytes(bytes)))
            }
            _ => Ok(None),
        }
    }

    pub fn read_string(&mut self, element: &ContainerElement) -> Result<Option<String>> {
        if !(0..=MAX_STRING_LEN).contains(&element.size) {
            return Ok(None);
        }
        let mut bytes = vec![0u8; element.size as usize];
        self.read_payload_into(element, &mut bytes)?;
        while bytes.last() == Some(&0) {
            bytes.pop();
        }
        Ok(String::from_utf8(bytes).ok())
    }

    pub fn read_bytes(&mut self, element: &ContainerElement) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        self.read_payload(element, &mut bytes)?;
        Ok(bytes)
    }

    /// Read the payload into `buf`, reusing its allocation
    pub fn read_payload(&mut self, element: &ContainerElement, buf: &mut Vec<u8>) -> Result<()> {
        if element.has_unknown_size() {
            return Err(StreamError::truncated(
                element.position as u64,
                "payload of unknown size",
            ));
        }
        if element.size > MAX_PAYLOAD_LEN {
            return Err(StreamError::truncated(
                element.position as u64,
                format!("payload of {} bytes exceeds the {} byte limit", element.size, MAX_PAYLOAD_LEN),
            ));
        }
        if element.end().is_some_and(|end| end > self.len) {
            return Err(StreamError::truncated(
                element.position as u64,
                format!("payload of {} bytes runs past end of stream at {}", element.size, self.len),
            ));
        }
        buf.clear();
        buf.resize(element.size as usize, 0);
        self.read_payload_into(element, buf)
    }

    fn read_payload_into(&mut self, element: &ContainerElement, buf: &mut [u8]) -> Result<()> {
        let start = element.position as u64;
        self.seek_to(start)?;
        self.read_exact_at(start, buf)
    }

    fn read_exact_at(&mut self, element_start: u64, buf: &mut [u8]) -> Result<()> {
        let wanted = buf.len();
        let got = self.fill(buf)?;
        if got < wanted {
            return Err(StreamError::truncated(
                element_start,
                format!("needed {} bytes, stream ended after {}", wanted, got),
            ));
        }
        Ok(())
    }

    /// Read until `buf` is full or the stream ends
    fn fill(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.source.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => {
                    filled += n;
                    self.pos += n as u64;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(filled)
    }
}

/// Pull-based cursor over the children of one element.
///
/// The cursor holds no borrow of the reader, so the caller may read payloads between
/// steps. Each step re-positions past the previous child first, so payloads that were
/// not read are skipped. Dropping the cursor early leaks nothing.
#[derive(Debug, Clone)]
pub struct Children {
    next: u64,
    end: Option<u64>,
    /// Children of a Segment are themselves level 1 elements
    segment_level: bool,
}

impl Children {
    /// Children of a payload starting at `start` spanning `size` bytes (`UNKNOWN_SIZE` allowed)
    pub fn within(start: u64, size: i64) -> Self {
        let end = if size == UNKNOWN_SIZE {
            None
        } else {
            Some(start + size as u64)
        };
        Self {
            next: start,
            end,
            segment_level: false,
        }
    }

    /// Offset of the next child header, or where an unknown-size parent ended
    pub fn position(&self) -> u64 {
        self.next
    }

    pub fn next<S: Read + Seek>(
        &mut self,
        reader: &mut EbmlReader<S>,
    ) -> Result<Option<ContainerElement>> {
        if let Some(end) = self.end {
            if self.next >= end {
                return Ok(None);
            }
        }

        reader.seek_to(self.next)?;
        let element = match reader.read_element()? {
            Some(element) => element,
            None if self.end.is_none() => return Ok(None),
            None => {
                return Err(StreamError::truncated(
                    self.next,
                    "stream ended inside parent element",
                ))
            }
        };

        // An unknown-size parent ends where the next top-level element begins.
        if self.end.is_none() && ends_unknown_parent(element.id, self.segment_level) {
            return Ok(None);
        }

        let child_end = match (element.end(), self.end) {
            (Some(child_end), Some(end)) if child_end > end => {
                return Err(StreamError::truncated(
                    self.next,
                    format!(
                        "child {:#x} ends at {} past its parent end {}",
                        element.id, child_end, end
                    ),
                ));
            }
            (Some(child_end), _) => child_end,
            (None, Some(end)) => end,
            (None, None) => u64::MAX,
        };

        self.next = child_end;
        Ok(Some(element))
    }
}

fn ends_unknown_parent(id: u64, segment_level: bool) -> bool {
    if segment_level {
        return matches!(id, elements::SEGMENT | elements::EBML_HEADER);
    }
    matches!(
        id,
        elements::CLUSTER
            | elements::CUES
            | elements::INFO
            | elements::TRACKS
            | elements::SEEK_HEAD
            | elements::SEGMENT
            | elements::EBML_HEADER
    )
}
