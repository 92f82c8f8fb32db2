//! SimpleBlock / Block payload parsing, including all three lacing schemes.

use bytes::Buf;

use super::parser::{read_signed_vint, read_vint};
use crate::error::{Result, StreamError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lacing {
    None,
    Xiph,
    FixedSize,
    Ebml,
}

impl Lacing {
    fn from_flags(flags: u8) -> Self {
        match (flags >> 1) & 0x03 {
            0 => Lacing::None,
            1 => Lacing::Xiph,
            2 => Lacing::FixedSize,
            _ => Lacing::Ebml,
        }
    }
}

/// One parsed block. Frames borrow from the block payload.
#[derive(Debug, Clone)]
pub struct SampleBlock<'a> {
    pub track_number: u64,
    /// Relative to the enclosing cluster's timestamp, in timestamp-scale ticks
    pub timestamp_offset: i16,
    pub keyframe: bool,
    pub lacing: Lacing,
    pub frames: Vec<&'a [u8]>,
}

impl<'a> SampleBlock<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        let mut cursor = data;
        let track_number = read_vint(&mut cursor)?.value;
        if cursor.remaining() < 3 {
            return Err(StreamError::truncated(0, "block header shorter than 4 bytes"));
        }
        let timestamp_offset = cursor.get_i16();
        let flags = cursor.get_u8();
        let lacing = Lacing::from_flags(flags);

        let frames = match lacing {
            Lacing::None => vec![cursor],
            _ => split_laced(cursor, lacing)?,
        };

        Ok(Self {
            track_number,
            timestamp_offset,
            keyframe: flags & 0x80 != 0,
            lacing,
            frames,
        })
    }
}

fn split_laced(data: &[u8], lacing: Lacing) -> Result<Vec<&[u8]>> {
    let mut cursor = data;
    if !cursor.has_remaining() {
        return Err(StreamError::truncated(0, "laced block without frame count"));
    }
    let count = cursor.get_u8() as usize + 1;

    let mut sizes = Vec::with_capacity(count);
    match lacing {
        Lacing::Xiph => {
            for _ in 0..count - 1 {
                let mut size = 0usize;
                loop {
                    if !cursor.has_remaining() {
                        return Err(StreamError::truncated(0, "xiph lace sizes cut short"));
                    }
                    let byte = cursor.get_u8();
                    size = lace_total(size, byte as usize, data.len())?;
                    if byte != 0xFF {
                        break;
                    }
                }
                sizes.push(size);
            }
        }
        Lacing::FixedSize => {
            if cursor.remaining() % count != 0 {
                return Err(StreamError::UnsupportedLacing(format!(
                    "{} bytes do not split into {} equal frames",
                    cursor.remaining(),
                    count
                )));
            }
            let size = cursor.remaining() / count;
            sizes.resize(count - 1, size);
        }
        Lacing::Ebml => {
            if count > 1 {
                let first = read_vint(&mut cursor)?.to_i64()?;
                sizes.push(lace_size(first, data.len())?);
                let mut previous = first;
                for _ in 1..count - 1 {
                    let (delta, _) = read_signed_vint(&mut cursor)?;
                    previous = previous.checked_add(delta).ok_or_else(|| {
                        StreamError::UnsupportedLacing("EBML lace size overflows".into())
                    })?;
                    sizes.push(lace_size(previous, data.len())?);
                }
            }
        }
        Lacing::None => unreachable!("unlaced blocks are not split"),
    }

    let laced = sizes
        .iter()
        .try_fold(0usize, |total, &size| lace_total(total, size, cursor.remaining()))?;
    if laced > cursor.remaining() {
        return Err(StreamError::truncated(
            0,
            format!("lace sizes {} exceed block payload {}", laced, cursor.remaining()),
        ));
    }
    sizes.push(cursor.remaining() - laced);

    let mut frames = Vec::with_capacity(count);
    let mut rest = cursor;
    for size in sizes {
        let (frame, tail) = rest.split_at(size);
        frames.push(frame);
        rest = tail;
    }
    Ok(frames)
}

fn lace_size(value: i64, limit: usize) -> Result<usize> {
    let size = usize::try_from(value)
        .map_err(|_| StreamError::MalformedVint(format!("negative lace size {}", value)))?;
    if size > limit {
        return Err(StreamError::truncated(
            0,
            format!("lace size {} exceeds block payload {}", size, limit),
        ));
    }
    Ok(size)
}

/// `total + size`, failing once it no longer fits in `limit` bytes
fn lace_total(total: usize, size: usize, limit: usize) -> Result<usize> {
    match total.checked_add(size) {
        Some(sum) if sum <= limit => Ok(sum),
        _ => Err(StreamError::truncated(
            0,
            format!("lace sizes exceed block payload {}", limit),
        )),
    }
}
