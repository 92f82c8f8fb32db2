//! Minimal EBML variable-length integer helpers.

use bytes::{Buf, BufMut};

use crate::error::{Result, StreamError};

/// Largest payload a vint of each length can express is reserved for "unknown size".
const MAX_VINT_LENGTH: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vint {
    pub length: usize,
    pub value: u64,
}

impl Vint {
    /// All value bits set marks an element of unknown size
    pub fn is_unknown_size(&self) -> bool {
        self.value == (1u64 << (7 * self.length)) - 1
    }

    pub fn to_i64(self) -> Result<i64> {
        i64::try_from(self.value).map_err(|_| {
            StreamError::MalformedVint(format!("value {:#x} exceeds i64 range", self.value))
        })
    }
}

/// Encoded length announced by the leading byte of a vint
pub fn vint_length(first: u8) -> Result<usize> {
    if first == 0 {
        return Err(StreamError::MalformedVint(
            "no length marker in leading byte".to_string(),
        ));
    }
    Ok(first.leading_zeros() as usize + 1)
}

/// Read a size/number vint; the length marker is stripped from the value.
pub fn read_vint<B: Buf>(buf: &mut B) -> Result<Vint> {
    if !buf.has_remaining() {
        return Err(StreamError::truncated(0, "missing vint byte"));
    }

    let first = buf.get_u8();
    let length = vint_length(first)?;
    let mask = if length == MAX_VINT_LENGTH {
        0
    } else {
        0xFFu8 >> length
    };

    let mut value = (first & mask) as u64;
    for _ in 1..length {
        if !buf.has_remaining() {
            return Err(StreamError::truncated(
                0,
                format!("vint announces {} bytes", length),
            ));
        }
        value = (value << 8) | buf.get_u8() as u64;
    }

    Ok(Vint { length, value })
}

/// Read an element ID; IDs keep their length marker (0x1A45DFA3 style).
pub fn read_element_id<B: Buf>(buf: &mut B) -> Result<Vint> {
    if !buf.has_remaining() {
        return Err(StreamError::truncated(0, "missing element id byte"));
    }

    let first = buf.chunk()[0];
    let length = vint_length(first)?;
    if length > 4 {
        return Err(StreamError::MalformedVint(format!(
            "element id of {} bytes",
            length
        )));
    }
    if buf.remaining() < length {
        return Err(StreamError::truncated(0, "element id cut short"));
    }

    let value = buf.get_uint(length);
    Ok(Vint { length, value })
}

/// Signed vint used by EBML lacing: the unsigned value minus half its range.
pub fn read_signed_vint<B: Buf>(buf: &mut B) -> Result<(i64, usize)> {
    let vint = read_vint(buf)?;
    let bias = (1i64 << (7 * vint.length - 1)) - 1;
    Ok((vint.to_i64()? - bias, vint.length))
}

/// Encode `value` as a vint of exactly `length` bytes
pub fn write_vint<B: BufMut>(buf: &mut B, value: u64, length: usize) -> Result<()> {
    if length == 0 || length > MAX_VINT_LENGTH {
        return Err(StreamError::MalformedVint(format!(
            "cannot encode a vint of {} bytes",
            length
        )));
    }
    if value >= (1u64 << (7 * length)) {
        return Err(StreamError::MalformedVint(format!(
            "{} does not fit in {} bytes",
            value, length
        )));
    }

    let marked = value | (1u64 << (7 * length));
    buf.put_uint(marked, length);
    Ok(())
}

/// Shortest encoding length that does not collide with the unknown-size marker
pub fn min_vint_length(value: u64) -> usize {
    (1..=MAX_VINT_LENGTH)
        .find(|&len| value < (1u64 << (7 * len)) - 1)
        .unwrap_or(MAX_VINT_LENGTH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_single_byte_vint() {
        let mut data = &b"\x81"[..];
        let vint = read_vint(&mut data).expect("vint");
        assert_eq!(vint.length, 1);
        assert_eq!(vint.value, 0x01);
    }

    #[test]
    fn reads_two_byte_vint() {
        let mut data = &b"\x40\x7F"[..];
        let vint = read_vint(&mut data).expect("vint");
        assert_eq!(vint.length, 2);
        assert_eq!(vint.value, 0x7F);
    }

    #[test]
    fn reads_eight_byte_vint() {
        let mut data = &b"\x01\x00\x00\x00\x00\x00\x01\x00"[..];
        let vint = read_vint(&mut data).expect("vint");
        assert_eq!(vint.length, 8);
        assert_eq!(vint.value, 0x100);
    }

    #[test]
    fn fails_on_truncated_vint() {
        let mut data = &b"\x40"[..];
        let err = read_vint(&mut data).unwrap_err();
        assert!(matches!(err, StreamError::TruncatedElement { .. }));
    }

    #[test]
    fn fails_without_length_marker() {
        let mut data = &b"\x00\x81"[..];
        let err = read_vint(&mut data).unwrap_err();
        assert!(matches!(err, StreamError::MalformedVint(_)));
    }

    #[test]
    fn reencodes_every_length() {
        let samples: [&[u8]; 8] = [
            b"\x9A",
            b"\x42\x86",
            b"\x2A\xD7\xB1",
            b"\x1A\x45\xDF\xA3",
            b"\x08\x00\x00\x00\x05",
            b"\x04\x12\x34\x56\x78\x9A",
            b"\x02\x00\x00\x00\x00\x00\x01",
            b"\x01\x00\x00\x00\x00\x10\x00\x00",
        ];

        for bytes in samples {
            let mut input = bytes;
            let vint = read_vint(&mut input).expect("decode");
            assert_eq!(vint.length, bytes.len());

            let mut out = Vec::new();
            write_vint(&mut out, vint.value, vint.length).expect("encode");
            assert_eq!(out, bytes);
        }
    }

    #[test]
    fn detects_unknown_size() {
        let mut data = &b"\x01\xFF\xFF\xFF\xFF\xFF\xFF\xFF"[..];
        let vint = read_vint(&mut data).expect("vint");
        assert!(vint.is_unknown_size());

        let mut data = &b"\xFF"[..];
        assert!(read_vint(&mut data).expect("vint").is_unknown_size());
    }

    #[test]
    fn element_id_keeps_marker() {
        let mut data = &b"\x1A\x45\xDF\xA3\x9F"[..];
        let id = read_element_id(&mut data).expect("id");
        assert_eq!(id.value, 0x1A45DFA3);
        assert_eq!(id.length, 4);
        assert_eq!(data, b"\x9F");
    }

    #[test]
    fn signed_vint_is_biased() {
        // 0xBF = 63 with a one byte bias of 63
        let mut data = &b"\xBF"[..];
        assert_eq!(read_signed_vint(&mut data).expect("signed"), (0, 1));

        let mut data = &b"\x80"[..];
        assert_eq!(read_signed_vint(&mut data).expect("signed"), (-63, 1));

        let mut data = &b"\x60\x00"[..];
        assert_eq!(read_signed_vint(&mut data).expect("signed").0, 0x2000 - 8191);
    }

    #[test]
    fn min_length_avoids_unknown_marker() {
        assert_eq!(min_vint_length(0), 1);
        assert_eq!(min_vint_length(126), 1);
        assert_eq!(min_vint_length(127), 2);
        assert_eq!(min_vint_length(20_000), 3);
    }
}
