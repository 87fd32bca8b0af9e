//! Protobuf wire format primitives.
//!
//! Each record on the wire is a varint "tag" followed by a payload whose
//! shape depends on the tag's wire type:
//!
//! - 0: VARINT (int32, int64, uint32, uint64, sint32, sint64, bool, enum)
//! - 1: I64 (fixed64, sfixed64, double)
//! - 2: LEN (string, bytes, embedded messages, packed repeated fields)
//! - 3/4: START_GROUP / END_GROUP (proto2 groups)
//! - 5: I32 (fixed32, sfixed32, float)
//!
//! Wire types 6 and 7 are reserved and always rejected.

use crate::error::{Error, Result};

/// Protobuf wire types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WireType {
    /// Variable-length integer
    Varint = 0,
    /// 64-bit fixed-width
    I64 = 1,
    /// Length-delimited (strings, bytes, embedded messages)
    Len = 2,
    /// Start group
    StartGroup = 3,
    /// End group
    EndGroup = 4,
    /// 32-bit fixed-width
    I32 = 5,
}

impl TryFrom<u8> for WireType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(WireType::Varint),
            1 => Ok(WireType::I64),
            2 => Ok(WireType::Len),
            3 => Ok(WireType::StartGroup),
            4 => Ok(WireType::EndGroup),
            5 => Ok(WireType::I32),
            _ => Err(Error::malformed(0, format!("illegal wire type {}", value))),
        }
    }
}

/// Maximum valid protobuf field number (2^29 - 1)
pub const MAX_FIELD_NUMBER: u32 = 536_870_911;

/// Field numbers reserved for the protobuf implementation
pub const RESERVED_RANGE: std::ops::RangeInclusive<u32> = 19_000..=19_999;

/// Longest legal varint encoding of a 64-bit value
pub const MAX_VARINT_LEN: usize = 10;

/// Returns true if `number` may be declared as a field number.
pub fn is_valid_field_number(number: u32) -> bool {
    (1..=MAX_FIELD_NUMBER).contains(&number) && !RESERVED_RANGE.contains(&number)
}

/// Builds a tag from a field number and wire type.
#[inline]
pub fn make_tag(number: u32, wire_type: WireType) -> u32 {
    (number << 3) | wire_type as u32
}

/// Decode a varint from the given bytes.
///
/// Returns the decoded value and the number of bytes consumed. The tenth
/// byte of a maximal encoding may only carry the low bit.
#[inline]
pub fn decode_varint(data: &[u8]) -> Result<(u64, usize)> {
    if let Some(&b) = data.first() {
        if b < 0x80 {
            return Ok((u64::from(b), 1));
        }
    }

    let mut result: u64 = 0;
    for (i, &byte) in data.iter().enumerate().take(MAX_VARINT_LEN) {
        if i == MAX_VARINT_LEN - 1 && byte > 1 {
            return Err(Error::malformed(i, "varint exceeds 64 bits"));
        }
        result |= u64::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((result, i + 1));
        }
    }

    if data.len() >= MAX_VARINT_LEN {
        Err(Error::malformed(MAX_VARINT_LEN, "varint longer than 10 bytes"))
    } else {
        Err(Error::malformed(data.len(), "truncated varint"))
    }
}

/// Decode a field tag: a varint of at most five bytes that fits in 32 bits.
#[inline]
pub fn decode_tag(data: &[u8]) -> Result<(u32, usize)> {
    let window = &data[..data.len().min(5)];
    match decode_varint(window) {
        Ok((tag, len)) => {
            u32::try_from(tag).map(|t| (t, len)).map_err(|_| Error::malformed(0, "tag exceeds 32 bits"))
        }
        Err(_) if window.len() == 5 => Err(Error::malformed(0, "tag longer than 5 bytes")),
        Err(e) => Err(e),
    }
}

/// Number of bytes `value` occupies as a varint.
#[inline]
pub fn varint_len(value: u64) -> usize {
    // 1 + floor(log2(v|1)) / 7
    let bits = 64 - (value | 1).leading_zeros() as usize;
    (bits + 6) / 7
}

/// Encodes `value` into `buf`, returning the number of bytes written.
#[inline]
pub fn encode_varint(mut value: u64, buf: &mut [u8; MAX_VARINT_LEN]) -> usize {
    let mut i = 0;
    while value >= 0x80 {
        buf[i] = (value as u8) | 0x80;
        value >>= 7;
        i += 1;
    }
    buf[i] = value as u8;
    i + 1
}

/// ZigZag-encodes a 32-bit signed value.
#[inline]
pub fn zigzag_encode32(n: i32) -> u32 {
    ((n << 1) ^ (n >> 31)) as u32
}

/// ZigZag-encodes a 64-bit signed value.
#[inline]
pub fn zigzag_encode64(n: i64) -> u64 {
    ((n << 1) ^ (n >> 63)) as u64
}

/// ZigZag-decodes a 32-bit value.
#[inline]
pub fn zigzag_decode32(n: u32) -> i32 {
    ((n >> 1) as i32) ^ -((n & 1) as i32)
}

/// ZigZag-decodes a 64-bit value.
#[inline]
pub fn zigzag_decode64(n: u64) -> i64 {
    ((n >> 1) as i64) ^ -((n & 1) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_varint_single_byte() {
        let data = [0x08]; // Value 8
        let (value, len) = decode_varint(&data).unwrap();
        assert_eq!(value, 8);
        assert_eq!(len, 1);
    }

    #[test]
    fn test_decode_varint_multi_byte() {
        let data = [0xAC, 0x02]; // Value 300
        let (value, len) = decode_varint(&data).unwrap();
        assert_eq!(value, 300);
        assert_eq!(len, 2);
    }

    #[test]
    fn test_decode_varint_max() {
        let data = [0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x01];
        let (value, len) = decode_varint(&data).unwrap();
        assert_eq!(value, u64::MAX);
        assert_eq!(len, 10);
    }

    #[test]
    fn test_decode_varint_overlong() {
        let eleven = [0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x81, 0x01];
        assert!(decode_varint(&eleven).is_err());

        let high_bits = [0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x02];
        assert!(decode_varint(&high_bits).is_err());
    }

    #[test]
    fn test_decode_varint_truncated() {
        let err = decode_varint(&[0x96]).unwrap_err();
        assert!(matches!(err, Error::Malformed { offset: 1, .. }));
        assert!(decode_varint(&[]).is_err());
    }

    #[test]
    fn test_decode_tag_limits() {
        assert_eq!(decode_tag(&[0x08, 0x96]).unwrap(), (8, 1));
        // 2^32 does not fit a tag
        assert!(decode_tag(&[0x80, 0x80, 0x80, 0x80, 0x10]).is_err());
        // six-byte tag
        assert!(decode_tag(&[0x80, 0x80, 0x80, 0x80, 0x80, 0x00]).is_err());
    }

    #[test]
    fn test_varint_len_matches_encoding() {
        let mut buf = [0u8; MAX_VARINT_LEN];
        for v in [0u64, 1, 127, 128, 16_383, 16_384, u32::MAX as u64, u64::MAX] {
            let n = encode_varint(v, &mut buf);
            assert_eq!(n, varint_len(v), "value {}", v);
            assert_eq!(decode_varint(&buf[..n]).unwrap(), (v, n));
        }
    }

    #[test]
    fn test_zigzag() {
        assert_eq!(zigzag_encode32(0), 0);
        assert_eq!(zigzag_encode32(-1), 1);
        assert_eq!(zigzag_encode32(1), 2);
        assert_eq!(zigzag_encode32(i32::MIN), u32::MAX);
        assert_eq!(zigzag_encode64(i64::MIN), u64::MAX);
        for v in [0, 1, -1, i32::MIN, i32::MAX] {
            assert_eq!(zigzag_decode32(zigzag_encode32(v)), v);
        }
        for v in [0, 1, -1, i64::MIN, i64::MAX] {
            assert_eq!(zigzag_decode64(zigzag_encode64(v)), v);
        }
    }

    #[test]
    fn test_wire_type_conversion() {
        assert_eq!(WireType::try_from(0).unwrap(), WireType::Varint);
        assert_eq!(WireType::try_from(1).unwrap(), WireType::I64);
        assert_eq!(WireType::try_from(2).unwrap(), WireType::Len);
        assert_eq!(WireType::try_from(5).unwrap(), WireType::I32);
        assert!(WireType::try_from(6).is_err());
        assert!(WireType::try_from(7).is_err());
    }

    #[test]
    fn test_field_number_validity() {
        assert!(!is_valid_field_number(0));
        assert!(is_valid_field_number(1));
        assert!(!is_valid_field_number(19_500));
        assert!(is_valid_field_number(MAX_FIELD_NUMBER));
        assert!(!is_valid_field_number(MAX_FIELD_NUMBER + 1));
    }
}
