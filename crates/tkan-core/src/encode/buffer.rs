//! Back-to-front output buffer.
//!
//! The encoder writes a message from its last byte to its first, so a
//! submessage's length is known by the time its prefix is written. Bytes
//! are pushed in reverse and the whole buffer is flipped once at the end.

use crate::wire::{self, WireType, MAX_VARINT_LEN};

#[derive(Debug, Default)]
pub(crate) struct ReverseBuffer {
    bytes: Vec<u8>,
}

impl ReverseBuffer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Bytes written so far
    pub(crate) fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Prepends `data`.
    pub(crate) fn put_bytes(&mut self, data: &[u8]) {
        self.bytes.extend(data.iter().rev());
    }

    pub(crate) fn put_varint(&mut self, value: u64) {
        let mut scratch = [0u8; MAX_VARINT_LEN];
        let n = wire::encode_varint(value, &mut scratch);
        self.put_bytes(&scratch[..n]);
    }

    pub(crate) fn put_tag(&mut self, number: u32, wire_type: WireType) {
        self.put_varint(u64::from(wire::make_tag(number, wire_type)));
    }

    pub(crate) fn put_fixed32(&mut self, value: u32) {
        self.put_bytes(&value.to_le_bytes());
    }

    pub(crate) fn put_fixed64(&mut self, value: u64) {
        self.put_bytes(&value.to_le_bytes());
    }

    /// Writes the bytes in output order into `dst`, which must be exactly
    /// [`len`](Self::len) bytes long.
    pub(crate) fn copy_to(&self, dst: &mut [u8]) {
        debug_assert_eq!(dst.len(), self.bytes.len());
        for (d, s) in dst.iter_mut().zip(self.bytes.iter().rev()) {
            *d = *s;
        }
    }

    /// The written bytes in output order.
    pub(crate) fn into_vec(mut self) -> Vec<u8> {
        self.bytes.reverse();
        self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_prepending() {
        let mut buf = ReverseBuffer::new();
        buf.put_bytes(b"lo");
        buf.put_bytes(b"hel");
        assert_eq!(buf.len(), 5);
        let mut out = [0u8; 5];
        buf.copy_to(&mut out);
        assert_eq!(&out, b"hello");
        assert_eq!(buf.into_vec(), b"hello".to_vec());
    }

    #[test]
    fn test_length_prefix() {
        let mut buf = ReverseBuffer::new();
        let mark = buf.len();
        buf.put_varint(150);
        buf.put_tag(1, WireType::Varint);
        let body = buf.len() - mark;
        buf.put_varint(body as u64);
        buf.put_tag(3, WireType::Len);
        assert_eq!(buf.into_vec(), vec![0x1A, 0x03, 0x08, 0x96, 0x01]);
    }

    #[test]
    fn test_fixed_little_endian() {
        let mut buf = ReverseBuffer::new();
        buf.put_fixed64(1);
        buf.put_fixed32(0x0403_0201);
        assert_eq!(buf.into_vec(), vec![1, 2, 3, 4, 1, 0, 0, 0, 0, 0, 0, 0]);
    }
}
