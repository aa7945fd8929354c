//! Coding related traits.
//!
//! Every integer on the wire is little-endian. Sequence numbers and offsets use truncated widths
//! (1 to 8 bytes), handled by [`BufExt::read_uint`] and [`BufMutExt::write_uint`].

use bytes::{Buf, BufMut, Bytes};
use thiserror::Error;

/// Error indicating that the provided buffer was too small
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq)]
#[error("unexpected end of buffer")]
pub struct UnexpectedEnd;

/// Coding result type
pub type Result<T> = ::std::result::Result<T, UnexpectedEnd>;

/// Infallible encoding and decoding of wire primitives
pub trait Codec: Sized {
    /// Decode a `Self` from the provided buffer, if the buffer is large enough
    fn decode<B: Buf>(buf: &mut B) -> Result<Self>;
    /// Append the encoding of `self` to the provided buffer
    fn encode<B: BufMut>(&self, buf: &mut B);
}

impl Codec for u8 {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        if buf.remaining() < 1 {
            return Err(UnexpectedEnd);
        }
        Ok(buf.get_u8())
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(*self);
    }
}

impl Codec for u16 {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        if buf.remaining() < 2 {
            return Err(UnexpectedEnd);
        }
        Ok(buf.get_u16_le())
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u16_le(*self);
    }
}

impl Codec for u32 {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        if buf.remaining() < 4 {
            return Err(UnexpectedEnd);
        }
        Ok(buf.get_u32_le())
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(*self);
    }
}

impl Codec for u64 {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        if buf.remaining() < 8 {
            return Err(UnexpectedEnd);
        }
        Ok(buf.get_u64_le())
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64_le(*self);
    }
}

/// Extension trait for reading from buffers
pub trait BufExt {
    /// Read and decode a value from the buffer
    fn read<T: Codec>(&mut self) -> Result<T>;
    /// Read a little-endian integer occupying `len` bytes (at most 8)
    fn read_uint(&mut self, len: usize) -> Result<u64>;
    /// Split off the next `len` bytes
    fn read_bytes(&mut self, len: usize) -> Result<Bytes>;
    /// Read a string prefixed by its two-byte length
    fn read_string16(&mut self) -> Result<Bytes>;
}

impl<T: Buf> BufExt for T {
    fn read<U: Codec>(&mut self) -> Result<U> {
        U::decode(self)
    }

    fn read_uint(&mut self, len: usize) -> Result<u64> {
        debug_assert!(len <= 8);
        if self.remaining() < len {
            return Err(UnexpectedEnd);
        }
        Ok(self.get_uint_le(len))
    }

    fn read_bytes(&mut self, len: usize) -> Result<Bytes> {
        if self.remaining() < len {
            return Err(UnexpectedEnd);
        }
        Ok(self.copy_to_bytes(len))
    }

    fn read_string16(&mut self) -> Result<Bytes> {
        let len = self.read::<u16>()?;
        self.read_bytes(usize::from(len))
    }
}

/// Extension trait for writing to buffers
pub trait BufMutExt {
    /// Write and encode a value to the buffer
    fn write<T: Codec>(&mut self, x: T);
    /// Write the low `len` bytes of `x`, little-endian
    fn write_uint(&mut self, x: u64, len: usize);
    /// Write a string prefixed by its two-byte length
    fn write_string16(&mut self, x: &[u8]);
}

impl<T: BufMut> BufMutExt for T {
    fn write<U: Codec>(&mut self, x: U) {
        x.encode(self);
    }

    fn write_uint(&mut self, x: u64, len: usize) {
        debug_assert!(len <= 8);
        self.put_uint_le(x, len);
    }

    fn write_string16(&mut self, x: &[u8]) {
        debug_assert!(x.len() <= usize::from(u16::MAX));
        self.write(x.len() as u16);
        self.put_slice(x);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncated_integers() {
        let mut buf = Vec::new();
        buf.write_uint(0x0000_1234_5678_9abc, 6);
        assert_eq!(buf, [0xbc, 0x9a, 0x78, 0x56, 0x34, 0x12]);
        assert_eq!((&buf[..]).read_uint(6), Ok(0x0000_1234_5678_9abc));
        assert_eq!((&buf[..5]).read_uint(6), Err(UnexpectedEnd));
    }

    #[test]
    fn slices() {
        let mut buf: &[u8] = &[1, 0, 0, 0, 2];
        assert_eq!(buf.read::<u32>(), Ok(1));
        assert_eq!(buf.read::<u8>(), Ok(2));
        assert_eq!(buf.read::<u8>(), Err(UnexpectedEnd));
    }

    #[test]
    fn string16() {
        let mut buf = Vec::new();
        buf.write_string16(b"because");
        assert_eq!(&buf[..2], &[7, 0]);
        let mut read = &buf[..];
        assert_eq!(read.read_string16().unwrap(), &b"because"[..]);
        assert!(read.is_empty());
        assert_eq!((&buf[..4]).read_string16(), Err(UnexpectedEnd));
    }
}
