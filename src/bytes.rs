//! Utilities for decoding from and encoding into bytes.
//!
//! [`ByteReader`] and [`ByteWriter`] wrap a `&[u8]` / `&mut [u8]` and offer
//! cursor-style reading and writing with EOF checking. The [`DecodeAs`]
//! extension trait views a byte slice as a packed wire struct via
//! `zerocopy`, which is how the fixed-layout PDUs (LLCP control data,
//! `CONNECT_IND` LLData) are decoded without copying.

use crate::Error;
use zerocopy::{FromBytes, LayoutVerified, Unaligned};

/// Wrapper around a byte slice that can be used to encode data into bytes.
///
/// All `write_*` methods will return `Error::Eof` when the underlying buffer
/// is full.
pub struct ByteWriter<'a> {
    buf: &'a mut [u8],
    used: usize,
}

impl<'a> ByteWriter<'a> {
    /// Creates a writer that will write to `buf`, starting at the beginning.
    pub fn new(buf: &'a mut [u8]) -> Self {
        ByteWriter { buf, used: 0 }
    }

    /// Returns the number of bytes written so far.
    pub fn bytes_written(&self) -> usize {
        self.used
    }

    /// Returns the amount of space left in the buffer, in bytes.
    pub fn space_left(&self) -> usize {
        self.buf.len() - self.used
    }

    /// Writes all bytes in `other` to the buffer.
    pub fn write_slice(&mut self, other: &[u8]) -> Result<(), Error> {
        if self.space_left() < other.len() {
            return Err(Error::Eof);
        }
        self.buf[self.used..self.used + other.len()].copy_from_slice(other);
        self.used += other.len();
        Ok(())
    }

    /// Writes a single byte to the buffer.
    pub fn write_u8(&mut self, byte: u8) -> Result<(), Error> {
        self.write_slice(&[byte])
    }

    /// Writes a `u16` to the buffer, using little endian byte order.
    pub fn write_u16_le(&mut self, value: u16) -> Result<(), Error> {
        self.write_slice(&value.to_le_bytes())
    }

    /// Writes a `u32` to the buffer, using little endian byte order.
    pub fn write_u32_le(&mut self, value: u32) -> Result<(), Error> {
        self.write_slice(&value.to_le_bytes())
    }
}

/// Wrapper around a byte slice with a cursor, for reading data.
pub struct ByteReader<'a> {
    bytes: &'a [u8],
}

impl<'a> ByteReader<'a> {
    /// Creates a new `ByteReader` that will read from the given byte slice.
    pub fn new(bytes: &'a [u8]) -> Self {
        ByteReader { bytes }
    }

    /// Returns the number of bytes that have not yet been read.
    pub fn bytes_left(&self) -> usize {
        self.bytes.len()
    }

    /// Returns whether the reader is at the end of input.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Reads `len` bytes, advancing the cursor.
    pub fn read_slice(&mut self, len: usize) -> Result<&'a [u8], Error> {
        if self.bytes_left() < len {
            return Err(Error::Eof);
        }
        let (head, tail) = self.bytes.split_at(len);
        self.bytes = tail;
        Ok(head)
    }

    /// Reads the remainder of the input, advancing the cursor to EOF.
    pub fn read_rest(&mut self) -> &'a [u8] {
        let rest = self.bytes;
        self.bytes = &[];
        rest
    }

    /// Reads a single byte.
    pub fn read_u8(&mut self) -> Result<u8, Error> {
        Ok(self.read_slice(1)?[0])
    }

    /// Reads a little-endian `u16`.
    pub fn read_u16_le(&mut self) -> Result<u16, Error> {
        let raw = self.read_slice(2)?;
        Ok(u16::from_le_bytes([raw[0], raw[1]]))
    }

    /// Reads a little-endian `u32`.
    pub fn read_u32_le(&mut self) -> Result<u32, Error> {
        let raw = self.read_slice(4)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }
}

/// Extension trait for viewing byte slices as packed wire structs.
pub trait DecodeAs {
    /// Interprets the start of `self` as a `T`, if enough bytes are present.
    fn decode_as<T: FromBytes + Unaligned>(&self) -> Option<&T>;
}

impl DecodeAs for [u8] {
    fn decode_as<T: FromBytes + Unaligned>(&self) -> Option<&T> {
        let (obj, _rest): (LayoutVerified<&[u8], T>, _) =
            LayoutVerified::new_unaligned_from_prefix(self)?;
        Some(obj.into_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writer_eof() {
        let mut buf = [0; 3];
        let mut w = ByteWriter::new(&mut buf);
        w.write_u16_le(0xAABB).unwrap();
        assert_eq!(w.space_left(), 1);
        assert_eq!(w.write_u16_le(0xCCDD), Err(Error::Eof));
        w.write_u8(0xEE).unwrap();
        assert_eq!(w.bytes_written(), 3);
        assert_eq!(buf, [0xBB, 0xAA, 0xEE]);
    }

    #[test]
    fn reader_cursor() {
        let mut r = ByteReader::new(&[1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(r.read_u8().unwrap(), 1);
        assert_eq!(r.read_u16_le().unwrap(), 0x0302);
        assert_eq!(r.read_u32_le().unwrap(), 0x07060504);
        assert!(r.is_empty());
        assert_eq!(r.read_u8(), Err(Error::Eof));
    }
}
