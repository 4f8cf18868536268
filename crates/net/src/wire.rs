//! Little-endian binary primitives.
//!
//! Layout matches a classic binary writer: fixed-width little-endian integers
//! and floats, one byte per bool, strings as a 7-bit varint byte length
//! followed by UTF-8. Every read consumes an exact number of bytes and fails
//! when the buffer runs short, which is what makes decode-success usable as an
//! integrity proof for bulk chunks.

use thiserror::Error;

/// Upper bound for any single length field (strings, byte arrays, lists).
pub const MAX_FIELD_LEN: usize = 64 * 1024 * 1024;

/// Errors raised while decoding wire data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    /// A read ran past the end of the buffer.
    #[error("unexpected end of buffer: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEof {
        /// Bytes the read required.
        needed: usize,
        /// Bytes left in the buffer.
        remaining: usize,
    },
    /// A length field was negative.
    #[error("negative length {0}")]
    NegativeLength(i32),
    /// A length field exceeded [`MAX_FIELD_LEN`].
    #[error("length {0} exceeds limit")]
    LengthTooLarge(usize),
    /// A 7-bit encoded length did not terminate within five bytes.
    #[error("7-bit encoded length overflows 32 bits")]
    LengthOverflow,
    /// String bytes were not valid UTF-8.
    #[error("string is not valid UTF-8")]
    InvalidUtf8,
    /// Bytes were left over after a complete message.
    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),
    /// The buffer was empty where a packet tag was expected.
    #[error("empty packet")]
    Empty,
    /// No factory is registered for the tag.
    #[error("unknown packet tag {0}")]
    UnknownTag(u8),
    /// No plugin is registered for the type hash.
    #[error("unknown plugin type hash {0:#010x}")]
    UnknownPlugin(u32),
    /// A compressed section could not be expanded.
    #[error("failed to decompress payload")]
    Decompress,
    /// An enum discriminant was out of range.
    #[error("invalid {what} value {value}")]
    InvalidEnum {
        /// Field being decoded.
        what: &'static str,
        /// Raw value read.
        value: i64,
    },
}

/// Growable output buffer.
#[derive(Debug, Default, Clone)]
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    /// Create an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a writer with preallocated capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True when nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Borrow the written bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Consume the writer.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Write one byte.
    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    /// Write a bool as one byte.
    pub fn write_bool(&mut self, value: bool) {
        self.buf.push(u8::from(value));
    }

    /// Write a little-endian `u16`.
    pub fn write_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Write a little-endian `i32`.
    pub fn write_i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Write a little-endian `u32`.
    pub fn write_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Write a little-endian `i64`.
    pub fn write_i64(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Write a little-endian `u64`.
    pub fn write_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Write a little-endian `f32`.
    pub fn write_f32(&mut self, value: f32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Write a 7-bit varint (LEB128) length.
    pub fn write_7bit_len(&mut self, len: usize) {
        let mut value = len as u32;
        while value >= 0x80 {
            self.buf.push((value as u8) | 0x80);
            value >>= 7;
        }
        self.buf.push(value as u8);
    }

    /// Write a length-prefixed UTF-8 string.
    pub fn write_string(&mut self, value: &str) {
        self.write_7bit_len(value.len());
        self.buf.extend_from_slice(value.as_bytes());
    }

    /// Write raw bytes with no prefix.
    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Write an `i32` length followed by the bytes.
    pub fn write_byte_array(&mut self, bytes: &[u8]) {
        self.write_i32(bytes.len() as i32);
        self.buf.extend_from_slice(bytes);
    }

    /// Write an `i32` count followed by each string.
    pub fn write_string_list(&mut self, values: &[String]) {
        self.write_i32(values.len() as i32);
        for value in values {
            self.write_string(value);
        }
    }
}

/// Cursor over an input buffer.
#[derive(Debug, Clone)]
pub struct WireReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    /// Start reading at the beginning of `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Current offset.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Fail unless every byte was consumed.
    pub fn finish(&self) -> Result<(), WireError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(WireError::TrailingBytes(n)),
        }
    }

    fn take(&mut self, needed: usize) -> Result<&'a [u8], WireError> {
        let remaining = self.remaining();
        if needed > remaining {
            return Err(WireError::UnexpectedEof { needed, remaining });
        }
        let slice = &self.data[self.pos..self.pos + needed];
        self.pos += needed;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    /// Read one byte.
    pub fn read_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take_array::<1>()?[0])
    }

    /// Read a one-byte bool (any non-zero value is true).
    pub fn read_bool(&mut self) -> Result<bool, WireError> {
        Ok(self.read_u8()? != 0)
    }

    /// Read a little-endian `u16`.
    pub fn read_u16(&mut self) -> Result<u16, WireError> {
        Ok(u16::from_le_bytes(self.take_array()?))
    }

    /// Read a little-endian `i32`.
    pub fn read_i32(&mut self) -> Result<i32, WireError> {
        Ok(i32::from_le_bytes(self.take_array()?))
    }

    /// Read a little-endian `u32`.
    pub fn read_u32(&mut self) -> Result<u32, WireError> {
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    /// Read a little-endian `i64`.
    pub fn read_i64(&mut self) -> Result<i64, WireError> {
        Ok(i64::from_le_bytes(self.take_array()?))
    }

    /// Read a little-endian `u64`.
    pub fn read_u64(&mut self) -> Result<u64, WireError> {
        Ok(u64::from_le_bytes(self.take_array()?))
    }

    /// Read a little-endian `f32`.
    pub fn read_f32(&mut self) -> Result<f32, WireError> {
        Ok(f32::from_le_bytes(self.take_array()?))
    }

    /// Read a 7-bit varint length.
    pub fn read_7bit_len(&mut self) -> Result<usize, WireError> {
        let mut value: u32 = 0;
        for shift in (0..35).step_by(7) {
            let byte = self.read_u8()?;
            if shift == 28 && byte > 0x0F {
                return Err(WireError::LengthOverflow);
            }
            value |= u32::from(byte & 0x7F) << shift;
            if byte & 0x80 == 0 {
                return checked_len(value as usize);
            }
        }
        Err(WireError::LengthOverflow)
    }

    /// Read a length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> Result<String, WireError> {
        let len = self.read_7bit_len()?;
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| WireError::InvalidUtf8)
    }

    /// Read exactly `len` raw bytes.
    pub fn read_raw(&mut self, len: usize) -> Result<Vec<u8>, WireError> {
        Ok(self.take(len)?.to_vec())
    }

    /// Read an `i32` length and that many bytes.
    pub fn read_byte_array(&mut self) -> Result<Vec<u8>, WireError> {
        let len = self.read_len_i32()?;
        self.read_raw(len)
    }

    /// Read an `i32` element count, rejecting negatives.
    pub fn read_len_i32(&mut self) -> Result<usize, WireError> {
        let raw = self.read_i32()?;
        if raw < 0 {
            return Err(WireError::NegativeLength(raw));
        }
        checked_len(raw as usize)
    }

    /// Read an `i32` count followed by that many strings.
    pub fn read_string_list(&mut self) -> Result<Vec<String>, WireError> {
        let count = self.read_len_i32()?;
        // Every string needs at least its one-byte length prefix.
        let mut out = Vec::with_capacity(count.min(self.remaining()));
        for _ in 0..count {
            out.push(self.read_string()?);
        }
        Ok(out)
    }

    /// Capacity hint for a list of `count` records of `record_size` bytes,
    /// bounded by what the buffer could actually hold.
    pub fn capacity_hint(&self, count: usize, record_size: usize) -> usize {
        count.min(self.remaining() / record_size.max(1))
    }
}

fn checked_len(len: usize) -> Result<usize, WireError> {
    if len > MAX_FIELD_LEN {
        return Err(WireError::LengthTooLarge(len));
    }
    Ok(len)
}
