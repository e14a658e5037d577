//! Cursor-based byte buffer used by every codec.
//!
//! Writes always append at the end of the buffer. Reads consume from a
//! cursor that can be moved anywhere inside the written range with
//! [`CodecBuffer::seek`]. All fixed-width integers are little-endian and
//! variable-length payloads carry a `u32` length prefix, so a reader never
//! needs to know a payload's size in advance.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{CodecError, CodecResult};

/// Growable, randomly-seekable byte sink/source.
#[derive(Debug, Default, Clone)]
pub struct CodecBuffer {
    data: BytesMut,
    pos: usize,
}

impl CodecBuffer {
    /// Create an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty buffer with room for `capacity` bytes.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity),
            pos: 0,
        }
    }

    /// Wrap existing bytes for reading. The cursor starts at offset 0.
    #[must_use]
    pub fn from_slice(bytes: &[u8]) -> Self {
        Self {
            data: BytesMut::from(bytes),
            pos: 0,
        }
    }

    /// Current read cursor.
    #[must_use]
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Move the read cursor to an absolute offset.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::SeekOutOfBounds` if `pos` is past the end.
    pub fn seek(&mut self, pos: usize) -> CodecResult<()> {
        if pos > self.data.len() {
            return Err(CodecError::SeekOutOfBounds {
                pos,
                len: self.data.len(),
            });
        }
        self.pos = pos;
        Ok(())
    }

    /// Total number of written bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether nothing has been written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Bytes left between the cursor and the end.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// View of everything written so far.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Consume the buffer into immutable bytes.
    #[must_use]
    pub fn freeze(self) -> Bytes {
        self.data.freeze()
    }

    /// Append one byte.
    pub fn write_u8(&mut self, value: u8) {
        self.data.put_u8(value);
    }

    /// Append a little-endian `u16`.
    pub fn write_u16(&mut self, value: u16) {
        self.data.put_u16_le(value);
    }

    /// Append a little-endian `u32`.
    pub fn write_u32(&mut self, value: u32) {
        self.data.put_u32_le(value);
    }

    /// Append a little-endian `u64`.
    pub fn write_u64(&mut self, value: u64) {
        self.data.put_u64_le(value);
    }

    /// Append a little-endian `i64`.
    pub fn write_i64(&mut self, value: i64) {
        self.data.put_i64_le(value);
    }

    /// Overwrite four bytes at an absolute offset, e.g. to back-patch a
    /// length prefix once the payload size is known.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::SeekOutOfBounds` if the range is not written yet.
    pub fn put_u32_at(&mut self, pos: usize, value: u32) -> CodecResult<()> {
        let end = pos.checked_add(4).unwrap_or(usize::MAX);
        if end > self.data.len() {
            return Err(CodecError::SeekOutOfBounds {
                pos,
                len: self.data.len(),
            });
        }
        self.data[pos..end].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Write a `u32` length prefix for a collection or payload.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::LengthOverflow` for lengths above `u32::MAX`.
    pub fn write_len(&mut self, len: usize) -> CodecResult<()> {
        let len = u32::try_from(len).map_err(|_| CodecError::LengthOverflow(len))?;
        self.write_u32(len);
        Ok(())
    }

    /// Write a length-prefixed byte string.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::LengthOverflow` for payloads above `u32::MAX` bytes.
    pub fn write_bytes(&mut self, value: &[u8]) -> CodecResult<()> {
        self.write_len(value.len())?;
        self.data.put_slice(value);
        Ok(())
    }

    /// Write a length-prefixed UTF-8 string.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::LengthOverflow` for strings above `u32::MAX` bytes.
    pub fn write_str(&mut self, value: &str) -> CodecResult<()> {
        self.write_bytes(value.as_bytes())
    }

    /// Append raw bytes without a prefix.
    pub fn write_raw(&mut self, value: &[u8]) {
        self.data.put_slice(value);
    }

    fn ensure(&self, needed: usize) -> CodecResult<()> {
        if self.remaining() < needed {
            return Err(CodecError::UnexpectedEof {
                needed,
                remaining: self.remaining(),
            });
        }
        Ok(())
    }

    /// Read one byte.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::UnexpectedEof` if the buffer is exhausted.
    pub fn read_u8(&mut self) -> CodecResult<u8> {
        self.ensure(1)?;
        let value = (&self.data[self.pos..]).get_u8();
        self.pos += 1;
        Ok(value)
    }

    /// Read a little-endian `u16`.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::UnexpectedEof` if the buffer is exhausted.
    pub fn read_u16(&mut self) -> CodecResult<u16> {
        self.ensure(2)?;
        let value = (&self.data[self.pos..]).get_u16_le();
        self.pos += 2;
        Ok(value)
    }

    /// Read a little-endian `u32`.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::UnexpectedEof` if the buffer is exhausted.
    pub fn read_u32(&mut self) -> CodecResult<u32> {
        self.ensure(4)?;
        let value = (&self.data[self.pos..]).get_u32_le();
        self.pos += 4;
        Ok(value)
    }

    /// Read a little-endian `u64`.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::UnexpectedEof` if the buffer is exhausted.
    pub fn read_u64(&mut self) -> CodecResult<u64> {
        self.ensure(8)?;
        let value = (&self.data[self.pos..]).get_u64_le();
        self.pos += 8;
        Ok(value)
    }

    /// Read a little-endian `i64`.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::UnexpectedEof` if the buffer is exhausted.
    pub fn read_i64(&mut self) -> CodecResult<i64> {
        self.ensure(8)?;
        let value = (&self.data[self.pos..]).get_i64_le();
        self.pos += 8;
        Ok(value)
    }

    /// Read a length prefix written by [`CodecBuffer::write_len`].
    pub fn read_len(&mut self) -> CodecResult<usize> {
        let len = self.read_u32()?;
        usize::try_from(len).map_err(|_| CodecError::LengthOverflow(usize::MAX))
    }

    /// Read `len` raw bytes.
    pub fn read_raw(&mut self, len: usize) -> CodecResult<&[u8]> {
        self.ensure(len)?;
        let start = self.pos;
        self.pos += len;
        Ok(&self.data[start..self.pos])
    }

    /// Read a length-prefixed byte string.
    pub fn read_bytes(&mut self) -> CodecResult<Vec<u8>> {
        let len = self.read_len()?;
        Ok(self.read_raw(len)?.to_vec())
    }

    /// Read a length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> CodecResult<String> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes).map_err(|e| CodecError::InvalidUtf8(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_width_roundtrip() {
        let mut buf = CodecBuffer::new();
        buf.write_u8(0xAB);
        buf.write_u16(u16::MAX);
        buf.write_u32(0);
        buf.write_u64(u64::MAX);
        buf.write_i64(i64::MIN);

        assert_eq!(buf.len(), 1 + 2 + 4 + 8 + 8);
        assert_eq!(buf.read_u8().unwrap(), 0xAB);
        assert_eq!(buf.read_u16().unwrap(), u16::MAX);
        assert_eq!(buf.read_u32().unwrap(), 0);
        assert_eq!(buf.read_u64().unwrap(), u64::MAX);
        assert_eq!(buf.read_i64().unwrap(), i64::MIN);
        assert_eq!(buf.remaining(), 0);
    }

    #[test]
    fn test_eof_is_reported() {
        let mut buf = CodecBuffer::from_slice(&[1, 2, 3]);
        let err = buf.read_u32().unwrap_err();
        assert!(matches!(
            err,
            CodecError::UnexpectedEof {
                needed: 4,
                remaining: 3
            }
        ));
        // A failed read does not move the cursor
        assert_eq!(buf.position(), 0);
    }

    #[test]
    fn test_seek_and_reread() {
        let mut buf = CodecBuffer::new();
        buf.write_str("hello").unwrap();
        buf.write_str("").unwrap();

        assert_eq!(buf.read_string().unwrap(), "hello");
        assert_eq!(buf.read_string().unwrap(), "");
        buf.seek(0).unwrap();
        assert_eq!(buf.read_string().unwrap(), "hello");
        assert!(buf.seek(buf.len() + 1).is_err());
    }

    #[test]
    fn test_back_patch_length() {
        let mut buf = CodecBuffer::new();
        let at = buf.len();
        buf.write_u32(0);
        buf.write_raw(b"abc");
        buf.put_u32_at(at, 3).unwrap();

        assert_eq!(buf.read_u32().unwrap(), 3);
        assert_eq!(buf.read_raw(3).unwrap(), b"abc");
        assert!(buf.put_u32_at(5, 1).is_err());
    }

    #[test]
    fn test_invalid_utf8() {
        let mut buf = CodecBuffer::new();
        buf.write_bytes(&[0xff, 0xfe]).unwrap();
        assert!(matches!(buf.read_string(), Err(CodecError::InvalidUtf8(_))));
    }
}
