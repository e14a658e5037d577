//! Binary codecs for persisted keys and values.
//!
//! A [`Codec`] turns one value into bytes inside a [`CodecBuffer`] and back.
//! Codecs are stateless and compose: a set codec is built from the element
//! codec, a versioned codec wraps any other codec, and so on.
//!
//! # Example
//!
//! ```
//! use convenient_storage::codec::{
//!     decode_from_slice, encode_to_bytes, CodecContext, SetCodec, StringCodec,
//! };
//! use std::collections::HashSet;
//!
//! let codec = SetCodec::new(StringCodec);
//! let ctx = CodecContext::default();
//! let value: HashSet<String> = ["a".to_string(), "b".to_string()].into();
//!
//! let bytes = encode_to_bytes(&codec, &ctx, &value).unwrap();
//! let decoded = decode_from_slice(&codec, &ctx, &bytes).unwrap();
//! assert_eq!(value, decoded);
//! ```

mod buffer;
mod combinators;
mod primitives;

pub use buffer::CodecBuffer;
pub use combinators::{
    FnCodec, OptionCodec, PairCodec, SetCodec, SortedMapCodec, SortedSetCodec, VecCodec,
    VersionedCodec,
};
pub use primitives::{
    BoolCodec, BytesCodec, Hash128Codec, I64Codec, StringCodec, U16Codec, U32Codec, U64Codec,
    U8Codec,
};

use bytes::Bytes;

/// Error types for encoding and decoding.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// Buffer ended before the value was complete
    #[error("Unexpected end of buffer: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEof {
        /// Bytes the read required
        needed: usize,
        /// Bytes that were left
        remaining: usize,
    },

    /// String payload was not valid UTF-8
    #[error("Invalid UTF-8 payload: {0}")]
    InvalidUtf8(String),

    /// Unknown discriminant for a tagged value
    #[error("Invalid tag {tag} for {kind}")]
    InvalidTag {
        /// Type being decoded
        kind: &'static str,
        /// Tag found in the buffer
        tag: u8,
    },

    /// Versioned payload written by an incompatible format
    #[error("Unsupported version {found} (expected {expected})")]
    UnsupportedVersion {
        /// Version this codec understands
        expected: u16,
        /// Version found in the buffer
        found: u16,
    },

    /// Length does not fit the fixed-width prefix
    #[error("Length {0} does not fit a u32 prefix")]
    LengthOverflow(usize),

    /// Cursor moved outside the written range
    #[error("Seek to {pos} is outside buffer of length {len}")]
    SeekOutOfBounds {
        /// Requested offset
        pos: usize,
        /// Buffer length
        len: usize,
    },

    /// Decoding finished with unread bytes left over
    #[error("{0} trailing bytes after value")]
    TrailingBytes(usize),

    /// Value-level validation failed after decoding
    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Context handed to every codec call.
///
/// Carries the on-disk format version of the region the value lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecContext {
    /// Format version of the enclosing region
    pub format_version: u16,
}

impl Default for CodecContext {
    fn default() -> Self {
        Self {
            format_version: crate::region::REGION_FORMAT_VERSION,
        }
    }
}

/// Bidirectional binary encoding of one value type.
///
/// Implementations must be pure: `decode(encode(v)) == v` for every legal
/// value, and no state may be kept between calls.
pub trait Codec: Send + Sync {
    /// Type this codec encodes.
    type Value;

    /// Append the encoding of `value` to `buf`.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::LengthOverflow` if a payload is too large for its prefix.
    fn encode(
        &self,
        ctx: &CodecContext,
        buf: &mut CodecBuffer,
        value: &Self::Value,
    ) -> CodecResult<()>;

    /// Read one value starting at the buffer's cursor.
    ///
    /// # Errors
    ///
    /// Returns a `CodecError` if the bytes do not form a valid value.
    fn decode(&self, ctx: &CodecContext, buf: &mut CodecBuffer) -> CodecResult<Self::Value>;
}

impl<C: Codec + ?Sized> Codec for &C {
    type Value = C::Value;

    fn encode(
        &self,
        ctx: &CodecContext,
        buf: &mut CodecBuffer,
        value: &Self::Value,
    ) -> CodecResult<()> {
        (**self).encode(ctx, buf, value)
    }

    fn decode(&self, ctx: &CodecContext, buf: &mut CodecBuffer) -> CodecResult<Self::Value> {
        (**self).decode(ctx, buf)
    }
}

impl<C: Codec + ?Sized> Codec for std::sync::Arc<C> {
    type Value = C::Value;

    fn encode(
        &self,
        ctx: &CodecContext,
        buf: &mut CodecBuffer,
        value: &Self::Value,
    ) -> CodecResult<()> {
        (**self).encode(ctx, buf, value)
    }

    fn decode(&self, ctx: &CodecContext, buf: &mut CodecBuffer) -> CodecResult<Self::Value> {
        (**self).decode(ctx, buf)
    }
}

/// Encode a single value into a standalone byte string.
///
/// # Errors
///
/// Propagates the codec's encoding error.
pub fn encode_to_bytes<C: Codec + ?Sized>(
    codec: &C,
    ctx: &CodecContext,
    value: &C::Value,
) -> CodecResult<Bytes> {
    let mut buf = CodecBuffer::new();
    codec.encode(ctx, &mut buf, value)?;
    Ok(buf.freeze())
}

/// Decode a value that must span the whole slice.
///
/// # Errors
///
/// Returns `CodecError::TrailingBytes` if bytes are left after the value,
/// or the codec's own decoding error.
pub fn decode_from_slice<C: Codec + ?Sized>(
    codec: &C,
    ctx: &CodecContext,
    bytes: &[u8],
) -> CodecResult<C::Value> {
    let mut buf = CodecBuffer::from_slice(bytes);
    let value = codec.decode(ctx, &mut buf)?;
    if buf.remaining() != 0 {
        return Err(CodecError::TrailingBytes(buf.remaining()));
    }
    Ok(value)
}
