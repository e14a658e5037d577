//! Codecs for scalar values.

use super::{Codec, CodecBuffer, CodecContext, CodecError, CodecResult};
use crate::hash::Hash128;

macro_rules! fixed_width_codec {
    ($(#[$doc:meta])* $name:ident, $ty:ty, $write:ident, $read:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, Default)]
        pub struct $name;

        impl Codec for $name {
            type Value = $ty;

            fn encode(
                &self,
                _ctx: &CodecContext,
                buf: &mut CodecBuffer,
                value: &$ty,
            ) -> CodecResult<()> {
                buf.$write(*value);
                Ok(())
            }

            fn decode(&self, _ctx: &CodecContext, buf: &mut CodecBuffer) -> CodecResult<$ty> {
                buf.$read()
            }
        }
    };
}

fixed_width_codec!(
    /// One byte.
    U8Codec, u8, write_u8, read_u8
);
fixed_width_codec!(
    /// Little-endian `u16`.
    U16Codec, u16, write_u16, read_u16
);
fixed_width_codec!(
    /// Little-endian `u32`.
    U32Codec, u32, write_u32, read_u32
);
fixed_width_codec!(
    /// Little-endian `u64`.
    U64Codec, u64, write_u64, read_u64
);
fixed_width_codec!(
    /// Little-endian `i64`.
    I64Codec, i64, write_i64, read_i64
);

/// Boolean as a single `0`/`1` byte.
#[derive(Debug, Clone, Copy, Default)]
pub struct BoolCodec;

impl Codec for BoolCodec {
    type Value = bool;

    fn encode(&self, _ctx: &CodecContext, buf: &mut CodecBuffer, value: &bool) -> CodecResult<()> {
        buf.write_u8(u8::from(*value));
        Ok(())
    }

    fn decode(&self, _ctx: &CodecContext, buf: &mut CodecBuffer) -> CodecResult<bool> {
        match buf.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            tag => Err(CodecError::InvalidTag { kind: "bool", tag }),
        }
    }
}

/// Length-prefixed UTF-8 string.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringCodec;

impl Codec for StringCodec {
    type Value = String;

    fn encode(
        &self,
        _ctx: &CodecContext,
        buf: &mut CodecBuffer,
        value: &String,
    ) -> CodecResult<()> {
        buf.write_str(value)
    }

    fn decode(&self, _ctx: &CodecContext, buf: &mut CodecBuffer) -> CodecResult<String> {
        buf.read_string()
    }
}

/// Length-prefixed raw bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesCodec;

impl Codec for BytesCodec {
    type Value = Vec<u8>;

    fn encode(
        &self,
        _ctx: &CodecContext,
        buf: &mut CodecBuffer,
        value: &Vec<u8>,
    ) -> CodecResult<()> {
        buf.write_bytes(value)
    }

    fn decode(&self, _ctx: &CodecContext, buf: &mut CodecBuffer) -> CodecResult<Vec<u8>> {
        buf.read_bytes()
    }
}

/// 128-bit hash as two 64-bit halves, high half first.
#[derive(Debug, Clone, Copy, Default)]
pub struct Hash128Codec;

impl Codec for Hash128Codec {
    type Value = Hash128;

    fn encode(
        &self,
        _ctx: &CodecContext,
        buf: &mut CodecBuffer,
        value: &Hash128,
    ) -> CodecResult<()> {
        buf.write_u64(value.hi());
        buf.write_u64(value.lo());
        Ok(())
    }

    fn decode(&self, _ctx: &CodecContext, buf: &mut CodecBuffer) -> CodecResult<Hash128> {
        let hi = buf.read_u64()?;
        let lo = buf.read_u64()?;
        Ok(Hash128::from_parts(hi, lo))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_from_slice, encode_to_bytes};

    fn roundtrip<C: Codec>(codec: &C, value: &C::Value) -> C::Value {
        let ctx = CodecContext::default();
        let bytes = encode_to_bytes(codec, &ctx, value).unwrap();
        decode_from_slice(codec, &ctx, &bytes).unwrap()
    }

    #[test]
    fn test_integer_boundaries() {
        for value in [0, 1, u64::MAX] {
            assert_eq!(roundtrip(&U64Codec, &value), value);
        }
        for value in [i64::MIN, -1, 0, i64::MAX] {
            assert_eq!(roundtrip(&I64Codec, &value), value);
        }
        assert_eq!(roundtrip(&U32Codec, &u32::MAX), u32::MAX);
        assert_eq!(roundtrip(&U16Codec, &0), 0);
        assert_eq!(roundtrip(&U8Codec, &255), 255);
    }

    #[test]
    fn test_strings_and_bytes() {
        assert_eq!(roundtrip(&StringCodec, &String::new()), "");
        assert_eq!(roundtrip(&StringCodec, &"//a:lib".to_string()), "//a:lib");
        assert_eq!(roundtrip(&BytesCodec, &Vec::new()), Vec::<u8>::new());
        assert_eq!(roundtrip(&BytesCodec, &vec![0, 255, 7]), vec![0, 255, 7]);
    }

    #[test]
    fn test_hash_halves() {
        let hash = Hash128::from_parts(u64::MAX, 0);
        assert_eq!(roundtrip(&Hash128Codec, &hash), hash);

        let ctx = CodecContext::default();
        let bytes = encode_to_bytes(&Hash128Codec, &ctx, &hash).unwrap();
        assert_eq!(bytes.len(), 16);
    }

    #[test]
    fn test_bool_rejects_unknown_tag() {
        let ctx = CodecContext::default();
        assert!(roundtrip(&BoolCodec, &true));
        assert!(matches!(
            decode_from_slice(&BoolCodec, &ctx, &[2]),
            Err(CodecError::InvalidTag { kind: "bool", tag: 2 })
        ));
    }
}
