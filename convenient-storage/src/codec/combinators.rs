//! Codecs built from other codecs.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::hash::Hash;

use super::{Codec, CodecBuffer, CodecContext, CodecError, CodecResult};

fn encode_seq<'a, C, I>(
    codec: &C,
    ctx: &CodecContext,
    buf: &mut CodecBuffer,
    len: usize,
    items: I,
) -> CodecResult<()>
where
    C: Codec,
    C::Value: 'a,
    I: Iterator<Item = &'a C::Value>,
{
    buf.write_len(len)?;
    for item in items {
        codec.encode(ctx, buf, item)?;
    }
    Ok(())
}

fn decode_seq<C, T>(codec: &C, ctx: &CodecContext, buf: &mut CodecBuffer) -> CodecResult<T>
where
    C: Codec,
    T: FromIterator<C::Value>,
{
    let len = buf.read_len()?;
    (0..len).map(|_| codec.decode(ctx, buf)).collect()
}

/// Length-prefixed `HashSet`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetCodec<C>(C);

impl<C> SetCodec<C> {
    /// Wrap an element codec.
    pub fn new(element: C) -> Self {
        Self(element)
    }
}

impl<C> Codec for SetCodec<C>
where
    C: Codec,
    C::Value: Eq + Hash,
{
    type Value = HashSet<C::Value>;

    fn encode(
        &self,
        ctx: &CodecContext,
        buf: &mut CodecBuffer,
        value: &Self::Value,
    ) -> CodecResult<()> {
        encode_seq(&self.0, ctx, buf, value.len(), value.iter())
    }

    fn decode(&self, ctx: &CodecContext, buf: &mut CodecBuffer) -> CodecResult<Self::Value> {
        decode_seq(&self.0, ctx, buf)
    }
}

/// Length-prefixed `BTreeSet`; encodes in sorted order so equal sets yield equal bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SortedSetCodec<C>(C);

impl<C> SortedSetCodec<C> {
    /// Wrap an element codec.
    pub fn new(element: C) -> Self {
        Self(element)
    }
}

impl<C> Codec for SortedSetCodec<C>
where
    C: Codec,
    C::Value: Ord,
{
    type Value = BTreeSet<C::Value>;

    fn encode(
        &self,
        ctx: &CodecContext,
        buf: &mut CodecBuffer,
        value: &Self::Value,
    ) -> CodecResult<()> {
        encode_seq(&self.0, ctx, buf, value.len(), value.iter())
    }

    fn decode(&self, ctx: &CodecContext, buf: &mut CodecBuffer) -> CodecResult<Self::Value> {
        decode_seq(&self.0, ctx, buf)
    }
}

/// Length-prefixed `Vec`, order preserved.
#[derive(Debug, Clone, Copy, Default)]
pub struct VecCodec<C>(C);

impl<C> VecCodec<C> {
    /// Wrap an element codec.
    pub fn new(element: C) -> Self {
        Self(element)
    }
}

impl<C: Codec> Codec for VecCodec<C> {
    type Value = Vec<C::Value>;

    fn encode(
        &self,
        ctx: &CodecContext,
        buf: &mut CodecBuffer,
        value: &Self::Value,
    ) -> CodecResult<()> {
        encode_seq(&self.0, ctx, buf, value.len(), value.iter())
    }

    fn decode(&self, ctx: &CodecContext, buf: &mut CodecBuffer) -> CodecResult<Self::Value> {
        decode_seq(&self.0, ctx, buf)
    }
}

/// Length-prefixed `BTreeMap` of key/value pairs in key order.
#[derive(Debug, Clone, Copy, Default)]
pub struct SortedMapCodec<KC, VC> {
    key: KC,
    value: VC,
}

impl<KC, VC> SortedMapCodec<KC, VC> {
    /// Combine a key codec and a value codec.
    pub fn new(key: KC, value: VC) -> Self {
        Self { key, value }
    }
}

impl<KC, VC> Codec for SortedMapCodec<KC, VC>
where
    KC: Codec,
    KC::Value: Ord,
    VC: Codec,
{
    type Value = BTreeMap<KC::Value, VC::Value>;

    fn encode(
        &self,
        ctx: &CodecContext,
        buf: &mut CodecBuffer,
        value: &Self::Value,
    ) -> CodecResult<()> {
        buf.write_len(value.len())?;
        for (k, v) in value {
            self.key.encode(ctx, buf, k)?;
            self.value.encode(ctx, buf, v)?;
        }
        Ok(())
    }

    fn decode(&self, ctx: &CodecContext, buf: &mut CodecBuffer) -> CodecResult<Self::Value> {
        let len = buf.read_len()?;
        let mut map = BTreeMap::new();
        for _ in 0..len {
            let k = self.key.decode(ctx, buf)?;
            let v = self.value.decode(ctx, buf)?;
            let _ = map.insert(k, v);
        }
        Ok(map)
    }
}

/// `Option` as a presence byte followed by the value.
#[derive(Debug, Clone, Copy, Default)]
pub struct OptionCodec<C>(C);

impl<C> OptionCodec<C> {
    /// Wrap the codec of the inner value.
    pub fn new(inner: C) -> Self {
        Self(inner)
    }
}

impl<C: Codec> Codec for OptionCodec<C> {
    type Value = Option<C::Value>;

    fn encode(
        &self,
        ctx: &CodecContext,
        buf: &mut CodecBuffer,
        value: &Self::Value,
    ) -> CodecResult<()> {
        match value {
            None => {
                buf.write_u8(0);
                Ok(())
            }
            Some(inner) => {
                buf.write_u8(1);
                self.0.encode(ctx, buf, inner)
            }
        }
    }

    fn decode(&self, ctx: &CodecContext, buf: &mut CodecBuffer) -> CodecResult<Self::Value> {
        match buf.read_u8()? {
            0 => Ok(None),
            1 => self.0.decode(ctx, buf).map(Some),
            tag => Err(CodecError::InvalidTag {
                kind: "option",
                tag,
            }),
        }
    }
}

/// Two values written back to back.
#[derive(Debug, Clone, Copy, Default)]
pub struct PairCodec<A, B>(A, B);

impl<A, B> PairCodec<A, B> {
    /// Combine the codecs of both halves.
    pub fn new(first: A, second: B) -> Self {
        Self(first, second)
    }
}

impl<A: Codec, B: Codec> Codec for PairCodec<A, B> {
    type Value = (A::Value, B::Value);

    fn encode(
        &self,
        ctx: &CodecContext,
        buf: &mut CodecBuffer,
        value: &Self::Value,
    ) -> CodecResult<()> {
        self.0.encode(ctx, buf, &value.0)?;
        self.1.encode(ctx, buf, &value.1)
    }

    fn decode(&self, ctx: &CodecContext, buf: &mut CodecBuffer) -> CodecResult<Self::Value> {
        let first = self.0.decode(ctx, buf)?;
        let second = self.1.decode(ctx, buf)?;
        Ok((first, second))
    }
}

/// Prefixes the inner encoding with a `u16` schema version.
///
/// Decoding rejects any other version, which is how a changed record layout
/// is detected and turned into a full resync instead of garbage.
#[derive(Debug, Clone, Copy)]
pub struct VersionedCodec<C> {
    version: u16,
    inner: C,
}

impl<C> VersionedCodec<C> {
    /// Wrap `inner` under schema `version`.
    pub fn new(version: u16, inner: C) -> Self {
        Self { version, inner }
    }
}

impl<C: Codec> Codec for VersionedCodec<C> {
    type Value = C::Value;

    fn encode(
        &self,
        ctx: &CodecContext,
        buf: &mut CodecBuffer,
        value: &Self::Value,
    ) -> CodecResult<()> {
        buf.write_u16(self.version);
        self.inner.encode(ctx, buf, value)
    }

    fn decode(&self, ctx: &CodecContext, buf: &mut CodecBuffer) -> CodecResult<Self::Value> {
        let found = buf.read_u16()?;
        if found != self.version {
            return Err(CodecError::UnsupportedVersion {
                expected: self.version,
                found,
            });
        }
        self.inner.decode(ctx, buf)
    }
}

type EncodeFn<T> = dyn Fn(&CodecContext, &mut CodecBuffer, &T) -> CodecResult<()> + Send + Sync;
type DecodeFn<T> = dyn Fn(&CodecContext, &mut CodecBuffer) -> CodecResult<T> + Send + Sync;

/// Codec assembled from a pair of closures, for one-off record layouts.
pub struct FnCodec<T> {
    encode: Box<EncodeFn<T>>,
    decode: Box<DecodeFn<T>>,
}

impl<T> FnCodec<T> {
    /// Build a codec from an encode and a decode closure.
    pub fn new<E, D>(encode: E, decode: D) -> Self
    where
        E: Fn(&CodecContext, &mut CodecBuffer, &T) -> CodecResult<()> + Send + Sync + 'static,
        D: Fn(&CodecContext, &mut CodecBuffer) -> CodecResult<T> + Send + Sync + 'static,
    {
        Self {
            encode: Box::new(encode),
            decode: Box::new(decode),
        }
    }
}

impl<T> fmt::Debug for FnCodec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnCodec").finish_non_exhaustive()
    }
}

impl<T> Codec for FnCodec<T> {
    type Value = T;

    fn encode(&self, ctx: &CodecContext, buf: &mut CodecBuffer, value: &T) -> CodecResult<()> {
        (self.encode)(ctx, buf, value)
    }

    fn decode(&self, ctx: &CodecContext, buf: &mut CodecBuffer) -> CodecResult<T> {
        (self.decode)(ctx, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{
        decode_from_slice, encode_to_bytes, Hash128Codec, StringCodec, U32Codec, U64Codec,
    };
    use crate::hash::Hash128;

    fn roundtrip<C: Codec>(codec: &C, value: &C::Value) -> C::Value {
        let ctx = CodecContext::default();
        let bytes = encode_to_bytes(codec, &ctx, value).unwrap();
        decode_from_slice(codec, &ctx, &bytes).unwrap()
    }

    #[test]
    fn test_empty_collections() {
        let set: HashSet<String> = HashSet::new();
        assert_eq!(roundtrip(&SetCodec::new(StringCodec), &set), set);

        let sorted: BTreeSet<u64> = BTreeSet::new();
        assert_eq!(roundtrip(&SortedSetCodec::new(U64Codec), &sorted), sorted);

        let list: Vec<u32> = Vec::new();
        assert_eq!(roundtrip(&VecCodec::new(U32Codec), &list), list);
    }

    #[test]
    fn test_set_is_length_prefixed() {
        let ctx = CodecContext::default();
        let set: HashSet<Hash128> = [Hash128::of(b"a"), Hash128::of(b"b")].into();
        let bytes = encode_to_bytes(&SetCodec::new(Hash128Codec), &ctx, &set).unwrap();

        assert_eq!(bytes.len(), 4 + 2 * 16);
        assert_eq!(&bytes[..4], &2u32.to_le_bytes());
    }

    #[test]
    fn test_sorted_encoding_is_canonical() {
        let ctx = CodecContext::default();
        let codec = SortedMapCodec::new(StringCodec, StringCodec);

        let mut first = BTreeMap::new();
        let _ = first.insert("b".to_string(), "2".to_string());
        let _ = first.insert("a".to_string(), "1".to_string());
        let mut second = BTreeMap::new();
        let _ = second.insert("a".to_string(), "1".to_string());
        let _ = second.insert("b".to_string(), "2".to_string());

        let left = encode_to_bytes(&codec, &ctx, &first).unwrap();
        let right = encode_to_bytes(&codec, &ctx, &second).unwrap();
        assert_eq!(left, right);
        assert_eq!(roundtrip(&codec, &first), first);
    }

    #[test]
    fn test_option_and_pair() {
        let codec = PairCodec::new(OptionCodec::new(StringCodec), U64Codec);
        assert_eq!(roundtrip(&codec, &(None, 0)), (None, 0));
        assert_eq!(
            roundtrip(&codec, &(Some(String::new()), u64::MAX)),
            (Some(String::new()), u64::MAX)
        );
    }

    #[test]
    fn test_version_mismatch() {
        let ctx = CodecContext::default();
        let v1 = VersionedCodec::new(1, StringCodec);
        let v2 = VersionedCodec::new(2, StringCodec);

        let bytes = encode_to_bytes(&v1, &ctx, &"x".to_string()).unwrap();
        assert_eq!(decode_from_slice(&v1, &ctx, &bytes).unwrap(), "x");
        assert_eq!(
            decode_from_slice(&v2, &ctx, &bytes).unwrap_err(),
            CodecError::UnsupportedVersion {
                expected: 2,
                found: 1
            }
        );
    }

    #[test]
    fn test_fn_codec() {
        let codec = FnCodec::new(
            |ctx, buf, value: &(String, u32)| {
                StringCodec.encode(ctx, buf, &value.0)?;
                U32Codec.encode(ctx, buf, &value.1)
            },
            |ctx, buf| Ok((StringCodec.decode(ctx, buf)?, U32Codec.decode(ctx, buf)?)),
        );
        let value = ("BUILD".to_string(), 7);
        assert_eq!(roundtrip(&codec, &value), value);
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let ctx = CodecContext::default();
        assert_eq!(
            decode_from_slice(&U32Codec, &ctx, &[0, 0, 0, 0, 9]).unwrap_err(),
            CodecError::TrailingBytes(1)
        );
    }
}
