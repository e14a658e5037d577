// On-disk layout shared by region files and pages:
//
//   magic "GSRG" | u16 format version | u32 entry count
//   then per entry: u32 key len | key | u32 value len | value

use bytes::Bytes;
use std::collections::HashMap;

use crate::codec::{CodecBuffer, CodecError, CodecResult};

const REGION_MAGIC: &[u8; 4] = b"GSRG";

/// Current on-disk format version.
pub(crate) const REGION_FORMAT_VERSION: u16 = 1;

pub(crate) fn encode_entries<'a, I>(len: usize, entries: I) -> CodecResult<Bytes>
where
    I: Iterator<Item = (&'a Bytes, &'a Bytes)>,
{
    let mut buf = CodecBuffer::with_capacity(10 + len * 32);
    buf.write_raw(REGION_MAGIC);
    buf.write_u16(REGION_FORMAT_VERSION);
    buf.write_len(len)?;
    for (key, value) in entries {
        buf.write_bytes(key)?;
        buf.write_bytes(value)?;
    }
    Ok(buf.freeze())
}

pub(crate) fn decode_entries(data: &[u8]) -> CodecResult<HashMap<Bytes, Bytes>> {
    let mut buf = CodecBuffer::from_slice(data);
    let magic = buf.read_raw(REGION_MAGIC.len())?;
    if magic != REGION_MAGIC {
        return Err(CodecError::InvalidValue("bad region magic".to_string()));
    }
    let version = buf.read_u16()?;
    if version != REGION_FORMAT_VERSION {
        return Err(CodecError::UnsupportedVersion {
            expected: REGION_FORMAT_VERSION,
            found: version,
        });
    }
    let len = buf.read_len()?;
    let mut entries = HashMap::with_capacity(len.min(1 << 16));
    for _ in 0..len {
        let key = Bytes::from(buf.read_bytes()?);
        let value = Bytes::from(buf.read_bytes()?);
        let _ = entries.insert(key, value);
    }
    if buf.remaining() != 0 {
        return Err(CodecError::TrailingBytes(buf.remaining()));
    }
    Ok(entries)
}
