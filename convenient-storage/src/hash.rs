//! 128-bit content fingerprints.
//!
//! Derived from the first 16 bytes of a SHA-256 digest and kept as two
//! `u64` halves, which is also how they are encoded on disk.

use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// 128-bit fingerprint (two 64-bit halves).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash128 {
    hi: u64,
    lo: u64,
}

impl Hash128 {
    /// Build a hash from its halves.
    #[must_use]
    pub const fn from_parts(hi: u64, lo: u64) -> Self {
        Self { hi, lo }
    }

    /// Fingerprint a byte string.
    #[must_use]
    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = Hash128Builder::new();
        hasher.update(bytes);
        hasher.finish()
    }

    /// High 64 bits.
    #[must_use]
    pub const fn hi(&self) -> u64 {
        self.hi
    }

    /// Low 64 bits.
    #[must_use]
    pub const fn lo(&self) -> u64 {
        self.lo
    }

    /// Lowercase hex, 32 characters.
    #[must_use]
    pub fn to_hex(&self) -> String {
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&self.hi.to_be_bytes());
        bytes[8..].copy_from_slice(&self.lo.to_be_bytes());
        hex::encode(bytes)
    }
}

impl fmt::Display for Hash128 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Error returned when parsing a hex fingerprint fails.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid 128-bit hash: {0}")]
pub struct ParseHashError(String);

impl FromStr for Hash128 {
    type Err = ParseHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 16];
        hex::decode_to_slice(s, &mut bytes).map_err(|_| ParseHashError(s.to_string()))?;
        let mut hi = [0u8; 8];
        let mut lo = [0u8; 8];
        hi.copy_from_slice(&bytes[..8]);
        lo.copy_from_slice(&bytes[8..]);
        Ok(Self::from_parts(u64::from_be_bytes(hi), u64::from_be_bytes(lo)))
    }
}

#[cfg(feature = "serde")]
impl Serialize for Hash128 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

#[cfg(feature = "serde")]
impl<'de> Deserialize<'de> for Hash128 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Incremental builder for a [`Hash128`].
///
/// Each `update_*` call feeds a separator after the field so that adjacent
/// fields cannot run into each other (`"ab" + "c"` differs from `"a" + "bc"`).
#[derive(Debug, Clone, Default)]
pub struct Hash128Builder {
    hasher: Sha256,
}

impl Hash128Builder {
    /// Start an empty hash.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes.
    pub fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    /// Feed a string field followed by a separator.
    pub fn update_str(&mut self, value: &str) {
        self.hasher.update((value.len() as u64).to_le_bytes());
        self.hasher.update(value.as_bytes());
        self.hasher.update(b"|");
    }

    /// Feed another fingerprint.
    pub fn update_hash(&mut self, value: &Hash128) {
        self.hasher.update(value.hi.to_le_bytes());
        self.hasher.update(value.lo.to_le_bytes());
    }

    /// Finalize into a 128-bit fingerprint.
    #[must_use]
    pub fn finish(self) -> Hash128 {
        let digest = self.hasher.finalize();
        let mut hi = [0u8; 8];
        let mut lo = [0u8; 8];
        hi.copy_from_slice(&digest[..8]);
        lo.copy_from_slice(&digest[8..16]);
        Hash128::from_parts(u64::from_be_bytes(hi), u64::from_be_bytes(lo))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_deterministic() {
        assert_eq!(Hash128::of(b"a/BUILD"), Hash128::of(b"a/BUILD"));
        assert_ne!(Hash128::of(b"a/BUILD"), Hash128::of(b"b/BUILD"));
    }

    #[test]
    fn test_hex_roundtrip() {
        let hash = Hash128::of(b"//a:lib");
        let hex = hash.to_hex();
        assert_eq!(hex.len(), 32);
        assert_eq!(hex.parse::<Hash128>().unwrap(), hash);
        assert!("xyz".parse::<Hash128>().is_err());
    }

    #[test]
    fn test_field_separation() {
        let mut left = Hash128Builder::new();
        left.update_str("ab");
        left.update_str("c");
        let mut right = Hash128Builder::new();
        right.update_str("a");
        right.update_str("bc");
        assert_ne!(left.finish(), right.finish());
    }
}
