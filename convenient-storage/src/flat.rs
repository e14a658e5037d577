use std::fmt;
use std::sync::Arc;

use crate::codec::{Codec, CodecBuffer, CodecContext, CodecResult};
use crate::kv::{KvStore, SharedBackend};
use crate::region::RegionBackend;
use crate::StorageResult;

type Creator<V> = Arc<dyn Fn() -> V + Send + Sync>;

/// Single persisted value with a default supplied by a creator function.
///
/// Until the first `set` or `modify`, reads return a freshly created value
/// and nothing is stored.
pub struct FlatStorage<V> {
    store: KvStore<(), V>,
    creator: Creator<V>,
}

impl<V> Clone for FlatStorage<V> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            creator: Arc::clone(&self.creator),
        }
    }
}

impl<V> fmt::Debug for FlatStorage<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlatStorage")
            .field("name", &self.store.name())
            .finish_non_exhaustive()
    }
}

// The single slot is stored under an empty key.
struct UnitCodec;

impl Codec for UnitCodec {
    type Value = ();

    fn encode(&self, _ctx: &CodecContext, _buf: &mut CodecBuffer, _value: &()) -> CodecResult<()> {
        Ok(())
    }

    fn decode(&self, _ctx: &CodecContext, _buf: &mut CodecBuffer) -> CodecResult<()> {
        Ok(())
    }
}

impl<V: 'static> FlatStorage<V> {
    /// Wrap a region backend.
    pub fn from_backend<C, F>(backend: Box<dyn RegionBackend>, codec: C, creator: F) -> Self
    where
        C: Codec<Value = V> + 'static,
        F: Fn() -> V + Send + Sync + 'static,
    {
        Self {
            store: KvStore::from_backend(backend, UnitCodec, codec),
            creator: Arc::new(creator),
        }
    }

    pub(crate) fn shared_backend(&self) -> SharedBackend {
        self.store.shared_backend()
    }

    /// Current value, or a fresh one from the creator.
    ///
    /// # Errors
    ///
    /// Returns a `StorageError` if the stored value cannot be read.
    pub fn get(&self) -> StorageResult<V> {
        Ok(self.store.get(&())?.unwrap_or_else(|| (self.creator)()))
    }

    /// Replace the value.
    ///
    /// # Errors
    ///
    /// Returns a `StorageError` if the value cannot be written.
    pub fn set(&self, value: &V) -> StorageResult<()> {
        self.store.put(&(), value)
    }

    /// Atomically transform the value, returning the result.
    ///
    /// # Errors
    ///
    /// Returns a `StorageError` if the value cannot be read or written.
    pub fn modify<F>(&self, f: F) -> StorageResult<V>
    where
        F: FnOnce(V) -> V,
    {
        let updated = self
            .store
            .compute(&(), |_, current| Some(f(current.unwrap_or_else(|| (self.creator)()))))?;
        Ok(updated.unwrap_or_else(|| (self.creator)()))
    }

    /// Whether a value has been stored.
    ///
    /// # Errors
    ///
    /// Returns a `StorageError` if the region cannot be read.
    pub fn is_set(&self) -> StorageResult<bool> {
        self.store.contains(&())
    }

    /// Drop the stored value; the next read returns a fresh one.
    ///
    /// # Errors
    ///
    /// Returns a `StorageError` if the region cannot be updated.
    pub fn reset(&self) -> StorageResult<()> {
        self.store.clear()
    }

    /// Persist pending changes.
    ///
    /// # Errors
    ///
    /// Returns a `StorageError` if writing fails.
    pub fn flush(&self) -> StorageResult<()> {
        self.store.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{StringCodec, VecCodec};
    use crate::region::InMemoryRegion;
    use tempfile::TempDir;

    #[test]
    fn test_creator_supplies_default() {
        let flat = FlatStorage::from_backend(
            Box::new(InMemoryRegion::ephemeral("state")),
            StringCodec,
            || "initial".to_string(),
        );
        assert_eq!(flat.get().unwrap(), "initial");
        assert!(!flat.is_set().unwrap());

        flat.set(&"next".to_string()).unwrap();
        assert_eq!(flat.get().unwrap(), "next");

        flat.reset().unwrap();
        assert_eq!(flat.get().unwrap(), "initial");
    }

    #[test]
    fn test_modify_starts_from_creator() {
        let flat = FlatStorage::from_backend(
            Box::new(InMemoryRegion::ephemeral("list")),
            VecCodec::new(StringCodec),
            Vec::new,
        );
        let value = flat
            .modify(|mut v| {
                v.push("a".to_string());
                v
            })
            .unwrap();
        assert_eq!(value, vec!["a".to_string()]);
        let value = flat
            .modify(|mut v| {
                v.push("b".to_string());
                v
            })
            .unwrap();
        assert_eq!(value.len(), 2);
    }

    #[test]
    fn test_persisted_across_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state.kv");

        let flat = FlatStorage::from_backend(
            Box::new(InMemoryRegion::open("state", path.clone()).unwrap()),
            StringCodec,
            String::new,
        );
        flat.set(&"kept".to_string()).unwrap();
        flat.flush().unwrap();

        let reopened = FlatStorage::from_backend(
            Box::new(InMemoryRegion::open("state", path).unwrap()),
            StringCodec,
            String::new,
        );
        assert_eq!(reopened.get().unwrap(), "kept");
    }
}
