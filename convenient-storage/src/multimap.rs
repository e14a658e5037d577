use std::collections::HashSet;
use std::hash::Hash;

use crate::codec::{Codec, SetCodec};
use crate::kv::{KvStore, StoreIter};
use crate::region::RegionBackend;
use crate::StorageResult;

/// Key to set-of-values store.
///
/// Single-element updates go through [`KvStore::compute`]; a key whose set
/// becomes empty is removed, so absence and the empty set are the same.
#[derive(Debug)]
pub struct KvMultiSetMap<K, V> {
    store: KvStore<K, HashSet<V>>,
}

impl<K, V> Clone for KvMultiSetMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<K, V> KvMultiSetMap<K, V>
where
    K: 'static,
    V: Eq + Hash + 'static,
{
    /// Wrap a region backend; sets are encoded with [`SetCodec`].
    pub fn from_backend<KC, VC>(backend: Box<dyn RegionBackend>, key_codec: KC, value_codec: VC) -> Self
    where
        KC: Codec<Value = K> + 'static,
        VC: Codec<Value = V> + 'static,
    {
        Self {
            store: KvStore::from_backend(backend, key_codec, SetCodec::new(value_codec)),
        }
    }

    /// Keys with a non-empty set.
    #[must_use]
    pub fn keys(&self) -> StoreIter<K> {
        self.store.keys()
    }

    /// Key/set pairs.
    #[must_use]
    pub fn entries(&self) -> StoreIter<(K, HashSet<V>)> {
        self.store.entries()
    }
}

impl<K, V> KvMultiSetMap<K, V>
where
    V: Eq + Hash,
{
    /// Values recorded under `key`; empty if none.
    ///
    /// # Errors
    ///
    /// Returns a `StorageError` if the set cannot be read.
    pub fn get(&self, key: &K) -> StorageResult<HashSet<V>> {
        Ok(self.store.get(key)?.unwrap_or_default())
    }

    /// Add `value` to the set under `key`. Returns whether it was new.
    ///
    /// # Errors
    ///
    /// Returns a `StorageError` if the set cannot be updated.
    pub fn put(&self, key: &K, value: V) -> StorageResult<bool> {
        let mut inserted = false;
        let _ = self.store.compute(key, |_, current| {
            let mut set = current.unwrap_or_default();
            inserted = set.insert(value);
            Some(set)
        })?;
        Ok(inserted)
    }

    /// Remove `value` from the set under `key`. Returns whether it was present.
    ///
    /// # Errors
    ///
    /// Returns a `StorageError` if the set cannot be updated.
    pub fn remove(&self, key: &K, value: &V) -> StorageResult<bool> {
        let mut removed = false;
        let _ = self.store.compute(key, |_, current| {
            let mut set = current?;
            removed = set.remove(value);
            (!set.is_empty()).then_some(set)
        })?;
        Ok(removed)
    }

    /// Drop the whole set under `key`.
    ///
    /// # Errors
    ///
    /// Returns a `StorageError` if the region cannot be updated.
    pub fn remove_all(&self, key: &K) -> StorageResult<()> {
        let _ = self.store.remove(key, false)?;
        Ok(())
    }

    /// Whether `value` is in the set under `key`.
    ///
    /// # Errors
    ///
    /// Returns a `StorageError` if the set cannot be read.
    pub fn contains(&self, key: &K, value: &V) -> StorageResult<bool> {
        Ok(self.store.get(key)?.is_some_and(|set| set.contains(value)))
    }

    /// Remove every key.
    ///
    /// # Errors
    ///
    /// Returns a `StorageError` if the region cannot be cleared.
    pub fn clear(&self) -> StorageResult<()> {
        self.store.clear()
    }

    /// Number of keys.
    ///
    /// # Errors
    ///
    /// Returns a `StorageError` if the region cannot be read.
    pub fn len(&self) -> StorageResult<usize> {
        self.store.len()
    }

    /// Whether no key has a value.
    ///
    /// # Errors
    ///
    /// Returns a `StorageError` if the region cannot be read.
    pub fn is_empty(&self) -> StorageResult<bool> {
        self.store.is_empty()
    }

    /// Underlying typed store.
    #[must_use]
    pub fn as_store(&self) -> &KvStore<K, HashSet<V>> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{StringCodec, U32Codec};
    use crate::region::{InMemoryRegion, PagedRegion};

    fn maps() -> Vec<KvMultiSetMap<u32, String>> {
        vec![
            KvMultiSetMap::from_backend(Box::new(InMemoryRegion::ephemeral("m")), U32Codec, StringCodec),
            KvMultiSetMap::from_backend(Box::new(PagedRegion::ephemeral("p", 3)), U32Codec, StringCodec),
        ]
    }

    #[test]
    fn test_put_and_remove_single_elements() {
        for map in maps() {
            assert!(map.put(&1, "a".to_string()).unwrap());
            assert!(!map.put(&1, "a".to_string()).unwrap());
            assert!(map.put(&1, "b".to_string()).unwrap());
            assert_eq!(map.get(&1).unwrap().len(), 2);
            assert!(map.contains(&1, &"b".to_string()).unwrap());

            assert!(map.remove(&1, &"a".to_string()).unwrap());
            assert!(!map.remove(&1, &"a".to_string()).unwrap());
            assert_eq!(map.len().unwrap(), 1);
        }
    }

    #[test]
    fn test_empty_set_collapses_to_absence() {
        for map in maps() {
            let _ = map.put(&7, "only".to_string()).unwrap();
            assert!(map.remove(&7, &"only".to_string()).unwrap());
            assert!(!map.as_store().contains(&7).unwrap());
            assert!(map.get(&7).unwrap().is_empty());
            assert!(map.is_empty().unwrap());

            assert!(!map.remove(&8, &"missing".to_string()).unwrap());
            assert!(!map.as_store().contains(&8).unwrap());
        }
    }
}
