//! Typed key/value stores over byte-level regions.

use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

use crate::codec::{decode_from_slice, encode_to_bytes, Codec, CodecContext};
use crate::region::{InMemoryRegion, RawEntry, RegionBackend};
use crate::{StorageError, StorageResult};

pub(crate) type SharedBackend = Arc<Mutex<Box<dyn RegionBackend>>>;

/// Typed key/value store.
///
/// Cloning yields another handle to the same region. Every call takes the
/// region lock for its own duration only, so iteration never holds the
/// lock across chunks.
pub struct KvStore<K, V> {
    name: Arc<str>,
    ctx: CodecContext,
    backend: SharedBackend,
    key_codec: Arc<dyn Codec<Value = K>>,
    value_codec: Arc<dyn Codec<Value = V>>,
}

impl<K, V> Clone for KvStore<K, V> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            ctx: self.ctx,
            backend: Arc::clone(&self.backend),
            key_codec: Arc::clone(&self.key_codec),
            value_codec: Arc::clone(&self.value_codec),
        }
    }
}

impl<K, V> fmt::Debug for KvStore<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KvStore").field("name", &self.name).finish_non_exhaustive()
    }
}

impl<K: 'static, V: 'static> KvStore<K, V> {
    /// Wrap a region backend with the given codecs.
    pub fn from_backend<KC, VC>(backend: Box<dyn RegionBackend>, key_codec: KC, value_codec: VC) -> Self
    where
        KC: Codec<Value = K> + 'static,
        VC: Codec<Value = V> + 'static,
    {
        let name: Arc<str> = Arc::from(backend.name());
        Self {
            name,
            ctx: CodecContext::default(),
            backend: Arc::new(Mutex::new(backend)),
            key_codec: Arc::new(key_codec),
            value_codec: Arc::new(value_codec),
        }
    }

    /// Store that is never persisted.
    pub fn ephemeral<KC, VC>(name: &str, key_codec: KC, value_codec: VC) -> Self
    where
        KC: Codec<Value = K> + 'static,
        VC: Codec<Value = V> + 'static,
    {
        Self::from_backend(Box::new(InMemoryRegion::ephemeral(name)), key_codec, value_codec)
    }
}

impl<K, V> KvStore<K, V> {
    /// Region name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn shared_backend(&self) -> SharedBackend {
        Arc::clone(&self.backend)
    }

    fn encode_key(&self, key: &K) -> StorageResult<Bytes> {
        encode_to_bytes(&*self.key_codec, &self.ctx, key).map_err(|e| StorageError::codec(&self.name, e))
    }

    fn encode_value(&self, value: &V) -> StorageResult<Bytes> {
        encode_to_bytes(&*self.value_codec, &self.ctx, value)
            .map_err(|e| StorageError::codec(&self.name, e))
    }

    fn decode_value(&self, bytes: &[u8]) -> StorageResult<V> {
        decode_from_slice(&*self.value_codec, &self.ctx, bytes)
            .map_err(|e| StorageError::codec(&self.name, e))
    }

    /// Point lookup. Absence is not an error.
    ///
    /// # Errors
    ///
    /// Returns a `StorageError` if the region cannot be read or the stored
    /// value fails to decode.
    pub fn get(&self, key: &K) -> StorageResult<Option<V>> {
        let key = self.encode_key(key)?;
        let raw = self.backend.lock().get(&key)?;
        raw.map(|bytes| self.decode_value(&bytes)).transpose()
    }

    /// Insert or replace.
    ///
    /// # Errors
    ///
    /// Returns a `StorageError` if encoding or the region write fails.
    pub fn put(&self, key: &K, value: &V) -> StorageResult<()> {
        let key = self.encode_key(key)?;
        let value = self.encode_value(value)?;
        self.backend.lock().put(key, value)
    }

    /// Presence check.
    ///
    /// # Errors
    ///
    /// Returns a `StorageError` if the region cannot be read.
    pub fn contains(&self, key: &K) -> StorageResult<bool> {
        let key = self.encode_key(key)?;
        self.backend.lock().contains(&key)
    }

    /// Delete `key`.
    ///
    /// The previous value is decoded and returned only when
    /// `return_previous` is set.
    ///
    /// # Errors
    ///
    /// Returns a `StorageError` if the region cannot be updated or the
    /// requested previous value fails to decode.
    pub fn remove(&self, key: &K, return_previous: bool) -> StorageResult<Option<V>> {
        let key = self.encode_key(key)?;
        let previous = self.backend.lock().remove(&key)?;
        match previous {
            Some(bytes) if return_previous => self.decode_value(&bytes).map(Some),
            _ => Ok(None),
        }
    }

    /// Atomic read-modify-write.
    ///
    /// `f` receives the current value (if any) and returns the new one;
    /// `None` deletes the key. The region lock is held for the whole call.
    /// Returns the value now stored.
    ///
    /// # Errors
    ///
    /// Returns a `StorageError` if the current value cannot be read or the
    /// new one cannot be written. The store is unchanged on error.
    pub fn compute<F>(&self, key: &K, f: F) -> StorageResult<Option<V>>
    where
        F: FnOnce(&K, Option<V>) -> Option<V>,
    {
        let encoded_key = self.encode_key(key)?;
        let mut backend = self.backend.lock();
        let current = backend
            .get(&encoded_key)?
            .map(|bytes| self.decode_value(&bytes))
            .transpose()?;
        match f(key, current) {
            Some(value) => {
                let encoded = self.encode_value(&value)?;
                backend.put(encoded_key, encoded)?;
                Ok(Some(value))
            }
            None => {
                let _ = backend.remove(&encoded_key)?;
                Ok(None)
            }
        }
    }

    /// Number of entries.
    ///
    /// # Errors
    ///
    /// Returns a `StorageError` if the region cannot be read.
    pub fn len(&self) -> StorageResult<usize> {
        self.backend.lock().len()
    }

    /// Whether the store has no entries.
    ///
    /// # Errors
    ///
    /// Returns a `StorageError` if the region cannot be read.
    pub fn is_empty(&self) -> StorageResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Remove every entry.
    ///
    /// # Errors
    ///
    /// Returns a `StorageError` if the region cannot be cleared.
    pub fn clear(&self) -> StorageResult<()> {
        self.backend.lock().clear()
    }

    /// Persist pending changes.
    ///
    /// # Errors
    ///
    /// Returns a `StorageError` if writing fails.
    pub fn flush(&self) -> StorageResult<()> {
        self.backend.lock().flush()
    }

    fn raw_chunks(&self) -> RawChunks {
        let chunk_count = self.backend.lock().chunk_count();
        RawChunks {
            backend: Arc::clone(&self.backend),
            next_chunk: 0,
            chunk_count,
            current: Vec::new().into_iter(),
        }
    }
}

impl<K: 'static, V: 'static> KvStore<K, V> {
    /// Lazily decoded keys. Values are never decoded.
    #[must_use]
    pub fn keys(&self) -> StoreIter<K> {
        let codec = Arc::clone(&self.key_codec);
        let name = Arc::clone(&self.name);
        let ctx = self.ctx;
        StoreIter::new(self.raw_chunks(), move |(key, _)| {
            decode_from_slice(&*codec, &ctx, &key).map_err(|e| StorageError::codec(&name, e))
        })
    }

    /// Lazily decoded values.
    #[must_use]
    pub fn values(&self) -> StoreIter<V> {
        let codec = Arc::clone(&self.value_codec);
        let name = Arc::clone(&self.name);
        let ctx = self.ctx;
        StoreIter::new(self.raw_chunks(), move |(_, value)| {
            decode_from_slice(&*codec, &ctx, &value).map_err(|e| StorageError::codec(&name, e))
        })
    }

    /// Lazily decoded key/value pairs.
    #[must_use]
    pub fn entries(&self) -> StoreIter<(K, V)> {
        let key_codec = Arc::clone(&self.key_codec);
        let value_codec = Arc::clone(&self.value_codec);
        let name = Arc::clone(&self.name);
        let ctx = self.ctx;
        StoreIter::new(self.raw_chunks(), move |(key, value)| {
            let key = decode_from_slice(&*key_codec, &ctx, &key)
                .map_err(|e| StorageError::codec(&name, e))?;
            let value = decode_from_slice(&*value_codec, &ctx, &value)
                .map_err(|e| StorageError::codec(&name, e))?;
            Ok((key, value))
        })
    }
}

// Walks a region chunk by chunk, taking the lock once per chunk.
struct RawChunks {
    backend: SharedBackend,
    next_chunk: usize,
    chunk_count: usize,
    current: std::vec::IntoIter<RawEntry>,
}

impl Iterator for RawChunks {
    type Item = StorageResult<RawEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entry) = self.current.next() {
                return Some(Ok(entry));
            }
            if self.next_chunk >= self.chunk_count {
                return None;
            }
            let index = self.next_chunk;
            self.next_chunk += 1;
            match self.backend.lock().chunk(index) {
                Ok(chunk) => self.current = chunk.into_iter(),
                Err(e) => {
                    self.next_chunk = self.chunk_count;
                    return Some(Err(e));
                }
            }
        }
    }
}

type DecodeFn<T> = Box<dyn FnMut(RawEntry) -> StorageResult<T> + Send>;

/// Lazy iterator over a store.
///
/// No stable snapshot is promised across concurrent mutation: each chunk is
/// copied out when reached. Iteration ends after the first error.
pub struct StoreIter<T> {
    raw: RawChunks,
    decode: DecodeFn<T>,
}

impl<T> StoreIter<T> {
    fn new<F>(raw: RawChunks, decode: F) -> Self
    where
        F: FnMut(RawEntry) -> StorageResult<T> + Send + 'static,
    {
        Self {
            raw,
            decode: Box::new(decode),
        }
    }
}

impl<T> fmt::Debug for StoreIter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreIter")
            .field("next_chunk", &self.raw.next_chunk)
            .field("chunk_count", &self.raw.chunk_count)
            .finish_non_exhaustive()
    }
}

impl<T> Iterator for StoreIter<T> {
    type Item = StorageResult<T>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.raw.next()? {
            Ok(entry) => Some((self.decode)(entry)),
            Err(e) => Some(Err(e)),
        }
    }
}
