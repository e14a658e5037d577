use bytes::Bytes;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::debug;

use super::{atomic_write, decode_entries, encode_entries, read_optional, RawEntry, RegionBackend};
use crate::{StorageError, StorageResult};

/// Region held fully in memory, persisted as a single file.
#[derive(Debug)]
pub struct InMemoryRegion {
    name: String,
    path: Option<PathBuf>,
    entries: HashMap<Bytes, Bytes>,
    dirty: bool,
}

impl InMemoryRegion {
    /// Create a region that is never written to disk.
    #[must_use]
    pub fn ephemeral(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: None,
            entries: HashMap::new(),
            dirty: false,
        }
    }

    /// Open a region backed by `path`, loading it if the file exists.
    ///
    /// # Errors
    ///
    /// - `StorageError::Io` if the file cannot be read
    /// - `StorageError::Corrupted` if its contents cannot be decoded
    pub fn open(name: impl Into<String>, path: PathBuf) -> StorageResult<Self> {
        let name = name.into();
        let entries = match read_optional(&path).map_err(|e| StorageError::io(&name, e))? {
            Some(data) => {
                decode_entries(&data).map_err(|e| StorageError::corrupted(&name, e))?
            }
            None => HashMap::new(),
        };
        debug!("Opened region '{}' with {} entries", name, entries.len());
        Ok(Self {
            name,
            path: Some(path),
            entries,
            dirty: false,
        })
    }
}

impl RegionBackend for InMemoryRegion {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&mut self, key: &[u8]) -> StorageResult<Option<Bytes>> {
        Ok(self.entries.get(key).cloned())
    }

    fn contains(&mut self, key: &[u8]) -> StorageResult<bool> {
        Ok(self.entries.contains_key(key))
    }

    fn put(&mut self, key: Bytes, value: Bytes) -> StorageResult<()> {
        let _ = self.entries.insert(key, value);
        self.dirty = true;
        Ok(())
    }

    fn remove(&mut self, key: &[u8]) -> StorageResult<Option<Bytes>> {
        let previous = self.entries.remove(key);
        if previous.is_some() {
            self.dirty = true;
        }
        Ok(previous)
    }

    fn clear(&mut self) -> StorageResult<()> {
        self.entries.clear();
        self.dirty = true;
        Ok(())
    }

    fn chunk_count(&self) -> usize {
        1
    }

    fn chunk(&mut self, index: usize) -> StorageResult<Vec<RawEntry>> {
        if index != 0 {
            return Ok(Vec::new());
        }
        Ok(self
            .entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn len(&mut self) -> StorageResult<usize> {
        Ok(self.entries.len())
    }

    fn flush(&mut self) -> StorageResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if !self.dirty {
            return Ok(());
        }
        let data = encode_entries(self.entries.len(), self.entries.iter())
            .map_err(|e| StorageError::codec(&self.name, e))?;
        atomic_write(path, &data).map_err(|e| StorageError::io(&self.name, e))?;
        self.dirty = false;
        debug!("Flushed region '{}' ({} entries)", self.name, self.entries.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_persist_and_reload() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("targets.kv");

        let mut region = InMemoryRegion::open("targets", path.clone()).unwrap();
        region
            .put(Bytes::from_static(b"a"), Bytes::from_static(b"1"))
            .unwrap();
        region
            .put(Bytes::from_static(b"b"), Bytes::from_static(b"2"))
            .unwrap();
        let _ = region.remove(b"b").unwrap();
        region.flush().unwrap();
        assert!(path.exists());

        let mut reopened = InMemoryRegion::open("targets", path).unwrap();
        assert_eq!(reopened.len().unwrap(), 1);
        assert_eq!(
            reopened.get(b"a").unwrap(),
            Some(Bytes::from_static(b"1"))
        );
        assert!(!reopened.contains(b"b").unwrap());
    }

    #[test]
    fn test_corrupted_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("broken.kv");
        std::fs::write(&path, b"not a region").unwrap();

        let err = InMemoryRegion::open("broken", path).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_ephemeral_flush_is_noop() {
        let mut region = InMemoryRegion::ephemeral("scratch");
        region
            .put(Bytes::from_static(b"k"), Bytes::from_static(b"v"))
            .unwrap();
        region.flush().unwrap();
        assert_eq!(region.len().unwrap(), 1);
    }
}
