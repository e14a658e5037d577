use bytes::Bytes;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::{atomic_write, decode_entries, encode_entries, read_optional, RawEntry, RegionBackend};
use crate::hash::Hash128;
use crate::{StorageError, StorageResult};

const META_FILE: &str = "meta";
const META_PAGE_COUNT: &[u8] = b"page_count";

type Page = HashMap<Bytes, Bytes>;

/// Region split into hash-addressed pages that load on first access.
///
/// The page of a key is `Hash128::of(key).lo() % page_count`. The page count
/// is fixed when the region is first created and recorded in a `meta` file;
/// on reopen the stored count wins over the requested one.
#[derive(Debug)]
pub struct PagedRegion {
    name: String,
    dir: Option<PathBuf>,
    pages: Vec<Option<Page>>,
    dirty: Vec<bool>,
    meta_written: bool,
}

impl PagedRegion {
    /// Create a paged region that lives only in memory.
    #[must_use]
    pub fn ephemeral(name: impl Into<String>, page_count: usize) -> Self {
        let page_count = page_count.max(1);
        Self {
            name: name.into(),
            dir: None,
            pages: (0..page_count).map(|_| Some(Page::new())).collect(),
            dirty: vec![false; page_count],
            meta_written: true,
        }
    }

    /// Open a paged region stored under `dir`.
    ///
    /// No page is read here; pages load when first touched.
    ///
    /// # Errors
    ///
    /// - `StorageError::Io` if the meta file cannot be read
    /// - `StorageError::Corrupted` if the meta file is malformed
    pub fn open(name: impl Into<String>, dir: PathBuf, page_count: usize) -> StorageResult<Self> {
        let name = name.into();
        let meta_path = dir.join(META_FILE);
        let (page_count, meta_written) =
            match read_optional(&meta_path).map_err(|e| StorageError::io(&name, e))? {
                Some(data) => (read_page_count(&name, &data)?, true),
                None => (page_count.max(1), false),
            };
        debug!("Opened paged region '{}' with {} pages", name, page_count);
        Ok(Self {
            name,
            dir: Some(dir),
            pages: vec![None; page_count],
            dirty: vec![false; page_count],
            meta_written,
        })
    }

    /// Number of pages.
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    fn page_index(&self, key: &[u8]) -> usize {
        let count = self.pages.len() as u64;
        // Remainder is below `count`, which came from a usize.
        #[allow(clippy::cast_possible_truncation)]
        let index = (Hash128::of(key).lo() % count) as usize;
        index
    }

    fn page_path(dir: &Path, index: usize) -> PathBuf {
        dir.join(format!("page-{index:04}.bin"))
    }

    fn page_mut(&mut self, index: usize) -> StorageResult<&mut Page> {
        if self.pages[index].is_none() {
            let loaded = self.read_page(index)?;
            self.pages[index] = Some(loaded);
        }
        Ok(self.pages[index].get_or_insert_with(Page::new))
    }

    fn read_page(&self, index: usize) -> StorageResult<Page> {
        let Some(dir) = &self.dir else {
            return Ok(Page::new());
        };
        let path = Self::page_path(dir, index);
        match read_optional(&path).map_err(|e| StorageError::io(&self.name, e))? {
            Some(data) => {
                let page = decode_entries(&data).map_err(|e| StorageError::corrupted(&self.name, e))?;
                debug!(
                    "Loaded page {} of region '{}' ({} entries)",
                    index,
                    self.name,
                    page.len()
                );
                Ok(page)
            }
            None => Ok(Page::new()),
        }
    }

    fn write_meta(&self, dir: &Path) -> StorageResult<()> {
        let count = u32::try_from(self.pages.len())
            .map_err(|_| StorageError::corrupted(&self.name, "page count exceeds u32"))?;
        let mut meta = Page::new();
        let _ = meta.insert(
            Bytes::from_static(META_PAGE_COUNT),
            Bytes::copy_from_slice(&count.to_le_bytes()),
        );
        let data = encode_entries(meta.len(), meta.iter())
            .map_err(|e| StorageError::codec(&self.name, e))?;
        atomic_write(&dir.join(META_FILE), &data).map_err(|e| StorageError::io(&self.name, e))
    }
}

fn read_page_count(name: &str, data: &[u8]) -> StorageResult<usize> {
    let meta = decode_entries(data).map_err(|e| StorageError::corrupted(name, e))?;
    let raw = meta
        .get(META_PAGE_COUNT)
        .ok_or_else(|| StorageError::corrupted(name, "meta has no page count"))?;
    let bytes: [u8; 4] = raw
        .as_ref()
        .try_into()
        .map_err(|_| StorageError::corrupted(name, "malformed page count"))?;
    match u32::from_le_bytes(bytes) {
        0 => Err(StorageError::corrupted(name, "page count is zero")),
        count => Ok(count as usize),
    }
}

impl RegionBackend for PagedRegion {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&mut self, key: &[u8]) -> StorageResult<Option<Bytes>> {
        let index = self.page_index(key);
        Ok(self.page_mut(index)?.get(key).cloned())
    }

    fn put(&mut self, key: Bytes, value: Bytes) -> StorageResult<()> {
        let index = self.page_index(&key);
        let _ = self.page_mut(index)?.insert(key, value);
        self.dirty[index] = true;
        Ok(())
    }

    fn remove(&mut self, key: &[u8]) -> StorageResult<Option<Bytes>> {
        let index = self.page_index(key);
        let previous = self.page_mut(index)?.remove(key);
        if previous.is_some() {
            self.dirty[index] = true;
        }
        Ok(previous)
    }

    fn clear(&mut self) -> StorageResult<()> {
        for (page, dirty) in self.pages.iter_mut().zip(self.dirty.iter_mut()) {
            *page = Some(Page::new());
            *dirty = true;
        }
        Ok(())
    }

    fn chunk_count(&self) -> usize {
        self.pages.len()
    }

    fn chunk(&mut self, index: usize) -> StorageResult<Vec<RawEntry>> {
        if index >= self.pages.len() {
            return Ok(Vec::new());
        }
        // Pages not yet resident are read without being cached, so a full
        // scan holds one page at a time.
        match &self.pages[index] {
            Some(page) => Ok(page.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
            None => Ok(self.read_page(index)?.into_iter().collect()),
        }
    }

    fn len(&mut self) -> StorageResult<usize> {
        let mut total = 0;
        for index in 0..self.pages.len() {
            total += match &self.pages[index] {
                Some(page) => page.len(),
                None => self.read_page(index)?.len(),
            };
        }
        Ok(total)
    }

    fn flush(&mut self) -> StorageResult<()> {
        let Some(dir) = self.dir.clone() else {
            return Ok(());
        };
        if !self.meta_written {
            self.write_meta(&dir)?;
            self.meta_written = true;
        }

        let mut written = 0usize;
        for index in 0..self.pages.len() {
            if !self.dirty[index] {
                continue;
            }
            let Some(page) = &self.pages[index] else {
                continue;
            };
            let path = Self::page_path(&dir, index);
            if page.is_empty() {
                if let Err(e) = fs::remove_file(&path)
                    && e.kind() != std::io::ErrorKind::NotFound
                {
                    warn!("Failed to remove empty page {}: {}", path.display(), e);
                }
            } else {
                let data = encode_entries(page.len(), page.iter())
                    .map_err(|e| StorageError::codec(&self.name, e))?;
                atomic_write(&path, &data).map_err(|e| StorageError::io(&self.name, e))?;
            }
            self.dirty[index] = false;
            written += 1;
        }
        if written > 0 {
            debug!("Flushed {} pages of region '{}'", written, self.name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn key(i: usize) -> Bytes {
        Bytes::from(format!("key-{i}"))
    }

    #[test]
    fn test_pages_load_lazily() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("graph.pages");

        let mut region = PagedRegion::open("graph", dir.clone(), 8).unwrap();
        for i in 0..50 {
            region.put(key(i), Bytes::from(vec![1u8; i])).unwrap();
        }
        region.flush().unwrap();

        let mut reopened = PagedRegion::open("graph", dir, 8).unwrap();
        assert!(reopened.pages.iter().all(Option::is_none));
        assert_eq!(reopened.get(&key(7)).unwrap(), Some(Bytes::from(vec![1u8; 7])));
        assert_eq!(reopened.pages.iter().filter(|p| p.is_some()).count(), 1);
        assert_eq!(reopened.len().unwrap(), 50);
    }

    #[test]
    fn test_scan_does_not_keep_pages_resident() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("scan.pages");

        let mut region = PagedRegion::open("scan", dir.clone(), 8).unwrap();
        for i in 0..50 {
            region.put(key(i), Bytes::from_static(b"v")).unwrap();
        }
        region.flush().unwrap();

        let mut reopened = PagedRegion::open("scan", dir, 8).unwrap();
        reopened.put(key(3), Bytes::from_static(b"changed")).unwrap();
        let mut scanned = Vec::new();
        for index in 0..reopened.chunk_count() {
            scanned.extend(reopened.chunk(index).unwrap());
        }
        assert_eq!(scanned.len(), 50);
        assert!(scanned.contains(&(key(3), Bytes::from_static(b"changed"))));
        assert_eq!(reopened.len().unwrap(), 50);
        assert_eq!(reopened.pages.iter().filter(|p| p.is_some()).count(), 1);
    }

    #[test]
    fn test_stored_page_count_wins() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("r.pages");

        let mut region = PagedRegion::open("r", dir.clone(), 4).unwrap();
        region.put(key(1), Bytes::from_static(b"v")).unwrap();
        region.flush().unwrap();

        let mut reopened = PagedRegion::open("r", dir, 64).unwrap();
        assert_eq!(reopened.page_count(), 4);
        assert_eq!(reopened.get(&key(1)).unwrap(), Some(Bytes::from_static(b"v")));
    }

    #[test]
    fn test_clear_removes_pages() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("c.pages");

        let mut region = PagedRegion::open("c", dir.clone(), 2).unwrap();
        region.put(key(1), Bytes::from_static(b"v")).unwrap();
        region.flush().unwrap();
        region.clear().unwrap();
        region.flush().unwrap();

        let mut reopened = PagedRegion::open("c", dir, 2).unwrap();
        assert_eq!(reopened.len().unwrap(), 0);
    }

    #[test]
    fn test_corrupted_page_reported_on_access() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("p.pages");

        let mut region = PagedRegion::open("p", dir.clone(), 1).unwrap();
        region.put(key(1), Bytes::from_static(b"v")).unwrap();
        region.flush().unwrap();
        fs::write(PagedRegion::page_path(&dir, 0), b"garbage").unwrap();

        let mut reopened = PagedRegion::open("p", dir, 1).unwrap();
        assert!(reopened.get(&key(1)).unwrap_err().is_corruption());
    }
}
