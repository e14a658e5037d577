//! Byte-level storage regions.
//!
//! A region is one named, independently clearable key/value area. Keys and
//! values are opaque encoded bytes at this level; typed access lives in
//! [`crate::KvStore`]. Two backends exist, selected by [`crate::StorageHint`]:
//!
//! - [`InMemoryRegion`]: the whole region is loaded on open and written back
//!   as one file on flush.
//! - [`PagedRegion`]: keys are spread over a fixed number of page files that
//!   are loaded on first touch; only dirty pages are rewritten.

mod format;
mod memory;
mod paged;

pub use memory::InMemoryRegion;
pub use paged::PagedRegion;

pub(crate) use format::{decode_entries, encode_entries, REGION_FORMAT_VERSION};

use bytes::Bytes;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;

use crate::StorageResult;

/// Owned key/value byte pair.
pub type RawEntry = (Bytes, Bytes);

/// Byte-level backend behind a typed store.
///
/// All methods take `&mut self`: backends may load data lazily, and the
/// typed store serializes access with its own lock.
pub trait RegionBackend: Send {
    /// Region name, used in errors and logs.
    fn name(&self) -> &str;

    /// Point lookup.
    ///
    /// # Errors
    ///
    /// Returns a `StorageError` if backing data cannot be loaded.
    fn get(&mut self, key: &[u8]) -> StorageResult<Option<Bytes>>;

    /// Presence check.
    ///
    /// # Errors
    ///
    /// Returns a `StorageError` if backing data cannot be loaded.
    fn contains(&mut self, key: &[u8]) -> StorageResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Upsert.
    ///
    /// # Errors
    ///
    /// Returns a `StorageError` if backing data cannot be loaded.
    fn put(&mut self, key: Bytes, value: Bytes) -> StorageResult<()>;

    /// Delete, returning the previous encoded value.
    ///
    /// # Errors
    ///
    /// Returns a `StorageError` if backing data cannot be loaded.
    fn remove(&mut self, key: &[u8]) -> StorageResult<Option<Bytes>>;

    /// Drop every entry.
    ///
    /// # Errors
    ///
    /// Returns a `StorageError` if persisted files cannot be removed.
    fn clear(&mut self) -> StorageResult<()>;

    /// Number of chunks iteration walks through.
    fn chunk_count(&self) -> usize;

    /// Snapshot of the entries in one chunk.
    ///
    /// # Errors
    ///
    /// Returns a `StorageError` if the chunk cannot be loaded.
    fn chunk(&mut self, index: usize) -> StorageResult<Vec<RawEntry>>;

    /// Total number of entries.
    ///
    /// # Errors
    ///
    /// Returns a `StorageError` if backing data cannot be loaded.
    fn len(&mut self) -> StorageResult<usize>;

    /// Write pending changes to disk. No-op for ephemeral regions.
    ///
    /// # Errors
    ///
    /// Returns a `StorageError` if writing fails.
    fn flush(&mut self) -> StorageResult<()>;
}

/// Write data to a file atomically with fsync for durability.
///
/// Write-fsync-rename: the temp file is synced before the rename, and the
/// parent directory afterwards so the new entry survives a crash.
pub(crate) fn atomic_write(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let temp_path = path.with_extension("tmp");
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&temp_path)?;

    file.write_all(data)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&temp_path, path)?;

    if let Some(parent) = path.parent()
        && let Ok(dir) = File::open(parent)
    {
        // Best effort - some filesystems don't support this
        let _ = dir.sync_all();
    }

    Ok(())
}

/// Read a file, treating a missing file as absent.
pub(crate) fn read_optional(path: &Path) -> std::io::Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}
