//! Workspace-scoped owner of all storage regions.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs;
use std::hash::Hash;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::codec::Codec;
use crate::flat::FlatStorage;
use crate::kv::{KvStore, SharedBackend};
use crate::multimap::KvMultiSetMap;
use crate::region::{InMemoryRegion, PagedRegion, RegionBackend};
use crate::{StorageError, StorageResult};

/// Placement hint for a region. Never changes store semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageHint {
    /// Whole region loaded on open and written back as one file
    #[default]
    InMemory,
    /// Region split into pages that load on first access
    Paged,
}

/// Storage configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Directory holding region files; `None` keeps everything in memory
    pub root: Option<PathBuf>,
    /// Hint used when a store does not ask for one
    pub default_hint: StorageHint,
    /// Page count for newly created paged regions
    pub page_count: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: None,
            default_hint: StorageHint::InMemory,
            page_count: 16,
        }
    }
}

impl StorageConfig {
    /// Persistent configuration rooted at `root`.
    #[must_use]
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
            ..Self::default()
        }
    }
}

/// Creates and tracks every region of one workspace.
///
/// Regions are opened at most once per context. A region whose persisted
/// data cannot be decoded is discarded and opened empty; its name is kept
/// so the caller can fall back to a full rebuild (see
/// [`StorageContext::take_recovered`]).
pub struct StorageContext {
    config: StorageConfig,
    regions: Mutex<BTreeMap<String, SharedBackend>>,
    recovered: Mutex<Vec<String>>,
}

impl std::fmt::Debug for StorageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageContext")
            .field("config", &self.config)
            .field("regions", &self.regions.lock().keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl StorageContext {
    /// Open a context with the given configuration, creating the root
    /// directory if needed.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Io` if the root directory cannot be created.
    pub fn open(config: StorageConfig) -> StorageResult<Self> {
        if let Some(root) = &config.root {
            fs::create_dir_all(root).map_err(|e| StorageError::io("<root>", e))?;
            info!("Opened storage at {}", root.display());
        }
        Ok(Self {
            config,
            regions: Mutex::new(BTreeMap::new()),
            recovered: Mutex::new(Vec::new()),
        })
    }

    /// Context that never touches disk.
    #[must_use]
    pub fn ephemeral() -> Self {
        Self {
            config: StorageConfig::default(),
            regions: Mutex::new(BTreeMap::new()),
            recovered: Mutex::new(Vec::new()),
        }
    }

    /// Root directory, if persistent.
    #[must_use]
    pub fn root(&self) -> Option<&Path> {
        self.config.root.as_deref()
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Open a typed key/value store.
    ///
    /// # Errors
    ///
    /// - `StorageError::InvalidRegionName` if `name` is not a plain file name
    /// - `StorageError::DuplicateRegion` if `name` is already open
    /// - `StorageError::Io` if existing region data cannot be read
    pub fn kv_store<K, V, KC, VC>(
        &self,
        name: &str,
        hint: Option<StorageHint>,
        key_codec: KC,
        value_codec: VC,
    ) -> StorageResult<KvStore<K, V>>
    where
        K: 'static,
        V: 'static,
        KC: Codec<Value = K> + 'static,
        VC: Codec<Value = V> + 'static,
    {
        let backend = self.open_backend(name, hint)?;
        let store = KvStore::from_backend(backend, key_codec, value_codec);
        self.register(name, store.shared_backend());
        Ok(store)
    }

    /// Open a key to set-of-values store.
    ///
    /// # Errors
    ///
    /// Same as [`StorageContext::kv_store`].
    pub fn multimap<K, V, KC, VC>(
        &self,
        name: &str,
        hint: Option<StorageHint>,
        key_codec: KC,
        value_codec: VC,
    ) -> StorageResult<KvMultiSetMap<K, V>>
    where
        K: 'static,
        V: Eq + Hash + 'static,
        KC: Codec<Value = K> + 'static,
        VC: Codec<Value = V> + 'static,
    {
        let backend = self.open_backend(name, hint)?;
        let map = KvMultiSetMap::from_backend(backend, key_codec, value_codec);
        self.register(name, map.as_store().shared_backend());
        Ok(map)
    }

    /// Open a single-value store. Always held in memory.
    ///
    /// # Errors
    ///
    /// Same as [`StorageContext::kv_store`].
    pub fn flat_store<V, C, F>(&self, name: &str, codec: C, creator: F) -> StorageResult<FlatStorage<V>>
    where
        V: 'static,
        C: Codec<Value = V> + 'static,
        F: Fn() -> V + Send + Sync + 'static,
    {
        let backend = self.open_backend(name, Some(StorageHint::InMemory))?;
        let flat = FlatStorage::from_backend(backend, codec, creator);
        self.register(name, flat.shared_backend());
        Ok(flat)
    }

    /// Flush every region opened through this context.
    ///
    /// # Errors
    ///
    /// Returns the first `StorageError` encountered; remaining regions are
    /// still attempted.
    pub fn save(&self) -> StorageResult<()> {
        let regions = self.regions.lock();
        let mut first_error = None;
        for (name, backend) in regions.iter() {
            if let Err(e) = backend.lock().flush() {
                warn!("Failed to flush region '{}': {}", name, e);
                let _ = first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => {
                debug!("Saved {} regions", regions.len());
                Ok(())
            }
        }
    }

    /// Clear every region opened through this context.
    ///
    /// # Errors
    ///
    /// Returns the first `StorageError` encountered.
    pub fn clear_all(&self) -> StorageResult<()> {
        for backend in self.regions.lock().values() {
            backend.lock().clear()?;
        }
        Ok(())
    }

    /// Names of regions discarded as corrupted since the last call.
    pub fn take_recovered(&self) -> Vec<String> {
        std::mem::take(&mut *self.recovered.lock())
    }

    /// Record a region found corrupted after it was opened.
    pub fn mark_recovered(&self, name: &str) {
        self.recovered.lock().push(name.to_string());
    }

    fn register(&self, name: &str, backend: SharedBackend) {
        let _ = self.regions.lock().insert(name.to_string(), backend);
    }

    fn open_backend(&self, name: &str, hint: Option<StorageHint>) -> StorageResult<Box<dyn RegionBackend>> {
        validate_region_name(name)?;
        if self.regions.lock().contains_key(name) {
            return Err(StorageError::DuplicateRegion(name.to_string()));
        }

        let hint = hint.unwrap_or(self.config.default_hint);
        let Some(root) = &self.config.root else {
            return Ok(match hint {
                StorageHint::InMemory => Box::new(InMemoryRegion::ephemeral(name)),
                StorageHint::Paged => Box::new(PagedRegion::ephemeral(name, self.config.page_count)),
            });
        };

        match self.open_persistent(root, name, hint) {
            Err(e) if e.is_corruption() => {
                warn!("Discarding corrupted region '{}': {}", name, e);
                self.discard(root, name)?;
                self.mark_recovered(name);
                self.open_persistent(root, name, hint)
            }
            other => other,
        }
    }

    fn open_persistent(&self, root: &Path, name: &str, hint: StorageHint) -> StorageResult<Box<dyn RegionBackend>> {
        Ok(match hint {
            StorageHint::InMemory => Box::new(InMemoryRegion::open(name, memory_path(root, name))?),
            StorageHint::Paged => Box::new(PagedRegion::open(
                name,
                paged_dir(root, name),
                self.config.page_count,
            )?),
        })
    }

    fn discard(&self, root: &Path, name: &str) -> StorageResult<()> {
        let file = memory_path(root, name);
        if file.exists() {
            fs::remove_file(&file).map_err(|e| StorageError::io(name, e))?;
        }
        let dir = paged_dir(root, name);
        if dir.exists() {
            fs::remove_dir_all(&dir).map_err(|e| StorageError::io(name, e))?;
        }
        Ok(())
    }
}

fn memory_path(root: &Path, name: &str) -> PathBuf {
    root.join(format!("{name}.kv"))
}

fn paged_dir(root: &Path, name: &str) -> PathBuf {
    root.join(format!("{name}.pages"))
}

fn validate_region_name(name: &str) -> StorageResult<()> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidRegionName(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{StringCodec, U32Codec};
    use tempfile::TempDir;
    use tracing_test::traced_test;

    #[test]
    fn test_region_names_validated() {
        let ctx = StorageContext::ephemeral();
        for bad in ["", ".hidden", "a/b", "../x", "sp ace"] {
            let err = ctx.kv_store(bad, None, StringCodec, U32Codec).unwrap_err();
            assert!(matches!(err, StorageError::InvalidRegionName(_)), "{bad}");
        }
        assert!(ctx.kv_store("target-records_v1", None, StringCodec, U32Codec).is_ok());
    }

    #[test]
    fn test_duplicate_region_rejected() {
        let ctx = StorageContext::ephemeral();
        let _store = ctx.kv_store("dup", None, StringCodec, U32Codec).unwrap();
        let err = ctx.multimap("dup", None, StringCodec, U32Codec).unwrap_err();
        assert!(matches!(err, StorageError::DuplicateRegion(_)));
    }

    #[test]
    fn test_save_writes_region_files() {
        let tmp = TempDir::new().unwrap();
        let ctx = StorageContext::open(StorageConfig::at(tmp.path())).unwrap();
        let kv = ctx.kv_store("kv", Some(StorageHint::InMemory), StringCodec, U32Codec).unwrap();
        let paged = ctx.kv_store("paged", Some(StorageHint::Paged), StringCodec, U32Codec).unwrap();
        kv.put(&"a".to_string(), &1).unwrap();
        paged.put(&"b".to_string(), &2).unwrap();
        ctx.save().unwrap();

        assert!(tmp.path().join("kv.kv").is_file());
        assert!(tmp.path().join("paged.pages").join("meta").is_file());
    }

    #[test]
    fn test_clear_all() {
        let ctx = StorageContext::ephemeral();
        let a = ctx.kv_store("a", None, StringCodec, U32Codec).unwrap();
        let b = ctx.multimap("b", Some(StorageHint::Paged), U32Codec, StringCodec).unwrap();
        a.put(&"x".to_string(), &1).unwrap();
        let _ = b.put(&1, "y".to_string()).unwrap();

        ctx.clear_all().unwrap();
        assert!(a.is_empty().unwrap());
        assert!(b.is_empty().unwrap());
    }

    #[test]
    #[traced_test]
    fn test_corrupted_region_discarded_and_reported() {
        let tmp = TempDir::new().unwrap();
        {
            let ctx = StorageContext::open(StorageConfig::at(tmp.path())).unwrap();
            let store = ctx.kv_store("records", None, StringCodec, U32Codec).unwrap();
            store.put(&"a".to_string(), &1).unwrap();
            ctx.save().unwrap();
        }
        fs::write(tmp.path().join("records.kv"), b"GSRG\x01").unwrap();

        let ctx = StorageContext::open(StorageConfig::at(tmp.path())).unwrap();
        let store = ctx.kv_store("records", None, StringCodec, U32Codec).unwrap();
        assert!(store.is_empty().unwrap());
        assert_eq!(ctx.take_recovered(), vec!["records".to_string()]);
        assert!(ctx.take_recovered().is_empty());
        assert!(logs_contain("Discarding corrupted region 'records'"));
    }
}
