//! Content-hash based target diffing against persisted fingerprints.
//!
//! A pass is split in two steps: [`TargetDiffService::classify`] reads the
//! persisted records and produces a [`Classification`] without mutating
//! anything, then [`TargetDiffService::apply`] writes the new observations.
//! Callers that abandon a pass between the two leave the stores untouched.

use convenient_storage::codec::{Hash128Codec, VersionedCodec};
use convenient_storage::{
    Hash128, KvMultiSetMap, KvStore, StorageContext, StorageHint, StorageResult,
};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::{debug, info};

use crate::diff::{CurrentTargets, Diff, DiffKind, Observation, TargetRecord, TargetRecordCodec};
use crate::label::{Label, LabelCodec};

const RECORDS_REGION: &str = "target-records";
const PATHS_REGION: &str = "target-paths";
const RECORD_FORMAT: u16 = 1;

/// How new observations replace the persisted records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffMode {
    /// Clear both stores, then insert every observation
    Full,
    /// Remove records of removed labels, upsert every observation
    Incremental,
}

/// Result of classifying new observations against persisted records.
#[derive(Debug, Clone, Default)]
pub struct Classification {
    observed: BTreeMap<Label, TargetRecord>,
    prior: BTreeMap<Label, TargetRecord>,
    stale_paths: Vec<(String, Label)>,
    diff: Diff,
}

impl Classification {
    /// Label-level diff.
    #[must_use]
    pub fn diff(&self) -> &Diff {
        &self.diff
    }

    /// Record held before this pass for a removed or changed label.
    #[must_use]
    pub fn prior(&self, label: &Label) -> Option<&TargetRecord> {
        self.prior.get(label)
    }

    /// Files that removed or moved labels originated from before this pass.
    pub fn stale_paths(&self) -> impl Iterator<Item = &str> {
        self.stale_paths.iter().map(|(path, _)| path.as_str())
    }

    /// Deduplicated new observations.
    #[must_use]
    pub fn observed(&self) -> &BTreeMap<Label, TargetRecord> {
        &self.observed
    }
}

/// Persisted `Label -> TargetRecord` table with a reverse path index.
#[derive(Debug, Clone)]
pub struct TargetDiffService {
    records: KvStore<Label, TargetRecord>,
    paths: KvMultiSetMap<Hash128, Label>,
}

fn path_key(path: &str) -> Hash128 {
    Hash128::of(path.as_bytes())
}

impl TargetDiffService {
    /// Open the service's regions in `ctx`.
    ///
    /// # Errors
    ///
    /// Returns a `StorageError` if a region cannot be opened.
    pub fn open(ctx: &StorageContext) -> StorageResult<Self> {
        Ok(Self {
            records: ctx.kv_store(
                RECORDS_REGION,
                Some(StorageHint::Paged),
                LabelCodec,
                VersionedCodec::new(RECORD_FORMAT, TargetRecordCodec),
            )?,
            paths: ctx.multimap(PATHS_REGION, Some(StorageHint::Paged), Hash128Codec, LabelCodec)?,
        })
    }

    /// Classify `observations` against the persisted records.
    ///
    /// Duplicate labels resolve to the last observation. Nothing is
    /// written.
    ///
    /// # Errors
    ///
    /// Returns a `StorageError` if the records cannot be read.
    pub fn classify<I>(&self, observations: I) -> StorageResult<Classification>
    where
        I: IntoIterator<Item = Observation>,
    {
        let mut observed: BTreeMap<Label, TargetRecord> = BTreeMap::new();
        for obs in observations {
            let record = TargetRecord::from(&obs);
            let _ = observed.insert(obs.label, record);
        }

        let mut result = Classification::default();
        let mut seen: HashSet<Label> = HashSet::new();
        for entry in self.records.entries() {
            let (label, old) = entry?;
            match observed.get(&label) {
                None => {
                    if let Some(path) = &old.path {
                        result.stale_paths.push((path.clone(), label.clone()));
                    }
                    result.diff.insert(label.clone(), DiffKind::Removed);
                    let _ = result.prior.insert(label.clone(), old);
                }
                Some(new) => {
                    if let Some(path) = &old.path
                        && old.path != new.path
                    {
                        result.stale_paths.push((path.clone(), label.clone()));
                    }
                    if new.hash != old.hash {
                        result.diff.insert(label.clone(), DiffKind::Changed);
                        let _ = result.prior.insert(label.clone(), old);
                    }
                }
            }
            let _ = seen.insert(label);
        }
        for label in observed.keys() {
            if !seen.contains(label) {
                result.diff.insert(label.clone(), DiffKind::Added);
            }
        }
        result.observed = observed;

        debug!(
            "Classified {} observations against {} records: {}",
            result.observed.len(),
            seen.len(),
            result.diff
        );
        Ok(result)
    }

    /// Write a classification's observations.
    ///
    /// # Errors
    ///
    /// Returns a `StorageError` if a store cannot be written.
    pub fn apply(&self, classification: &Classification, mode: DiffMode) -> StorageResult<()> {
        match mode {
            DiffMode::Full => {
                self.clear()?;
            }
            DiffMode::Incremental => {
                for label in &classification.diff.removed {
                    let _ = self.records.remove(label, false)?;
                }
                for (path, label) in &classification.stale_paths {
                    let _ = self.paths.remove(&path_key(path), label)?;
                }
            }
        }
        self.write_records(&classification.observed)?;
        debug!(
            "Applied {} records ({:?})",
            classification.observed.len(),
            mode
        );
        Ok(())
    }

    /// Classify then apply in one step.
    ///
    /// # Errors
    ///
    /// Returns a `StorageError` if a store cannot be read or written.
    pub fn compute_diff<I>(&self, observations: I, mode: DiffMode) -> StorageResult<Diff>
    where
        I: IntoIterator<Item = Observation>,
    {
        let classification = self.classify(observations)?;
        self.apply(&classification, mode)?;
        info!("Target diff: {}", classification.diff);
        Ok(classification.diff)
    }

    /// Replace every record with `observations`, without diffing.
    ///
    /// # Errors
    ///
    /// Returns a `StorageError` if a store cannot be written.
    pub fn replace_all<I>(&self, observations: I) -> StorageResult<()>
    where
        I: IntoIterator<Item = Observation>,
    {
        let observed: BTreeMap<Label, TargetRecord> = observations
            .into_iter()
            .map(|obs| {
                let record = TargetRecord::from(&obs);
                (obs.label, record)
            })
            .collect();
        self.clear()?;
        self.write_records(&observed)
    }

    /// Drop the records of `labels`, returning what was held.
    ///
    /// # Errors
    ///
    /// Returns a `StorageError` if a store cannot be written.
    pub fn forget<'a, I>(&self, labels: I) -> StorageResult<BTreeMap<Label, TargetRecord>>
    where
        I: IntoIterator<Item = &'a Label>,
    {
        let mut dropped = BTreeMap::new();
        for label in labels {
            if let Some(old) = self.records.remove(label, true)? {
                if let Some(path) = &old.path {
                    let _ = self.paths.remove(&path_key(path), label)?;
                }
                let _ = dropped.insert(label.clone(), old);
            }
        }
        Ok(dropped)
    }

    /// Current record of `label`.
    ///
    /// # Errors
    ///
    /// Returns a `StorageError` if the record cannot be read.
    pub fn record(&self, label: &Label) -> StorageResult<Option<TargetRecord>> {
        self.records.get(label)
    }

    /// Every tracked label, sorted.
    ///
    /// # Errors
    ///
    /// Returns a `StorageError` if the records cannot be read.
    pub fn labels(&self) -> StorageResult<BTreeSet<Label>> {
        self.records.keys().collect()
    }

    /// Labels whose originating file is `path`.
    ///
    /// # Errors
    ///
    /// Returns a `StorageError` if the index cannot be read.
    pub fn labels_for_path(&self, path: &str) -> StorageResult<BTreeSet<Label>> {
        Ok(self.paths.get(&path_key(path))?.into_iter().collect())
    }

    /// Number of tracked labels.
    ///
    /// # Errors
    ///
    /// Returns a `StorageError` if the records cannot be read.
    pub fn len(&self) -> StorageResult<usize> {
        self.records.len()
    }

    /// Whether no label is tracked.
    ///
    /// # Errors
    ///
    /// Returns a `StorageError` if the records cannot be read.
    pub fn is_empty(&self) -> StorageResult<bool> {
        self.records.is_empty()
    }

    /// Drop every record and index entry.
    ///
    /// # Errors
    ///
    /// Returns a `StorageError` if a store cannot be cleared.
    pub fn clear(&self) -> StorageResult<()> {
        self.records.clear()?;
        self.paths.clear()
    }

    /// Handle resolving labels against the records as they are now.
    #[must_use]
    pub fn current(&self) -> CurrentTargets {
        CurrentTargets::new(self.records.clone())
    }

    fn write_records(&self, observed: &BTreeMap<Label, TargetRecord>) -> StorageResult<()> {
        for (label, record) in observed {
            self.records.put(label, record)?;
            if let Some(path) = &record.path {
                let _ = self.paths.put(&path_key(path), label.clone())?;
            }
        }
        Ok(())
    }
}
