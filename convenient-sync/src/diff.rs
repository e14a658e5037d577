//! Diff values: label-level classification and baked target references.

use convenient_storage::codec::{
    Codec, CodecBuffer, CodecContext, CodecResult, Hash128Codec, OptionCodec, StringCodec,
};
use convenient_storage::{Hash128, KvStore, StorageResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::label::Label;

/// One target as seen by the hash contributor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    /// Target label
    pub label: Label,
    /// Fingerprint of the target's build-relevant definition
    pub hash: Hash128,
    /// Workspace-relative file that defines the target
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl Observation {
    /// Observation without an originating path.
    #[must_use]
    pub fn new(label: Label, hash: Hash128) -> Self {
        Self {
            label,
            hash,
            path: None,
        }
    }

    /// Set the originating path.
    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }
}

/// Persisted fingerprint of one target. Replaced wholesale on update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetRecord {
    /// Content fingerprint
    pub hash: Hash128,
    /// Originating file, if known
    pub path: Option<String>,
}

impl From<&Observation> for TargetRecord {
    fn from(obs: &Observation) -> Self {
        Self {
            hash: obs.hash,
            path: obs.path.clone(),
        }
    }
}

/// Codec for [`TargetRecord`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TargetRecordCodec;

impl Codec for TargetRecordCodec {
    type Value = TargetRecord;

    fn encode(&self, ctx: &CodecContext, buf: &mut CodecBuffer, value: &TargetRecord) -> CodecResult<()> {
        Hash128Codec.encode(ctx, buf, &value.hash)?;
        OptionCodec::new(StringCodec).encode(ctx, buf, &value.path)
    }

    fn decode(&self, ctx: &CodecContext, buf: &mut CodecBuffer) -> CodecResult<TargetRecord> {
        Ok(TargetRecord {
            hash: Hash128Codec.decode(ctx, buf)?,
            path: OptionCodec::new(StringCodec).decode(ctx, buf)?,
        })
    }
}

/// Classification of one label in a [`Diff`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffKind {
    /// Present only in the new observation
    Added,
    /// Present only in the old observation
    Removed,
    /// Present in both with different fingerprints
    Changed,
}

/// Disjoint added/removed/changed label sets.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Diff {
    /// Labels new in this pass
    pub added: BTreeSet<Label>,
    /// Labels gone in this pass
    pub removed: BTreeSet<Label>,
    /// Labels whose fingerprint changed
    pub changed: BTreeSet<Label>,
}

impl Diff {
    /// Diff where every label is added.
    #[must_use]
    pub fn all_added(labels: impl IntoIterator<Item = Label>) -> Self {
        Self {
            added: labels.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Whether nothing changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }

    /// Total number of classified labels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.added.len() + self.removed.len() + self.changed.len()
    }

    /// How `label` is classified, if at all.
    #[must_use]
    pub fn kind_of(&self, label: &Label) -> Option<DiffKind> {
        if self.added.contains(label) {
            Some(DiffKind::Added)
        } else if self.removed.contains(label) {
            Some(DiffKind::Removed)
        } else if self.changed.contains(label) {
            Some(DiffKind::Changed)
        } else {
            None
        }
    }

    /// Add `label` to `kind`, keeping the three sets disjoint.
    pub fn insert(&mut self, label: Label, kind: DiffKind) {
        let _ = self.added.remove(&label);
        let _ = self.removed.remove(&label);
        let _ = self.changed.remove(&label);
        let _ = match kind {
            DiffKind::Added => self.added.insert(label),
            DiffKind::Removed => self.removed.insert(label),
            DiffKind::Changed => self.changed.insert(label),
        };
    }

    /// Mark labels changed unless they are already added or removed.
    pub fn force_changed<'a>(&mut self, labels: impl IntoIterator<Item = &'a Label>) {
        for label in labels {
            if !self.added.contains(label) && !self.removed.contains(label) {
                let _ = self.changed.insert(label.clone());
            }
        }
    }
}

impl fmt::Display for Diff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} added, {} removed, {} changed",
            self.added.len(),
            self.removed.len(),
            self.changed.len()
        )
    }
}

/// Handle resolving labels against the target store as it is now.
#[derive(Debug, Clone)]
pub struct CurrentTargets {
    records: KvStore<Label, TargetRecord>,
}

impl CurrentTargets {
    pub(crate) fn new(records: KvStore<Label, TargetRecord>) -> Self {
        Self { records }
    }

    /// Current record of `label`.
    ///
    /// # Errors
    ///
    /// Returns a `StorageError` if the store cannot be read.
    pub fn resolve(&self, label: &Label) -> StorageResult<Option<TargetRecord>> {
        self.records.get(label)
    }
}

/// Reference to a target carried by a [`SyncDiff`].
///
/// Added and changed targets resolve lazily against the current store;
/// removed targets carry the record captured before it was deleted.
#[derive(Debug, Clone)]
pub enum TargetRef {
    /// Resolved on demand against current state
    Current {
        /// Target label
        label: Label,
        /// Store handle to resolve against
        targets: CurrentTargets,
    },
    /// Snapshot of the state before this pass
    Prior {
        /// Target label
        label: Label,
        /// Record as it was, if it was known
        record: Option<TargetRecord>,
    },
}

impl TargetRef {
    /// Label referenced.
    #[must_use]
    pub fn label(&self) -> &Label {
        match self {
            Self::Current { label, .. } | Self::Prior { label, .. } => label,
        }
    }

    /// Record behind the reference.
    ///
    /// # Errors
    ///
    /// Returns a `StorageError` if a current reference cannot be resolved.
    pub fn resolve(&self) -> StorageResult<Option<TargetRecord>> {
        match self {
            Self::Current { label, targets } => targets.resolve(label),
            Self::Prior { record, .. } => Ok(record.clone()),
        }
    }
}

/// Changed target: state before and after this pass.
#[derive(Debug, Clone)]
pub struct ChangedTarget {
    /// Prior snapshot
    pub old: TargetRef,
    /// Current reference
    pub new: TargetRef,
}

/// Diff with target references, handed to the diff consumer.
#[derive(Debug, Clone, Default)]
pub struct SyncDiff {
    /// Added targets (current references)
    pub added: Vec<TargetRef>,
    /// Removed targets (prior snapshots)
    pub removed: Vec<TargetRef>,
    /// Changed targets
    pub changed: Vec<ChangedTarget>,
}

impl SyncDiff {
    /// Bake a label-level diff into references.
    ///
    /// `prior` supplies the pre-pass record of removed and changed labels.
    pub fn bake<F>(diff: &Diff, targets: &CurrentTargets, mut prior: F) -> Self
    where
        F: FnMut(&Label) -> Option<TargetRecord>,
    {
        let current = |label: &Label| TargetRef::Current {
            label: label.clone(),
            targets: targets.clone(),
        };
        Self {
            added: diff.added.iter().map(current).collect(),
            removed: diff
                .removed
                .iter()
                .map(|label| TargetRef::Prior {
                    label: label.clone(),
                    record: prior(label),
                })
                .collect(),
            changed: diff
                .changed
                .iter()
                .map(|label| ChangedTarget {
                    old: TargetRef::Prior {
                        label: label.clone(),
                        record: prior(label),
                    },
                    new: current(label),
                })
                .collect(),
        }
    }

    /// Label-level view.
    #[must_use]
    pub fn labels(&self) -> Diff {
        Diff {
            added: self.added.iter().map(|r| r.label().clone()).collect(),
            removed: self.removed.iter().map(|r| r.label().clone()).collect(),
            changed: self.changed.iter().map(|c| c.new.label().clone()).collect(),
        }
    }

    /// Whether nothing changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::label::LabelCodec;
    use convenient_storage::codec::{decode_from_slice, encode_to_bytes};

    fn label(s: &str) -> Label {
        s.parse().unwrap()
    }

    #[test]
    fn test_insert_keeps_sets_disjoint() {
        let mut diff = Diff::default();
        diff.insert(label("//a:x"), DiffKind::Added);
        diff.insert(label("//a:x"), DiffKind::Changed);
        assert_eq!(diff.kind_of(&label("//a:x")), Some(DiffKind::Changed));
        assert_eq!(diff.len(), 1);
    }

    #[test]
    fn test_force_changed_respects_membership_flips() {
        let mut diff = Diff::all_added([label("//a:new")]);
        diff.removed.insert(label("//a:gone"));
        diff.force_changed(&[label("//a:new"), label("//a:gone"), label("//a:kept")]);
        assert_eq!(diff.changed, BTreeSet::from([label("//a:kept")]));
        assert_eq!(diff.to_string(), "1 added, 1 removed, 1 changed");
    }

    #[test]
    fn test_record_codec_boundaries() {
        let ctx = CodecContext::default();
        for record in [
            TargetRecord {
                hash: Hash128::from_parts(0, 0),
                path: None,
            },
            TargetRecord {
                hash: Hash128::from_parts(u64::MAX, u64::MAX),
                path: Some(String::new()),
            },
        ] {
            let bytes = encode_to_bytes(&TargetRecordCodec, &ctx, &record).unwrap();
            assert_eq!(decode_from_slice(&TargetRecordCodec, &ctx, &bytes).unwrap(), record);
        }
    }

    #[test]
    fn test_references_resolve() {
        let records = KvStore::ephemeral("records", LabelCodec, TargetRecordCodec);
        let targets = CurrentTargets::new(records.clone());
        let old = TargetRecord {
            hash: Hash128::of(b"old"),
            path: Some("a/BUILD".to_string()),
        };
        let new = TargetRecord {
            hash: Hash128::of(b"new"),
            path: Some("a/BUILD".to_string()),
        };
        records.put(&label("//a:lib"), &new).unwrap();

        let mut diff = Diff::default();
        diff.insert(label("//a:lib"), DiffKind::Changed);
        diff.insert(label("//a:gone"), DiffKind::Removed);
        let baked = SyncDiff::bake(&diff, &targets, |l| (l == &label("//a:lib")).then(|| old.clone()));

        assert_eq!(baked.labels(), diff);
        assert_eq!(baked.changed[0].old.resolve().unwrap(), Some(old.clone()));
        assert_eq!(baked.changed[0].new.resolve().unwrap(), Some(new));
        assert_eq!(baked.removed[0].resolve().unwrap(), None);

        // Current references see later writes; prior snapshots do not.
        let newer = TargetRecord {
            hash: Hash128::of(b"newer"),
            path: None,
        };
        records.put(&label("//a:lib"), &newer).unwrap();
        assert_eq!(baked.changed[0].new.resolve().unwrap(), Some(newer));
        assert_eq!(baked.changed[0].old.resolve().unwrap(), Some(old));
    }
}
