//! Workspace snapshot read from JSON, standing in for the build tool.

use async_trait::async_trait;
use convenient_storage::Hash128;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::Path;
use tracing::debug;

use crate::diff::Observation;
use crate::error::{SyncError, SyncResult};
use crate::label::Label;
use crate::load_graph::FileKind;
use crate::pattern::TargetScope;
use crate::query::{HashContributor, QueryError, QueryExecutor, QueryMode, SourceFileRecord};

/// One target in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotTarget {
    /// Target label
    pub label: Label,
    /// Fingerprint: 32 hex digits, or any text that is hashed
    pub hash: String,
    /// Build file defining the target
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Target fails to evaluate
    #[serde(default)]
    pub broken: bool,
}

impl SnapshotTarget {
    /// Fingerprint of the target.
    #[must_use]
    pub fn fingerprint(&self) -> Hash128 {
        self.hash
            .parse()
            .unwrap_or_else(|_| Hash128::of(self.hash.as_bytes()))
    }

    /// Hash observation for the target.
    #[must_use]
    pub fn observation(&self) -> Observation {
        Observation {
            label: self.label.clone(),
            hash: self.fingerprint(),
            path: self.path.clone(),
        }
    }
}

/// Point-in-time view of a workspace: targets, source files and
/// repository mapping.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WorkspaceSnapshot {
    /// Every target of the workspace
    #[serde(default)]
    pub targets: Vec<SnapshotTarget>,
    /// Build-relevant source files
    #[serde(default)]
    pub files: Vec<SourceFileRecord>,
    /// Apparent-to-canonical repository names
    #[serde(default)]
    pub repo_mapping: BTreeMap<String, String>,
}

impl WorkspaceSnapshot {
    /// Parse a snapshot from JSON text.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::SnapshotFormat` if the text is not a valid snapshot.
    pub fn from_json_str(json: &str) -> SyncResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read a snapshot file.
    ///
    /// # Errors
    ///
    /// - `SyncError::SnapshotIo` if the file cannot be read
    /// - `SyncError::SnapshotFormat` if it is not a valid snapshot
    pub fn from_json_file(path: &Path) -> SyncResult<Self> {
        let json = std::fs::read_to_string(path).map_err(|source| SyncError::SnapshotIo {
            path: path.display().to_string(),
            source,
        })?;
        let snapshot = Self::from_json_str(&json)?;
        debug!(
            "Loaded snapshot {} with {} targets and {} files",
            path.display(),
            snapshot.targets.len(),
            snapshot.files.len()
        );
        Ok(snapshot)
    }

    /// Evaluate `scope`, splitting healthy from broken targets.
    fn evaluate(&self, scope: &TargetScope) -> (Vec<&SnapshotTarget>, usize) {
        let mut healthy = Vec::new();
        let mut broken = 0;
        for target in self.targets.iter().filter(|t| scope.contains(&t.label)) {
            if target.broken {
                broken += 1;
            } else {
                healthy.push(target);
            }
        }
        (healthy, broken)
    }

    fn check_mode(scope: &str, broken: usize, mode: QueryMode) -> Result<(), QueryError> {
        if broken > 0 && mode == QueryMode::FailFast {
            return Err(QueryError::Partial {
                scope: scope.to_string(),
                count: broken,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl QueryExecutor for WorkspaceSnapshot {
    async fn query_targets(&self, scope: &TargetScope, mode: QueryMode) -> Result<BTreeSet<Label>, QueryError> {
        let (healthy, broken) = self.evaluate(scope);
        Self::check_mode(&scope.to_string(), broken, mode)?;
        Ok(healthy.into_iter().map(|t| t.label.clone()).collect())
    }

    async fn source_files(
        &self,
        labels: &BTreeSet<Label>,
        mode: QueryMode,
    ) -> Result<Vec<SourceFileRecord>, QueryError> {
        let files: BTreeMap<&str, &SourceFileRecord> =
            self.files.iter().map(|f| (f.path.as_str(), f)).collect();

        let mut broken = 0;
        let mut queue: VecDeque<(String, FileKind)> = VecDeque::new();
        for target in self.targets.iter().filter(|t| labels.contains(&t.label)) {
            if target.broken {
                broken += 1;
            } else if let Some(path) = &target.path {
                queue.push_back((path.clone(), FileKind::Build));
            }
        }
        Self::check_mode("source files", broken, mode)?;

        let mut seen = BTreeSet::new();
        let mut records = Vec::new();
        while let Some((path, kind)) = queue.pop_front() {
            if !seen.insert(path.clone()) {
                continue;
            }
            let record = match files.get(path.as_str()) {
                Some(record) => (*record).clone(),
                None => SourceFileRecord {
                    path,
                    kind,
                    loads: Vec::new(),
                },
            };
            queue.extend(record.loads.iter().map(|p| (p.clone(), FileKind::Loaded)));
            records.push(record);
        }
        Ok(records)
    }

    async fn repo_mapping(&self, repos: &BTreeSet<String>) -> Result<BTreeMap<String, String>, QueryError> {
        Ok(repos
            .iter()
            .map(|repo| {
                let canonical = self.repo_mapping.get(repo).cloned().unwrap_or_else(|| repo.clone());
                (repo.clone(), canonical)
            })
            .collect())
    }
}

#[async_trait]
impl HashContributor for WorkspaceSnapshot {
    async fn target_hashes(&self, scope: &TargetScope) -> Result<Vec<Observation>, QueryError> {
        let (healthy, _) = self.evaluate(scope);
        Ok(healthy.into_iter().map(SnapshotTarget::observation).collect())
    }
}
