//! One sync pass: gather from collaborators, then commit to the stores.

use convenient_storage::{Hash128, StorageConfig, StorageContext, StorageResult};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::diff::{Diff, Observation, SyncDiff, TargetRecord, TargetRef};
use crate::error::{SyncError, SyncResult};
use crate::label::Label;
use crate::load_graph::{LoadUpdate, StarlarkLoadTracker};
use crate::query::{cancellable, DiffConsumer, HashContributor, QueryExecutor, QueryMode};
use crate::target_diff::{Classification, DiffMode, TargetDiffService};
use crate::universe::{SyncUniverseService, UniverseConfig, UniversePlan};

/// What a sync pass recomputes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncScope {
    /// Recompute everything from cleared state
    Full,
    /// Compute the delta against persisted state
    Incremental,
    /// Incremental, with these labels always reported as changed
    Partial(BTreeSet<Label>),
}

impl SyncScope {
    /// Whether this scope clears persisted state.
    #[must_use]
    pub fn is_full(&self) -> bool {
        matches!(self, Self::Full)
    }

    fn forced(&self) -> Option<&BTreeSet<Label>> {
        match self {
            Self::Partial(labels) => Some(labels),
            Self::Full | Self::Incremental => None,
        }
    }
}

impl fmt::Display for SyncScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => write!(f, "full"),
            Self::Incremental => write!(f, "incremental"),
            Self::Partial(labels) => write!(f, "partial ({} labels)", labels.len()),
        }
    }
}

/// Switches that tune a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncFlags {
    /// Diff content hashes on incremental passes; otherwise only the
    /// universe diff is reported
    pub use_target_hasher: bool,
    /// Partial-failure policy for queries
    pub query_mode: QueryMode,
}

impl Default for SyncFlags {
    fn default() -> Self {
        Self {
            use_target_hasher: true,
            query_mode: QueryMode::KeepGoing,
        }
    }
}

/// All persisted sync state of one workspace.
#[derive(Debug)]
pub struct SyncWorkspace {
    storage: StorageContext,
    targets: TargetDiffService,
    universe: SyncUniverseService,
    loads: StarlarkLoadTracker,
}

impl SyncWorkspace {
    /// Open the workspace state described by `config`.
    ///
    /// # Errors
    ///
    /// Returns a `SyncError` if a region cannot be opened.
    pub fn open(config: StorageConfig) -> SyncResult<Self> {
        Self::from_context(StorageContext::open(config)?)
    }

    /// Workspace state that is never persisted.
    ///
    /// # Errors
    ///
    /// Returns a `SyncError` if a region cannot be opened.
    pub fn ephemeral() -> SyncResult<Self> {
        Self::from_context(StorageContext::ephemeral())
    }

    fn from_context(storage: StorageContext) -> SyncResult<Self> {
        let targets = TargetDiffService::open(&storage)?;
        let universe = SyncUniverseService::open(&storage)?;
        let loads = StarlarkLoadTracker::open(&storage)?;
        Ok(Self {
            storage,
            targets,
            universe,
            loads,
        })
    }

    /// Storage context holding every region.
    #[must_use]
    pub fn storage(&self) -> &StorageContext {
        &self.storage
    }

    /// Target diff service.
    #[must_use]
    pub fn targets(&self) -> &TargetDiffService {
        &self.targets
    }

    /// Universe service.
    #[must_use]
    pub fn universe(&self) -> &SyncUniverseService {
        &self.universe
    }

    /// Load tracker.
    #[must_use]
    pub fn loads(&self) -> &StarlarkLoadTracker {
        &self.loads
    }
}

/// Result of one committed pass.
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    /// Whether the pass computed everything from scratch
    pub first_sync: bool,
    /// Target diff with references
    pub diff: SyncDiff,
    /// Build files transitively loading the caller's changed files
    pub affected_build_files: BTreeSet<String>,
    /// Regions found corrupted and discarded before this pass
    pub recovered: Vec<String>,
}

/// Resolved target entry of an [`OutcomeReport`].
#[derive(Debug, Clone, Serialize)]
pub struct TargetReport {
    /// Target label
    pub label: Label,
    /// Fingerprint, if one is recorded
    pub hash: Option<Hash128>,
    /// Originating file, if known
    pub path: Option<String>,
}

/// Resolved changed entry of an [`OutcomeReport`].
#[derive(Debug, Clone, Serialize)]
pub struct ChangedReport {
    /// Target label
    pub label: Label,
    /// Fingerprint before the pass
    pub old_hash: Option<Hash128>,
    /// Fingerprint after the pass
    pub new_hash: Option<Hash128>,
}

/// Serializable view of a [`SyncOutcome`].
#[derive(Debug, Clone, Serialize)]
pub struct OutcomeReport {
    /// See [`SyncOutcome::first_sync`]
    pub first_sync: bool,
    /// Added targets
    pub added: Vec<TargetReport>,
    /// Removed targets, as they were
    pub removed: Vec<TargetReport>,
    /// Changed targets
    pub changed: Vec<ChangedReport>,
    /// See [`SyncOutcome::affected_build_files`]
    pub affected_build_files: BTreeSet<String>,
    /// See [`SyncOutcome::recovered`]
    pub recovered: Vec<String>,
}

fn target_report(target: &TargetRef) -> StorageResult<TargetReport> {
    let record = target.resolve()?;
    Ok(TargetReport {
        label: target.label().clone(),
        hash: record.as_ref().map(|r| r.hash),
        path: record.and_then(|r| r.path),
    })
}

impl SyncOutcome {
    /// Resolve every reference into a serializable report.
    ///
    /// # Errors
    ///
    /// Returns a `StorageError` if a current reference cannot be resolved.
    pub fn report(&self) -> StorageResult<OutcomeReport> {
        Ok(OutcomeReport {
            first_sync: self.first_sync,
            added: self.diff.added.iter().map(target_report).collect::<StorageResult<_>>()?,
            removed: self.diff.removed.iter().map(target_report).collect::<StorageResult<_>>()?,
            changed: self
                .diff
                .changed
                .iter()
                .map(|c| {
                    Ok(ChangedReport {
                        label: c.new.label().clone(),
                        old_hash: c.old.resolve()?.map(|r| r.hash),
                        new_hash: c.new.resolve()?.map(|r| r.hash),
                    })
                })
                .collect::<StorageResult<_>>()?,
            affected_build_files: self.affected_build_files.clone(),
            recovered: self.recovered.clone(),
        })
    }
}

/// Target fingerprints gathered for a pass.
enum Hashes {
    /// First sync: every record is replaced
    Replace(Vec<Observation>),
    /// Incremental: classified against the persisted records
    Classified(Classification),
    /// Hasher disabled
    Skipped,
}

/// Everything a pass gathered before touching any store.
struct Gathered {
    plan: UniversePlan,
    hashes: Hashes,
    loads: LoadUpdate,
}

/// Runs sync passes over one workspace.
pub struct SyncExecutor {
    workspace: SyncWorkspace,
    query: Arc<dyn QueryExecutor>,
    hasher: Arc<dyn HashContributor>,
    flags: SyncFlags,
}

impl fmt::Debug for SyncExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncExecutor")
            .field("workspace", &self.workspace)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

impl SyncExecutor {
    /// Executor over `workspace` with default flags.
    pub fn new(
        workspace: SyncWorkspace,
        query: Arc<dyn QueryExecutor>,
        hasher: Arc<dyn HashContributor>,
    ) -> Self {
        Self {
            workspace,
            query,
            hasher,
            flags: SyncFlags::default(),
        }
    }

    /// Replace the flags.
    #[must_use]
    pub fn with_flags(mut self, flags: SyncFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Workspace state.
    #[must_use]
    pub fn workspace(&self) -> &SyncWorkspace {
        &self.workspace
    }

    /// Run one pass.
    ///
    /// Collaborators are consulted first; stores are written only after
    /// every query has resolved. A pass that fails or is cancelled before
    /// that point leaves all stores untouched. Corrupted state is cleared so
    /// that the next pass is a full sync.
    ///
    /// # Errors
    ///
    /// - `SyncError::Cancelled` if `cancel` fires before the commit phase
    /// - `SyncError::Query` if a collaborator fails
    /// - `SyncError::Storage` or `SyncError::Graph` if state cannot be
    ///   read or written
    pub async fn execute(
        &self,
        scope: &SyncScope,
        config: &UniverseConfig,
        changed_files: &BTreeSet<String>,
        cancel: &CancellationToken,
    ) -> SyncResult<SyncOutcome> {
        let recovered = self.workspace.storage.take_recovered();
        if !recovered.is_empty() {
            warn!(
                "Recovered from corrupted regions {:?}, forcing full sync",
                recovered
            );
        }
        let full = scope.is_full() || !recovered.is_empty();
        info!("Starting {} sync pass", if full { &SyncScope::Full } else { scope });

        let result: SyncResult<SyncOutcome> = async {
            let gathered = self.gather(scope, config, changed_files, full, cancel).await?;
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            self.commit(scope, gathered, changed_files, recovered)
        }
        .await;

        if let Err(e) = &result
            && e.is_corruption()
        {
            warn!("Sync state corrupted ({}), clearing for a full sync", e);
            self.workspace.storage.clear_all()?;
            self.workspace.storage.save()?;
        }
        result
    }

    /// Run one pass and hand the outcome to `consumer`.
    ///
    /// # Errors
    ///
    /// Same as [`Self::execute`], plus whatever `consumer` reports.
    pub async fn run(
        &self,
        scope: &SyncScope,
        config: &UniverseConfig,
        changed_files: &BTreeSet<String>,
        cancel: &CancellationToken,
        consumer: &mut dyn DiffConsumer,
    ) -> SyncResult<SyncOutcome> {
        let outcome = self.execute(scope, config, changed_files, cancel).await?;
        consumer.consume(&outcome)?;
        Ok(outcome)
    }

    /// Build files transitively loading `paths`, from the persisted graph.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::Graph` if the graph cannot be read.
    pub fn affected_build_files(&self, paths: &BTreeSet<String>) -> SyncResult<BTreeSet<String>> {
        Ok(self.workspace.loads.affected_build_files(paths)?)
    }

    async fn gather(
        &self,
        scope: &SyncScope,
        config: &UniverseConfig,
        changed_files: &BTreeSet<String>,
        full: bool,
        cancel: &CancellationToken,
    ) -> SyncResult<Gathered> {
        let mode = self.flags.query_mode;
        let targets = &self.workspace.targets;
        let plan = self
            .workspace
            .universe
            .plan(config, full, self.query.as_ref(), mode, cancel)
            .await?;

        let hashes = if plan.first_sync || self.flags.use_target_hasher {
            let observations = cancellable(cancel, self.hasher.target_hashes(&config.scope)).await?;
            debug!("Received {} hash observations", observations.len());
            if plan.first_sync {
                Hashes::Replace(observations)
            } else {
                Hashes::Classified(targets.classify(observations)?)
            }
        } else {
            Hashes::Skipped
        };

        // Labels whose source files are re-queried: forced ones, new or
        // changed ones, and those defined in build files reached by the
        // changed files.
        let mut refresh = scope.forced().cloned().unwrap_or_default();
        let mut stale = BTreeSet::new();
        if !plan.first_sync {
            for build_file in self.workspace.loads.affected_build_files(changed_files)? {
                refresh.extend(targets.labels_for_path(&build_file)?);
            }
            match &hashes {
                Hashes::Classified(classification) => {
                    let diff = classification.diff();
                    refresh.extend(diff.added.iter().chain(&diff.changed).cloned());
                    stale.extend(classification.stale_paths().map(str::to_string));
                }
                Hashes::Skipped => {
                    for label in &plan.diff.removed {
                        if let Some(path) = targets.record(label)?.and_then(|r| r.path) {
                            let _ = stale.insert(path);
                        }
                    }
                }
                Hashes::Replace(_) => {}
            }
            // Removed labels keep no source files, even when their build
            // file was reached by a changed file.
            let removed = match &hashes {
                Hashes::Classified(classification) => Some(&classification.diff().removed),
                Hashes::Replace(_) | Hashes::Skipped => None,
            };
            refresh.retain(|label| {
                !plan.diff.removed.contains(label) && !removed.is_some_and(|r| r.contains(label))
            });
        }
        let mut loads = self
            .workspace
            .loads
            .compute_diff_from_universe_diff(
                &plan.diff,
                &refresh,
                plan.first_sync,
                self.query.as_ref(),
                mode,
                cancel,
            )
            .await?;
        loads.stale = stale;

        Ok(Gathered { plan, hashes, loads })
    }

    fn commit(
        &self,
        scope: &SyncScope,
        gathered: Gathered,
        changed_files: &BTreeSet<String>,
        recovered: Vec<String>,
    ) -> SyncResult<SyncOutcome> {
        let Gathered {
            plan,
            hashes,
            mut loads,
        } = gathered;
        let targets = &self.workspace.targets;

        self.workspace.universe.commit(&plan)?;

        let (mut diff, mut prior): (Diff, BTreeMap<Label, TargetRecord>) = match hashes {
            Hashes::Replace(observations) => {
                targets.replace_all(observations)?;
                (plan.diff.clone(), BTreeMap::new())
            }
            Hashes::Classified(classification) => {
                targets.apply(&classification, DiffMode::Incremental)?;
                let prior = classification
                    .diff()
                    .removed
                    .iter()
                    .chain(&classification.diff().changed)
                    .filter_map(|l| classification.prior(l).map(|r| (l.clone(), r.clone())))
                    .collect();
                (classification.diff().clone(), prior)
            }
            Hashes::Skipped => {
                let prior = targets.forget(&plan.diff.removed)?;
                (plan.diff.clone(), prior)
            }
        };

        if let Some(forced) = scope.forced() {
            for label in forced {
                if diff.kind_of(label).is_none()
                    && let Some(record) = targets.record(label)?
                {
                    let _ = prior.insert(label.clone(), record);
                    diff.force_changed([label]);
                }
            }
        }

        // Only build files left without any target are pruned.
        let mut orphaned = BTreeSet::new();
        for path in std::mem::take(&mut loads.stale) {
            if targets.labels_for_path(&path)?.is_empty() {
                let _ = orphaned.insert(path);
            }
        }
        loads.stale = orphaned;
        self.workspace.loads.apply(&loads)?;
        let affected_build_files = self.workspace.loads.affected_build_files(changed_files)?;
        self.workspace.storage.save()?;

        info!("Sync pass committed: {}", diff);
        Ok(SyncOutcome {
            first_sync: plan.first_sync,
            diff: SyncDiff::bake(&diff, &targets.current(), |l| prior.get(l).cloned()),
            affected_build_files,
            recovered,
        })
    }
}
