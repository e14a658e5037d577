//! Sync universe: the tracked target scope and its lifecycle.

use convenient_storage::codec::{
    Codec, CodecBuffer, CodecContext, CodecError, CodecResult, SortedMapCodec, SortedSetCodec,
    StringCodec, VecCodec, VersionedCodec,
};
use convenient_storage::{FlatStorage, StorageContext, StorageResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::diff::Diff;
use crate::error::SyncResult;
use crate::label::Label;
use crate::pattern::{TargetPattern, TargetScope};
use crate::query::{cancellable, QueryExecutor, QueryMode};

const UNIVERSE_REGION: &str = "universe";
const UNIVERSE_FORMAT: u16 = 1;

/// Lifecycle phase of a workspace's universe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SyncPhase {
    /// No sync has committed yet
    #[default]
    BeforeFirstSync,
    /// At least one sync has committed
    AfterFirstSync,
}

/// Scope configuration a sync pass runs with.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UniverseConfig {
    /// Ordered include/exclude patterns
    pub scope: TargetScope,
    /// Repositories treated as part of the workspace
    #[serde(default)]
    pub internal_repos: BTreeSet<String>,
}

impl UniverseConfig {
    /// Configuration over `scope` with no internal repositories.
    #[must_use]
    pub fn new(scope: TargetScope) -> Self {
        Self {
            scope,
            internal_repos: BTreeSet::new(),
        }
    }

    /// Add internal repositories.
    #[must_use]
    pub fn with_internal_repos<I, S>(mut self, repos: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.internal_repos.extend(repos.into_iter().map(Into::into));
        self
    }
}

/// Persisted universe. Replaced wholesale, never patched.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UniverseState {
    /// Patterns the universe was computed for
    pub scope: TargetScope,
    /// Internal repositories under that scope
    pub internal_repos: BTreeSet<String>,
    /// Apparent-to-canonical repository names
    pub repo_mapping: BTreeMap<String, String>,
    /// Lifecycle phase
    pub phase: SyncPhase,
}

/// Codec for [`UniverseState`]. Patterns are stored in canonical text form.
#[derive(Debug, Clone, Copy, Default)]
pub struct UniverseStateCodec;

impl Codec for UniverseStateCodec {
    type Value = UniverseState;

    fn encode(&self, ctx: &CodecContext, buf: &mut CodecBuffer, value: &UniverseState) -> CodecResult<()> {
        let patterns: Vec<String> = value.scope.patterns().iter().map(ToString::to_string).collect();
        VecCodec::new(StringCodec).encode(ctx, buf, &patterns)?;
        SortedSetCodec::new(StringCodec).encode(ctx, buf, &value.internal_repos)?;
        SortedMapCodec::new(StringCodec, StringCodec).encode(ctx, buf, &value.repo_mapping)?;
        buf.write_u8(match value.phase {
            SyncPhase::BeforeFirstSync => 0,
            SyncPhase::AfterFirstSync => 1,
        });
        Ok(())
    }

    fn decode(&self, ctx: &CodecContext, buf: &mut CodecBuffer) -> CodecResult<UniverseState> {
        let patterns = VecCodec::new(StringCodec)
            .decode(ctx, buf)?
            .iter()
            .map(|p| p.parse::<TargetPattern>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| CodecError::InvalidValue(e.to_string()))?;
        let internal_repos = SortedSetCodec::new(StringCodec).decode(ctx, buf)?;
        let repo_mapping = SortedMapCodec::new(StringCodec, StringCodec).decode(ctx, buf)?;
        let phase = match buf.read_u8()? {
            0 => SyncPhase::BeforeFirstSync,
            1 => SyncPhase::AfterFirstSync,
            tag => return Err(CodecError::InvalidTag { kind: "SyncPhase", tag }),
        };
        Ok(UniverseState {
            scope: TargetScope::new(patterns),
            internal_repos,
            repo_mapping,
            phase,
        })
    }
}

/// Universe diff computed for one pass, not yet persisted.
#[derive(Debug, Clone)]
pub struct UniversePlan {
    /// Membership changes of the target universe
    pub diff: Diff,
    /// State to persist once the pass commits
    pub next_state: UniverseState,
    /// Whether the universe was computed from scratch
    pub first_sync: bool,
}

/// Owns the persisted [`UniverseState`] of one workspace.
#[derive(Debug, Clone)]
pub struct SyncUniverseService {
    state: FlatStorage<UniverseState>,
}

impl SyncUniverseService {
    /// Open the universe region in `ctx`.
    ///
    /// # Errors
    ///
    /// Returns a `StorageError` if the region cannot be opened.
    pub fn open(ctx: &StorageContext) -> StorageResult<Self> {
        Ok(Self {
            state: ctx.flat_store(
                UNIVERSE_REGION,
                VersionedCodec::new(UNIVERSE_FORMAT, UniverseStateCodec),
                UniverseState::default,
            )?,
        })
    }

    /// Persisted state, or a fresh one before the first sync.
    ///
    /// # Errors
    ///
    /// Returns a `StorageError` if the state cannot be read.
    pub fn state(&self) -> StorageResult<UniverseState> {
        self.state.get()
    }

    /// Current lifecycle phase.
    ///
    /// # Errors
    ///
    /// Returns a `StorageError` if the state cannot be read.
    pub fn phase(&self) -> StorageResult<SyncPhase> {
        Ok(self.state.get()?.phase)
    }

    /// Compute the universe diff for `config` without persisting it.
    ///
    /// Before the first sync, or when `full` is set, every target in scope
    /// is added. Afterwards an unchanged pattern list yields an empty diff
    /// and a changed one yields the membership difference between the old
    /// and new scope. The repository mapping is re-queried only when the
    /// internal repositories changed.
    ///
    /// # Errors
    ///
    /// - `SyncError::Cancelled` if `cancel` fires first
    /// - `SyncError::Query` if the query executor fails
    /// - `SyncError::Storage` if the state cannot be read
    pub async fn plan(
        &self,
        config: &UniverseConfig,
        full: bool,
        query: &dyn QueryExecutor,
        mode: QueryMode,
        cancel: &CancellationToken,
    ) -> SyncResult<UniversePlan> {
        let current = self.state.get()?;

        if full || current.phase == SyncPhase::BeforeFirstSync {
            let targets = cancellable(cancel, query.query_targets(&config.scope, mode)).await?;
            let repo_mapping = cancellable(cancel, query.repo_mapping(&config.internal_repos)).await?;
            info!(
                "Universe computed from scratch: {} targets for '{}'",
                targets.len(),
                config.scope
            );
            return Ok(UniversePlan {
                diff: Diff::all_added(targets),
                next_state: Self::next_state(config, repo_mapping),
                first_sync: true,
            });
        }

        let repo_mapping = if current.internal_repos == config.internal_repos {
            current.repo_mapping.clone()
        } else {
            debug!("Internal repositories changed, refreshing repository mapping");
            cancellable(cancel, query.repo_mapping(&config.internal_repos)).await?
        };

        let diff = if current.scope == config.scope {
            debug!("Universe patterns unchanged");
            Diff::default()
        } else {
            let old = cancellable(cancel, query.query_targets(&current.scope, mode)).await?;
            let new = cancellable(cancel, query.query_targets(&config.scope, mode)).await?;
            let diff = membership_diff(&old, &new);
            info!(
                "Universe changed from '{}' to '{}': {}",
                current.scope, config.scope, diff
            );
            diff
        };

        Ok(UniversePlan {
            diff,
            next_state: Self::next_state(config, repo_mapping),
            first_sync: false,
        })
    }

    /// Persist a plan's state.
    ///
    /// # Errors
    ///
    /// Returns a `StorageError` if the state cannot be written.
    pub fn commit(&self, plan: &UniversePlan) -> StorageResult<()> {
        self.state.set(&plan.next_state)
    }

    /// Plan and commit in one step.
    ///
    /// # Errors
    ///
    /// Same as [`Self::plan`] and [`Self::commit`].
    pub async fn compute_universe_diff(
        &self,
        config: &UniverseConfig,
        full: bool,
        query: &dyn QueryExecutor,
        mode: QueryMode,
        cancel: &CancellationToken,
    ) -> SyncResult<Diff> {
        let plan = self.plan(config, full, query, mode, cancel).await?;
        self.commit(&plan)?;
        Ok(plan.diff)
    }

    /// Forget the universe; the next pass is a first sync.
    ///
    /// # Errors
    ///
    /// Returns a `StorageError` if the state cannot be cleared.
    pub fn reset(&self) -> StorageResult<()> {
        self.state.reset()
    }

    fn next_state(config: &UniverseConfig, repo_mapping: BTreeMap<String, String>) -> UniverseState {
        UniverseState {
            scope: config.scope.clone(),
            internal_repos: config.internal_repos.clone(),
            repo_mapping,
            phase: SyncPhase::AfterFirstSync,
        }
    }
}

fn membership_diff(old: &BTreeSet<Label>, new: &BTreeSet<Label>) -> Diff {
    Diff {
        added: new.difference(old).cloned().collect(),
        removed: old.difference(new).cloned().collect(),
        changed: BTreeSet::new(),
    }
}
