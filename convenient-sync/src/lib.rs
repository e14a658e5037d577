//! Incremental sync engine for Bazel-like workspaces
//!
//! Tracks which build targets changed between sync passes so that only the
//! affected part of an IDE project model is recomputed. State lives in a
//! [`convenient_storage::StorageContext`] and survives restarts.
//!
//! # Components
//!
//! - [`TargetDiffService`]: added/removed/changed targets by content hash
//! - [`SyncUniverseService`]: the tracked target scope and its lifecycle
//! - [`StarlarkLoadTracker`]: which build files load a changed `.bzl` file
//! - [`SyncExecutor`]: one pass over all three, gather then commit
//!
//! The build tool is reached only through [`QueryExecutor`] and
//! [`HashContributor`]; [`WorkspaceSnapshot`] implements both from JSON.
//!
//! # Example
//!
//! ```
//! use convenient_sync::{
//!     SyncExecutor, SyncScope, SyncWorkspace, TargetScope, UniverseConfig, WorkspaceSnapshot,
//! };
//! use std::collections::BTreeSet;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let snapshot = Arc::new(WorkspaceSnapshot::from_json_str(r#"{
//!     "targets": [{"label": "//app:main", "hash": "v1", "path": "app/BUILD"}]
//! }"#)?);
//! let executor = SyncExecutor::new(SyncWorkspace::ephemeral()?, snapshot.clone(), snapshot);
//! let config = UniverseConfig::new(TargetScope::parse(["//..."])?);
//!
//! let outcome = executor
//!     .execute(&SyncScope::Incremental, &config, &BTreeSet::new(), &CancellationToken::new())
//!     .await?;
//! assert!(outcome.first_sync);
//! assert_eq!(outcome.diff.added.len(), 1);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(unused_results)]

mod diff;
mod error;
mod executor;
mod label;
mod load_graph;
mod pattern;
mod query;
mod snapshot;
mod target_diff;
mod universe;

pub use diff::{
    ChangedTarget, CurrentTargets, Diff, DiffKind, Observation, SyncDiff, TargetRecord,
    TargetRecordCodec, TargetRef,
};
pub use error::{SyncError, SyncResult};
pub use executor::{
    ChangedReport, OutcomeReport, SyncExecutor, SyncFlags, SyncOutcome, SyncScope, SyncWorkspace,
    TargetReport,
};
pub use label::{Label, LabelCodec, ParseLabelError};
pub use load_graph::{FileKind, FileNode, FileNodeCodec, LoadUpdate, StarlarkLoadGraph, StarlarkLoadTracker};
pub use pattern::{ParsePatternError, TargetPattern, TargetScope};
pub use query::{DiffConsumer, HashContributor, QueryError, QueryExecutor, QueryMode, SourceFileRecord};
pub use snapshot::{SnapshotTarget, WorkspaceSnapshot};
pub use target_diff::{Classification, DiffMode, TargetDiffService};
pub use universe::{
    SyncPhase, SyncUniverseService, UniverseConfig, UniversePlan, UniverseState, UniverseStateCodec,
};
