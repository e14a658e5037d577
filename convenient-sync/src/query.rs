//! Collaborator seams: the query executor, hash contributor and diff consumer.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::diff::Observation;
use crate::error::{SyncError, SyncResult};
use crate::executor::SyncOutcome;
use crate::label::Label;
use crate::load_graph::FileKind;
use crate::pattern::TargetScope;

/// How the query executor treats partial failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueryMode {
    /// Return what could be evaluated; only a total failure is an error
    #[default]
    KeepGoing,
    /// Any failing target fails the whole query
    FailFast,
}

/// Errors reported by external collaborators
#[derive(Error, Debug)]
pub enum QueryError {
    /// The query could not be evaluated at all
    #[error("Query for '{scope}' failed: {reason}")]
    Failed {
        /// Scope that was queried
        scope: String,
        /// Collaborator-provided reason
        reason: String,
    },

    /// Some targets failed and the mode does not allow partial results
    #[error("Query for '{scope}' failed for {count} targets")]
    Partial {
        /// Scope that was queried
        scope: String,
        /// Number of failing targets
        count: usize,
    },

    /// The collaborator is not available
    #[error("Collaborator unavailable: {0}")]
    Unavailable(String),
}

/// One build-relevant source file reachable from a target set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFileRecord {
    /// Workspace-relative path
    pub path: String,
    /// Role of the file
    pub kind: FileKind,
    /// Paths of the files this one loads
    #[serde(default)]
    pub loads: Vec<String>,
}

/// Evaluates target-scope queries against the build tool.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    /// Labels currently matching `scope`.
    async fn query_targets(&self, scope: &TargetScope, mode: QueryMode) -> Result<BTreeSet<Label>, QueryError>;

    /// Source files reachable from `labels`.
    async fn source_files(
        &self,
        labels: &BTreeSet<Label>,
        mode: QueryMode,
    ) -> Result<Vec<SourceFileRecord>, QueryError>;

    /// Apparent-to-canonical name mapping for `repos`.
    async fn repo_mapping(&self, repos: &BTreeSet<String>) -> Result<BTreeMap<String, String>, QueryError>;
}

/// Produces one content fingerprint per target in scope.
#[async_trait]
pub trait HashContributor: Send + Sync {
    /// Observations for every target in `scope`.
    async fn target_hashes(&self, scope: &TargetScope) -> Result<Vec<Observation>, QueryError>;
}

/// Turns a computed diff into downstream state.
pub trait DiffConsumer {
    /// Handle one committed sync outcome.
    ///
    /// # Errors
    ///
    /// Returns a `SyncError` if the outcome could not be consumed; stores
    /// are already committed at this point.
    fn consume(&mut self, outcome: &SyncOutcome) -> SyncResult<()>;
}

/// Await `fut` unless `cancel` fires first.
pub(crate) async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> SyncResult<T>
where
    F: Future<Output = Result<T, QueryError>>,
{
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(SyncError::Cancelled),
        result = fut => result.map_err(SyncError::from),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancellable_prefers_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = cancellable(&cancel, async { Ok::<_, QueryError>(1) }).await;
        assert!(matches!(result, Err(SyncError::Cancelled)));
    }

    #[tokio::test]
    async fn test_cancellable_interrupts_pending_call() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let _ = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        let result = cancellable(&cancel, async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, QueryError>(())
        })
        .await;
        assert!(matches!(result, Err(SyncError::Cancelled)));
    }

    #[tokio::test]
    async fn test_cancellable_maps_failure() {
        let cancel = CancellationToken::new();
        let result: SyncResult<()> = cancellable(&cancel, async {
            Err(QueryError::Unavailable("bazel".to_string()))
        })
        .await;
        assert!(matches!(result, Err(SyncError::Query(QueryError::Unavailable(_)))));
    }

    #[test]
    fn test_source_record_json() {
        let record: SourceFileRecord =
            serde_json::from_str(r#"{"path":"a/BUILD","kind":"build","loads":["a/defs.bzl"]}"#).unwrap();
        assert_eq!(record.kind, FileKind::Build);
        assert_eq!(record.loads, vec!["a/defs.bzl".to_string()]);
    }
}
