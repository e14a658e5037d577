use clap::Args;
use convenient_storage::StorageConfig;
use convenient_sync::{
    Label, OutcomeReport, QueryMode, SyncExecutor, SyncFlags, SyncResult, SyncScope, SyncWorkspace,
    TargetScope, UniverseConfig, WorkspaceSnapshot,
};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Args, Debug, Clone)]
pub struct SyncArgs {
    /// Workspace snapshot (JSON)
    #[arg(long, env = "GRAPH_SYNC_SNAPSHOT")]
    pub snapshot: PathBuf,

    /// Target patterns, in order; prefix with '-' to exclude
    #[arg(short, long = "pattern", default_value = "//...", allow_hyphen_values = true)]
    pub patterns: Vec<String>,

    /// Repositories treated as part of the workspace
    #[arg(long = "internal-repo")]
    pub internal_repos: Vec<String>,

    /// Recompute everything from cleared state
    #[arg(long, conflicts_with = "partial")]
    pub full: bool,

    /// Labels to report as changed regardless of their hash
    #[arg(long)]
    pub partial: Vec<String>,

    /// Files changed since the last pass
    #[arg(long)]
    pub changed: Vec<String>,

    /// Report only universe membership changes on incremental passes
    #[arg(long)]
    pub no_hasher: bool,

    /// Fail the pass if any target fails to evaluate
    #[arg(long)]
    pub fail_fast: bool,
}

impl SyncArgs {
    fn scope(&self) -> SyncResult<SyncScope> {
        if self.full {
            return Ok(SyncScope::Full);
        }
        if self.partial.is_empty() {
            return Ok(SyncScope::Incremental);
        }
        let labels = self
            .partial
            .iter()
            .map(|s| s.parse::<Label>())
            .collect::<Result<BTreeSet<_>, _>>()?;
        Ok(SyncScope::Partial(labels))
    }

    fn flags(&self) -> SyncFlags {
        SyncFlags {
            use_target_hasher: !self.no_hasher,
            query_mode: if self.fail_fast {
                QueryMode::FailFast
            } else {
                QueryMode::KeepGoing
            },
        }
    }
}

/// Run one sync pass against the snapshot and report the outcome.
pub async fn run(store: &Path, args: &SyncArgs, cancel: &CancellationToken) -> SyncResult<OutcomeReport> {
    let snapshot = Arc::new(WorkspaceSnapshot::from_json_file(&args.snapshot)?);
    let config = UniverseConfig::new(TargetScope::parse(&args.patterns)?)
        .with_internal_repos(args.internal_repos.iter().cloned());
    let scope = args.scope()?;
    let changed: BTreeSet<String> = args.changed.iter().cloned().collect();

    let workspace = SyncWorkspace::open(StorageConfig::at(store))?;
    let executor = SyncExecutor::new(workspace, snapshot.clone(), snapshot).with_flags(args.flags());
    let outcome = executor.execute(&scope, &config, &changed, cancel).await?;
    info!(
        "{} targets added, {} removed, {} changed",
        outcome.diff.added.len(),
        outcome.diff.removed.len(),
        outcome.diff.changed.len()
    );
    Ok(outcome.report()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn args(snapshot: PathBuf) -> SyncArgs {
        SyncArgs {
            snapshot,
            patterns: vec!["//...".to_string()],
            internal_repos: vec![],
            full: false,
            partial: vec![],
            changed: vec![],
            no_hasher: false,
            fail_fast: false,
        }
    }

    #[tokio::test]
    async fn test_sync_twice_reports_changes() {
        let dir = TempDir::new().unwrap();
        let snapshot = dir.path().join("snapshot.json");
        let store = dir.path().join("store");
        let cancel = CancellationToken::new();

        fs::write(&snapshot, r#"{"targets": [{"label": "//a:lib", "hash": "1", "path": "a/BUILD"}]}"#).unwrap();
        let report = run(&store, &args(snapshot.clone()), &cancel).await.unwrap();
        assert!(report.first_sync);
        assert_eq!(report.added.len(), 1);

        fs::write(&snapshot, r#"{"targets": [{"label": "//a:lib", "hash": "2", "path": "a/BUILD"}]}"#).unwrap();
        let report = run(&store, &args(snapshot), &cancel).await.unwrap();
        assert!(!report.first_sync);
        assert_eq!(report.changed.len(), 1);
        assert_eq!(report.changed[0].label.to_string(), "//a:lib");
    }

    #[test]
    fn test_scope_from_flags() {
        let mut a = args(PathBuf::from("s.json"));
        assert_eq!(a.scope().unwrap(), SyncScope::Incremental);
        a.partial = vec!["//a:x".to_string()];
        assert!(matches!(a.scope().unwrap(), SyncScope::Partial(labels) if labels.len() == 1));
        a.partial = vec!["not a label".to_string()];
        assert!(a.scope().is_err());
        a.full = true;
        assert_eq!(a.scope().unwrap(), SyncScope::Full);
    }
}
