use clap::Args;
use convenient_storage::StorageConfig;
use convenient_sync::{Diff, DiffMode, SnapshotTarget, SyncError, SyncResult, SyncWorkspace};
use std::path::{Path, PathBuf};

#[derive(Args, Debug, Clone)]
pub struct DiffArgs {
    /// JSON array of targets with label, hash and path
    #[arg(long)]
    pub observations: PathBuf,

    /// Replace all stored fingerprints instead of updating them
    #[arg(long)]
    pub full: bool,
}

/// Diff the observations file against the stored fingerprints and persist it.
pub fn run(store: &Path, args: &DiffArgs) -> SyncResult<Diff> {
    let json = std::fs::read_to_string(&args.observations).map_err(|source| SyncError::SnapshotIo {
        path: args.observations.display().to_string(),
        source,
    })?;
    let targets: Vec<SnapshotTarget> = serde_json::from_str(&json)?;

    let workspace = SyncWorkspace::open(StorageConfig::at(store))?;
    let mode = if args.full { DiffMode::Full } else { DiffMode::Incremental };
    let diff = workspace
        .targets()
        .compute_diff(targets.iter().map(SnapshotTarget::observation), mode)?;
    workspace.storage().save()?;
    Ok(diff)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_diff_persists_between_runs() {
        let dir = TempDir::new().unwrap();
        let observations = dir.path().join("obs.json");
        let store = dir.path().join("store");
        let args = DiffArgs {
            observations: observations.clone(),
            full: false,
        };

        fs::write(
            &observations,
            r#"[{"label": "//a:lib", "hash": "H1"}, {"label": "//b:lib", "hash": "H2"}]"#,
        )
        .unwrap();
        assert_eq!(run(&store, &args).unwrap().added.len(), 2);
        assert!(run(&store, &args).unwrap().is_empty());

        fs::write(&observations, r#"[{"label": "//a:lib", "hash": "H1"}]"#).unwrap();
        let diff = run(&store, &args).unwrap();
        assert_eq!(diff.removed.len(), 1);
        assert_eq!(diff.len(), 1);
    }

    #[test]
    fn test_invalid_observations() {
        let dir = TempDir::new().unwrap();
        let observations = dir.path().join("obs.json");
        fs::write(&observations, r#"[{"label": "nope", "hash": "1"}]"#).unwrap();
        let args = DiffArgs {
            observations,
            full: true,
        };
        assert!(matches!(
            run(&dir.path().join("store"), &args),
            Err(SyncError::SnapshotFormat(_))
        ));
    }
}
