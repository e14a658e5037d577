use clap::Args;
use convenient_storage::StorageConfig;
use convenient_sync::{SyncResult, SyncWorkspace};
use std::collections::BTreeSet;
use std::path::Path;

#[derive(Args, Debug, Clone)]
pub struct AffectedArgs {
    /// Workspace-relative file paths
    #[arg(required = true)]
    pub paths: Vec<String>,
}

/// Build files transitively loading any of the given paths.
pub fn run(store: &Path, args: &AffectedArgs) -> SyncResult<BTreeSet<String>> {
    let workspace = SyncWorkspace::open(StorageConfig::at(store))?;
    Ok(workspace.loads().affected_build_files(&args.paths)?)
}
