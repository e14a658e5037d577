//! graph-sync command-line interface
//!
//! - `sync`: run one sync pass against a workspace snapshot
//! - `affected`: list build files that transitively load the given files
//! - `diff`: run only the target diff over a list of observations

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub mod affected;
pub mod diff;
pub mod sync;

/// Incremental target sync for Bazel-like workspaces
#[derive(Parser)]
#[command(name = "graph-sync")]
#[command(about = "Incremental target sync for Bazel-like workspaces")]
#[command(version)]
pub struct Cli {
    /// Directory holding the persisted sync state
    #[arg(long, global = true, default_value = ".graph-sync", env = "GRAPH_SYNC_STORE")]
    pub store: PathBuf,

    /// Print debug information
    #[arg(short, long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one sync pass and print the outcome as JSON
    Sync(sync::SyncArgs),

    /// Print build files that transitively load the given files
    Affected(affected::AffectedArgs),

    /// Diff observations against the stored target fingerprints
    Diff(diff::DiffArgs),
}
