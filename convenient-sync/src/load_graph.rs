//! Starlark load graph: which build files transitively load a source file.
//!
//! Edges point from the loading file to the loaded file, so an
//! [`Direction::Upward`] traversal from a changed `.bzl` file reaches every
//! file that loads it.

use convenient_graph::{Direction, GraphResult, GraphVertex, PersistentGraph, VertexId, Visit};
use convenient_storage::codec::{Codec, CodecBuffer, CodecContext, CodecError, CodecResult, StringCodec};
use convenient_storage::{StorageContext, StorageHint};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::diff::Diff;
use crate::error::SyncResult;
use crate::label::Label;
use crate::query::{cancellable, QueryExecutor, QueryMode, SourceFileRecord};

const GRAPH_NAME: &str = "starlark-loads";

/// Role of a source file in the load graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    /// Package build definition (`BUILD`, `BUILD.bazel`)
    Build,
    /// Workspace root definition (`WORKSPACE`, `MODULE.bazel`)
    Workspace,
    /// Any file reached through `load()`
    Loaded,
}

impl FileKind {
    fn tag(self) -> u8 {
        match self {
            Self::Build => 0,
            Self::Workspace => 1,
            Self::Loaded => 2,
        }
    }
}

/// One file vertex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileNode {
    /// Workspace-relative path
    pub path: String,
    /// Role of the file
    pub kind: FileKind,
}

impl FileNode {
    /// Vertex id of `path`.
    #[must_use]
    pub fn id_of(path: &str) -> VertexId {
        VertexId::of(path.as_bytes())
    }
}

impl GraphVertex for FileNode {
    fn vertex_id(&self) -> VertexId {
        Self::id_of(&self.path)
    }
}

/// Codec for [`FileNode`]: path then kind tag.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileNodeCodec;

impl Codec for FileNodeCodec {
    type Value = FileNode;

    fn encode(&self, ctx: &CodecContext, buf: &mut CodecBuffer, value: &FileNode) -> CodecResult<()> {
        StringCodec.encode(ctx, buf, &value.path)?;
        buf.write_u8(value.kind.tag());
        Ok(())
    }

    fn decode(&self, ctx: &CodecContext, buf: &mut CodecBuffer) -> CodecResult<FileNode> {
        let path = StringCodec.decode(ctx, buf)?;
        let kind = match buf.read_u8()? {
            0 => FileKind::Build,
            1 => FileKind::Workspace,
            2 => FileKind::Loaded,
            tag => return Err(CodecError::InvalidTag { kind: "FileKind", tag }),
        };
        Ok(FileNode { path, kind })
    }
}

/// Persistent file load graph.
#[derive(Debug, Clone)]
pub struct StarlarkLoadGraph {
    graph: PersistentGraph<FileNode>,
}

impl StarlarkLoadGraph {
    /// Open the load graph in `ctx`.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::Storage` if a region cannot be opened.
    pub fn open(ctx: &StorageContext) -> GraphResult<Self> {
        Ok(Self {
            graph: PersistentGraph::open(ctx, GRAPH_NAME, Some(StorageHint::Paged), FileNodeCodec)?,
        })
    }

    /// Underlying graph.
    #[must_use]
    pub fn graph(&self) -> &PersistentGraph<FileNode> {
        &self.graph
    }

    /// Tracked node for `path`.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::Storage` if the graph cannot be read.
    pub fn file(&self, path: &str) -> GraphResult<Option<FileNode>> {
        self.graph.vertex(FileNode::id_of(path))
    }

    /// Insert or update a file and replace its outgoing load edges.
    ///
    /// Load targets not yet tracked are added as [`FileKind::Loaded`].
    /// Loaded files that lose their last loader are dropped.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::Storage` if the graph cannot be written.
    pub fn set_file(&self, path: &str, kind: FileKind, loads: &[String]) -> GraphResult<()> {
        let id = self.graph.add_vertex(&FileNode {
            path: path.to_string(),
            kind,
        })?;
        let previous = self.graph.successors(id)?;
        let _ = self.graph.remove_outgoing_edges(id)?;
        for loaded in loads {
            let target = FileNode::id_of(loaded);
            if !self.graph.contains(target)? {
                let _ = self.graph.add_vertex(&FileNode {
                    path: loaded.clone(),
                    kind: FileKind::Loaded,
                })?;
            }
            self.graph.add_edge(id, target)?;
        }
        let _ = self.drop_orphans(previous.into_iter().collect())?;
        Ok(())
    }

    /// Stop tracking the build files at `paths`, along with every loaded
    /// file no remaining file loads. Returns the number of files dropped.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::Storage` if the graph cannot be written.
    pub fn prune_files<'a, I>(&self, paths: I) -> GraphResult<usize>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut dropped = 0;
        let mut pending = Vec::new();
        for path in paths {
            let id = FileNode::id_of(path);
            let loads = self.graph.successors(id)?;
            if self.graph.remove_vertex(id)? {
                dropped += 1;
                pending.extend(loads);
            }
        }
        dropped += self.drop_orphans(pending)?;
        if dropped > 0 {
            debug!("Pruned {} files from the load graph", dropped);
        }
        Ok(dropped)
    }

    fn drop_orphans(&self, mut pending: Vec<VertexId>) -> GraphResult<usize> {
        let mut dropped = 0;
        while let Some(id) = pending.pop() {
            let Some(node) = self.graph.vertex(id)? else {
                continue;
            };
            if node.kind != FileKind::Loaded || !self.graph.predecessors(id)?.is_empty() {
                continue;
            }
            let loads = self.graph.successors(id)?;
            if self.graph.remove_vertex(id)? {
                dropped += 1;
                pending.extend(loads);
            }
        }
        Ok(dropped)
    }

    /// Stop tracking `path` and its edges.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::Storage` if the graph cannot be written.
    pub fn remove_file(&self, path: &str) -> GraphResult<bool> {
        self.graph.remove_vertex(FileNode::id_of(path))
    }

    /// Build files that transitively load `path`, in traversal order.
    ///
    /// Expansion stops at each build file found. An untracked path yields
    /// an empty list.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::Storage` if the graph cannot be read.
    pub fn build_predecessors(&self, path: &str) -> GraphResult<Vec<FileNode>> {
        let root = FileNode::id_of(path);
        if !self.graph.contains(root)? {
            return Ok(Vec::new());
        }
        let mut found = Vec::new();
        let _ = self.graph.traverse([root], Direction::Upward, |_, node| {
            if node.kind == FileKind::Build {
                found.push(node.clone());
                Visit::Skip
            } else {
                Visit::Continue
            }
        })?;
        Ok(found)
    }

    /// Union of [`Self::build_predecessors`] over `paths`.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::Storage` if the graph cannot be read.
    pub fn affected_build_files<'a, I>(&self, paths: I) -> GraphResult<BTreeSet<String>>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut affected = BTreeSet::new();
        for path in paths {
            affected.extend(self.build_predecessors(path)?.into_iter().map(|node| node.path));
        }
        Ok(affected)
    }

    /// Number of tracked files.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::Storage` if the graph cannot be read.
    pub fn file_count(&self) -> GraphResult<usize> {
        self.graph.vertex_count()
    }

    /// Drop every file and edge.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::Storage` if the graph cannot be cleared.
    pub fn clear(&self) -> GraphResult<()> {
        self.graph.clear()
    }
}

/// Source files gathered for one pass, applied in the commit phase.
#[derive(Debug, Clone, Default)]
pub struct LoadUpdate {
    /// Clear the graph before applying
    pub rebuild: bool,
    /// Files to insert or refresh
    pub files: Vec<SourceFileRecord>,
    /// Build files no target originates from any more
    pub stale: BTreeSet<String>,
}

/// Keeps the load graph in step with the target universe.
#[derive(Debug, Clone)]
pub struct StarlarkLoadTracker {
    graph: StarlarkLoadGraph,
}

impl StarlarkLoadTracker {
    /// Open the tracker's graph in `ctx`.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::Storage` if a region cannot be opened.
    pub fn open(ctx: &StorageContext) -> GraphResult<Self> {
        Ok(Self {
            graph: StarlarkLoadGraph::open(ctx)?,
        })
    }

    /// Tracked load graph.
    #[must_use]
    pub fn graph(&self) -> &StarlarkLoadGraph {
        &self.graph
    }

    /// Gather the source files behind a universe diff.
    ///
    /// On a rebuild every added label is queried; otherwise the added
    /// labels and `refresh` are. Removed labels need no query; the caller
    /// fills [`LoadUpdate::stale`] with their build files. Nothing is
    /// written.
    ///
    /// # Errors
    ///
    /// - `SyncError::Cancelled` if `cancel` fires first
    /// - `SyncError::Query` if the query executor fails
    pub async fn compute_diff_from_universe_diff(
        &self,
        universe_diff: &Diff,
        refresh: &BTreeSet<Label>,
        rebuild: bool,
        query: &dyn QueryExecutor,
        mode: QueryMode,
        cancel: &CancellationToken,
    ) -> SyncResult<LoadUpdate> {
        let mut labels = universe_diff.added.clone();
        if !rebuild {
            labels.extend(refresh.iter().cloned());
        }
        if labels.is_empty() && !rebuild {
            debug!("Load graph unchanged by universe diff");
            return Ok(LoadUpdate::default());
        }
        let files = cancellable(cancel, query.source_files(&labels, mode)).await?;
        debug!("Gathered {} source files for {} labels", files.len(), labels.len());
        Ok(LoadUpdate {
            rebuild,
            files,
            stale: BTreeSet::new(),
        })
    }

    /// Write a gathered update to the graph.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::Storage` if the graph cannot be written.
    pub fn apply(&self, update: &LoadUpdate) -> GraphResult<()> {
        if update.rebuild {
            self.graph.clear()?;
        }
        for file in &update.files {
            self.graph.set_file(&file.path, file.kind, &file.loads)?;
        }
        let mut pruned = 0;
        if !update.rebuild {
            let refreshed: BTreeSet<&str> = update.files.iter().map(|f| f.path.as_str()).collect();
            pruned = self
                .graph
                .prune_files(update.stale.iter().filter(|p| !refreshed.contains(p.as_str())))?;
        }
        if update.rebuild || !update.files.is_empty() || pruned > 0 {
            info!(
                "Load graph {}: {} files applied, {} pruned, {} tracked",
                if update.rebuild { "rebuilt" } else { "updated" },
                update.files.len(),
                pruned,
                self.graph.file_count()?
            );
        }
        Ok(())
    }

    /// Build files affected by changes to `paths`.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::Storage` if the graph cannot be read.
    pub fn affected_build_files<'a, I>(&self, paths: I) -> GraphResult<BTreeSet<String>>
    where
        I: IntoIterator<Item = &'a String>,
    {
        self.graph.affected_build_files(paths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convenient_storage::codec::{decode_from_slice, encode_to_bytes};

    fn graph() -> StarlarkLoadGraph {
        StarlarkLoadGraph::open(&StorageContext::ephemeral()).unwrap()
    }

    fn loads(paths: &[&str]) -> Vec<String> {
        paths.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_build_predecessors_stops_at_build_file() {
        let graph = graph();
        graph.set_file("c.bzl", FileKind::Loaded, &[]).unwrap();
        graph.set_file("b.bzl", FileKind::Loaded, &loads(&["c.bzl"])).unwrap();
        graph.set_file("BUILD", FileKind::Build, &loads(&["b.bzl"])).unwrap();
        // A build file never loads another, but the traversal must not
        // reach past BUILD even if the graph says otherwise.
        graph.set_file("outer/BUILD", FileKind::Build, &loads(&["BUILD"])).unwrap();

        let found = graph.build_predecessors("c.bzl").unwrap();
        assert_eq!(
            found,
            vec![FileNode {
                path: "BUILD".to_string(),
                kind: FileKind::Build
            }]
        );
    }

    #[test]
    fn test_untracked_file_has_no_predecessors() {
        assert!(graph().build_predecessors("nowhere.bzl").unwrap().is_empty());
    }

    #[test]
    fn test_changed_build_file_affects_itself() {
        let graph = graph();
        graph.set_file("a/BUILD", FileKind::Build, &loads(&["defs.bzl"])).unwrap();
        let affected = graph.affected_build_files(&loads(&["a/BUILD"])).unwrap();
        assert_eq!(affected, BTreeSet::from(["a/BUILD".to_string()]));
    }

    #[test]
    fn test_shared_macro_affects_every_loader() {
        let graph = graph();
        graph.set_file("a/BUILD", FileKind::Build, &loads(&["defs.bzl"])).unwrap();
        graph.set_file("b/BUILD", FileKind::Build, &loads(&["defs.bzl", "b/local.bzl"])).unwrap();
        let affected = graph.affected_build_files(&loads(&["defs.bzl", "b/local.bzl"])).unwrap();
        assert_eq!(
            affected,
            BTreeSet::from(["a/BUILD".to_string(), "b/BUILD".to_string()])
        );
    }

    #[test]
    fn test_mutual_loads_terminate() {
        let graph = graph();
        graph.set_file("x.bzl", FileKind::Loaded, &loads(&["y.bzl"])).unwrap();
        graph.set_file("y.bzl", FileKind::Loaded, &loads(&["x.bzl"])).unwrap();
        graph.set_file("BUILD", FileKind::Build, &loads(&["x.bzl"])).unwrap();
        assert_eq!(graph.build_predecessors("y.bzl").unwrap().len(), 1);
    }

    #[test]
    fn test_set_file_replaces_loads() {
        let graph = graph();
        graph.set_file("BUILD", FileKind::Build, &loads(&["old.bzl"])).unwrap();
        graph.set_file("BUILD", FileKind::Build, &loads(&["new.bzl"])).unwrap();
        assert!(graph.build_predecessors("old.bzl").unwrap().is_empty());
        assert!(graph.file("old.bzl").unwrap().is_none());
        assert_eq!(graph.build_predecessors("new.bzl").unwrap().len(), 1);
        // Loaded placeholder does not demote an existing build file.
        graph.set_file("other.bzl", FileKind::Loaded, &loads(&["BUILD"])).unwrap();
        assert_eq!(graph.file("BUILD").unwrap().unwrap().kind, FileKind::Build);
    }

    #[test]
    fn test_file_node_codec() {
        let ctx = CodecContext::default();
        let node = FileNode {
            path: "MODULE.bazel".to_string(),
            kind: FileKind::Workspace,
        };
        let bytes = encode_to_bytes(&FileNodeCodec, &ctx, &node).unwrap();
        assert_eq!(decode_from_slice(&FileNodeCodec, &ctx, &bytes).unwrap(), node);

        let mut bad = bytes.to_vec();
        if let Some(last) = bad.last_mut() {
            *last = 9;
        }
        assert!(decode_from_slice(&FileNodeCodec, &ctx, &bad).is_err());
    }

    #[test]
    fn test_tracker_apply_rebuild_clears() {
        let tracker = StarlarkLoadTracker::open(&StorageContext::ephemeral()).unwrap();
        tracker
            .apply(&LoadUpdate {
                rebuild: false,
                files: vec![SourceFileRecord {
                    path: "stale/BUILD".to_string(),
                    kind: FileKind::Build,
                    loads: vec![],
                }],
                ..LoadUpdate::default()
            })
            .unwrap();
        tracker
            .apply(&LoadUpdate {
                rebuild: true,
                files: vec![SourceFileRecord {
                    path: "a/BUILD".to_string(),
                    kind: FileKind::Build,
                    loads: vec!["a/defs.bzl".to_string()],
                }],
                ..LoadUpdate::default()
            })
            .unwrap();
        assert!(tracker.graph().file("stale/BUILD").unwrap().is_none());
        assert_eq!(tracker.graph().file_count().unwrap(), 2);
    }

    #[test]
    fn test_prune_keeps_shared_loads() {
        let graph = graph();
        graph.set_file("a/BUILD", FileKind::Build, &loads(&["defs.bzl"])).unwrap();
        graph.set_file("b/BUILD", FileKind::Build, &loads(&["defs.bzl", "b/local.bzl"])).unwrap();
        graph.set_file("b/local.bzl", FileKind::Loaded, &loads(&["b/deep.bzl"])).unwrap();

        let dropped = graph.prune_files(&loads(&["b/BUILD", "gone/BUILD"])).unwrap();
        assert_eq!(dropped, 3);
        assert!(graph.file("b/BUILD").unwrap().is_none());
        assert!(graph.file("b/local.bzl").unwrap().is_none());
        assert!(graph.file("b/deep.bzl").unwrap().is_none());
        assert_eq!(
            graph.affected_build_files(&loads(&["defs.bzl"])).unwrap(),
            BTreeSet::from(["a/BUILD".to_string()])
        );
    }

    #[test]
    fn test_tracker_apply_skips_refreshed_stale_files() {
        let tracker = StarlarkLoadTracker::open(&StorageContext::ephemeral()).unwrap();
        let build = |path: &str| SourceFileRecord {
            path: path.to_string(),
            kind: FileKind::Build,
            loads: vec!["defs.bzl".to_string()],
        };
        tracker
            .apply(&LoadUpdate {
                files: vec![build("a/BUILD"), build("b/BUILD")],
                ..LoadUpdate::default()
            })
            .unwrap();
        tracker
            .apply(&LoadUpdate {
                rebuild: false,
                files: vec![build("a/BUILD")],
                stale: BTreeSet::from(["a/BUILD".to_string(), "b/BUILD".to_string()]),
            })
            .unwrap();
        assert!(tracker.graph().file("a/BUILD").unwrap().is_some());
        assert!(tracker.graph().file("b/BUILD").unwrap().is_none());
        assert_eq!(tracker.graph().file_count().unwrap(), 2);
    }
}
