//! Persistent directed graph for incremental dependency tracking.
//!
//! This crate provides a directed graph stored in three key/value regions
//! of a [`StorageContext`], so that it survives between runs:
//! - vertex id to vertex payload
//! - vertex id to successor ids
//! - vertex id to predecessor ids
//!
//! Vertices are keyed by a 128-bit id derived from their identity (see
//! [`GraphVertex`]); the payload itself is only loaded when visited.
//!
//! # Features
//!
//! - Upsert of vertices, insertion and removal of edges
//! - Removing a vertex prunes it from every neighbor
//! - Ordered traversal in either direction with `Continue`/`Skip`/`Stop`
//! - Dangling ids are treated as absent, never as errors
//! - Cycle reporting for diagnostics
//!
//! # Example
//!
//! ```
//! use convenient_graph::{Direction, GraphVertex, PersistentGraph, VertexId, Visit};
//! use convenient_storage::codec::StringCodec;
//! use convenient_storage::StorageContext;
//!
//! struct File(String);
//! # impl GraphVertex for File {
//! #     fn vertex_id(&self) -> VertexId { VertexId::of(self.0.as_bytes()) }
//! # }
//! # use convenient_storage::codec::{Codec, CodecBuffer, CodecContext, CodecResult};
//! # struct FileCodec;
//! # impl Codec for FileCodec {
//! #     type Value = File;
//! #     fn encode(&self, ctx: &CodecContext, buf: &mut CodecBuffer, v: &File) -> CodecResult<()> {
//! #         StringCodec.encode(ctx, buf, &v.0)
//! #     }
//! #     fn decode(&self, ctx: &CodecContext, buf: &mut CodecBuffer) -> CodecResult<File> {
//! #         StringCodec.decode(ctx, buf).map(File)
//! #     }
//! # }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let ctx = StorageContext::ephemeral();
//! let graph = PersistentGraph::open(&ctx, "files", None, FileCodec)?;
//!
//! // BUILD loads defs.bzl, defs.bzl loads util.bzl
//! let build = graph.add_vertex(&File("BUILD".into()))?;
//! let defs = graph.add_vertex(&File("defs.bzl".into()))?;
//! let util = graph.add_vertex(&File("util.bzl".into()))?;
//! graph.add_edge(build, defs)?;
//! graph.add_edge(defs, util)?;
//!
//! // Who loads util.bzl, transitively?
//! let mut loaders = Vec::new();
//! graph.traverse([util], Direction::Upward, |_, file| {
//!     loaders.push(file.0.clone());
//!     Visit::Continue
//! })?;
//! assert_eq!(loaders, vec!["util.bzl", "defs.bzl", "BUILD"]);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(unused_results)]

use convenient_storage::codec::{Codec, CodecBuffer, CodecContext, CodecResult, Hash128Codec};
use convenient_storage::{
    Hash128, KvMultiSetMap, KvStore, StorageContext, StorageError, StorageHint, StorageResult,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use tracing::debug;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Vertex identifier, derived from the vertex's identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct VertexId(Hash128);

impl VertexId {
    /// Wrap an existing fingerprint.
    #[must_use]
    pub const fn new(hash: Hash128) -> Self {
        Self(hash)
    }

    /// Derive an id from canonical identity bytes.
    #[must_use]
    pub fn of(identity: &[u8]) -> Self {
        Self(Hash128::of(identity))
    }

    /// Underlying fingerprint.
    #[must_use]
    pub const fn as_hash128(&self) -> Hash128 {
        self.0
    }
}

impl fmt::Display for VertexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Vertex({})", self.0)
    }
}

/// Codec for [`VertexId`]: the two 64-bit halves of its fingerprint.
#[derive(Debug, Clone, Copy, Default)]
pub struct VertexIdCodec;

impl Codec for VertexIdCodec {
    type Value = VertexId;

    fn encode(&self, ctx: &CodecContext, buf: &mut CodecBuffer, value: &VertexId) -> CodecResult<()> {
        Hash128Codec.encode(ctx, buf, &value.0)
    }

    fn decode(&self, ctx: &CodecContext, buf: &mut CodecBuffer) -> CodecResult<VertexId> {
        Hash128Codec.decode(ctx, buf).map(VertexId)
    }
}

/// A value that can live in a [`PersistentGraph`].
///
/// The id must be a pure function of the vertex's identity: two values
/// describing the same entity yield the same id.
pub trait GraphVertex {
    /// Derived id of this vertex.
    fn vertex_id(&self) -> VertexId;
}

/// Edge direction followed by a traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Direction {
    /// Follow predecessors (edge `a -> b` leads from `b` to `a`)
    Upward,
    /// Follow successors (edge `a -> b` leads from `a` to `b`)
    Downward,
}

/// Visitor decision for the vertex just visited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    /// Expand through this vertex
    Continue,
    /// Keep the visit but do not expand through this vertex
    Skip,
    /// End the traversal
    Stop,
}

/// Error types for graph operations.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    /// Vertex not found
    #[error("{0} not found in graph")]
    VertexNotFound(VertexId),

    /// Backing store failure
    #[error("Graph storage error: {0}")]
    Storage(#[from] StorageError),
}

impl GraphError {
    /// Whether the underlying store reported corrupted data.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Storage(e) if e.is_corruption())
    }
}

/// Result type for graph operations.
pub type GraphResult<T> = Result<T, GraphError>;

/// What a traversal did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TraversalSummary {
    /// Vertices reachable from the roots, whether visited or not
    pub discovered: usize,
    /// Vertices handed to the visitor
    pub visited: usize,
    /// Times a cycle forced the order to be broken
    pub cycle_breaks: usize,
    /// Whether the visitor returned `Stop`
    pub stopped: bool,
}

/// Directed graph persisted in three key/value regions.
///
/// The three regions are always updated together by the methods here; the
/// graph has no lock of its own and expects a single writer.
#[derive(Debug)]
pub struct PersistentGraph<V> {
    name: String,
    vertices: KvStore<VertexId, V>,
    successors: KvMultiSetMap<VertexId, VertexId>,
    predecessors: KvMultiSetMap<VertexId, VertexId>,
}

impl<V> Clone for PersistentGraph<V> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            vertices: self.vertices.clone(),
            successors: self.successors.clone(),
            predecessors: self.predecessors.clone(),
        }
    }
}

impl<V: 'static> PersistentGraph<V> {
    /// Open the graph `name` in `ctx`.
    ///
    /// Uses the regions `<name>-vertices`, `<name>-successors` and
    /// `<name>-predecessors`.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::Storage` if a region cannot be opened.
    pub fn open<C>(
        ctx: &StorageContext,
        name: &str,
        hint: Option<StorageHint>,
        vertex_codec: C,
    ) -> GraphResult<Self>
    where
        C: Codec<Value = V> + 'static,
    {
        let region = |suffix: &str| format!("{name}-{suffix}");
        Ok(Self {
            name: name.to_string(),
            vertices: ctx.kv_store(&region("vertices"), hint, VertexIdCodec, vertex_codec)?,
            successors: ctx.multimap(&region("successors"), hint, VertexIdCodec, VertexIdCodec)?,
            predecessors: ctx.multimap(&region("predecessors"), hint, VertexIdCodec, VertexIdCodec)?,
        })
    }
}

impl<V> PersistentGraph<V> {
    /// Graph name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Insert or replace a vertex, returning its id. Edges are untouched.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::Storage` if the vertex cannot be written.
    pub fn add_vertex(&self, vertex: &V) -> GraphResult<VertexId>
    where
        V: GraphVertex,
    {
        let id = vertex.vertex_id();
        self.vertices.put(&id, vertex)?;
        Ok(id)
    }

    /// Look up a vertex by id.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::Storage` if the vertex cannot be read.
    pub fn vertex(&self, id: VertexId) -> GraphResult<Option<V>> {
        Ok(self.vertices.get(&id)?)
    }

    /// Whether a vertex with this id exists.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::Storage` if the store cannot be read.
    pub fn contains(&self, id: VertexId) -> GraphResult<bool> {
        Ok(self.vertices.contains(&id)?)
    }

    /// Remove a vertex and every edge touching it. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::Storage` if a store cannot be updated.
    pub fn remove_vertex(&self, id: VertexId) -> GraphResult<bool> {
        let existed = self.vertices.contains(&id)?;
        for succ in self.successors.get(&id)? {
            let _ = self.predecessors.remove(&succ, &id)?;
        }
        for pred in self.predecessors.get(&id)? {
            let _ = self.successors.remove(&pred, &id)?;
        }
        self.successors.remove_all(&id)?;
        self.predecessors.remove_all(&id)?;
        let _ = self.vertices.remove(&id, false)?;
        Ok(existed)
    }

    /// Add the edge `from -> to`.
    ///
    /// # Errors
    ///
    /// - `GraphError::VertexNotFound` if either endpoint is missing
    /// - `GraphError::Storage` if a store cannot be updated
    pub fn add_edge(&self, from: VertexId, to: VertexId) -> GraphResult<()> {
        for id in [from, to] {
            if !self.vertices.contains(&id)? {
                return Err(GraphError::VertexNotFound(id));
            }
        }
        let _ = self.successors.put(&from, to)?;
        let _ = self.predecessors.put(&to, from)?;
        Ok(())
    }

    /// Remove the edge `from -> to`. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::Storage` if a store cannot be updated.
    pub fn remove_edge(&self, from: VertexId, to: VertexId) -> GraphResult<bool> {
        let removed = self.successors.remove(&from, &to)?;
        let _ = self.predecessors.remove(&to, &from)?;
        Ok(removed)
    }

    /// Remove every outgoing edge of `from`. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::Storage` if a store cannot be updated.
    pub fn remove_outgoing_edges(&self, from: VertexId) -> GraphResult<usize> {
        let targets = self.successors.get(&from)?;
        for to in &targets {
            let _ = self.predecessors.remove(to, &from)?;
        }
        self.successors.remove_all(&from)?;
        Ok(targets.len())
    }

    /// Direct successors of `id`.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::Storage` if the store cannot be read.
    pub fn successors(&self, id: VertexId) -> GraphResult<HashSet<VertexId>> {
        Ok(self.successors.get(&id)?)
    }

    /// Direct predecessors of `id`.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::Storage` if the store cannot be read.
    pub fn predecessors(&self, id: VertexId) -> GraphResult<HashSet<VertexId>> {
        Ok(self.predecessors.get(&id)?)
    }

    fn neighbors(&self, id: VertexId, direction: Direction) -> GraphResult<Vec<VertexId>> {
        let mut ids: Vec<VertexId> = match direction {
            Direction::Upward => self.predecessors.get(&id)?,
            Direction::Downward => self.successors.get(&id)?,
        }
        .into_iter()
        .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    /// Number of vertices.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::Storage` if the store cannot be read.
    pub fn vertex_count(&self) -> GraphResult<usize> {
        Ok(self.vertices.len()?)
    }

    /// Number of edges.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::Storage` if the store cannot be read.
    pub fn edge_count(&self) -> GraphResult<usize> {
        let mut count = 0;
        for entry in self.successors.entries() {
            count += entry?.1.len();
        }
        Ok(count)
    }

    /// All vertex ids, sorted.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::Storage` if the store cannot be read.
    pub fn vertex_ids(&self) -> GraphResult<Vec<VertexId>>
    where
        V: 'static,
    {
        let mut ids = self.vertices.keys().collect::<StorageResult<Vec<_>>>()?;
        ids.sort_unstable();
        Ok(ids)
    }

    /// Drop every vertex and edge.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::Storage` if a store cannot be cleared.
    pub fn clear(&self) -> GraphResult<()> {
        self.vertices.clear()?;
        self.successors.clear()?;
        self.predecessors.clear()?;
        debug!("Cleared graph '{}'", self.name);
        Ok(())
    }

    /// Visit every vertex reachable from `roots` in `direction`.
    ///
    /// Each vertex is visited at most once, and only after every vertex
    /// that leads to it within the reachable subgraph has been handled, so
    /// on an acyclic graph the order is topological. A vertex is visited
    /// only if it is a root or is reached through a vertex whose visit
    /// returned [`Visit::Continue`]. Ids without a stored vertex are treated
    /// as absent.
    ///
    /// When a cycle blocks progress, the earliest-discovered pending vertex
    /// that has been reached is taken next; the traversal still terminates
    /// and never revisits.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::Storage` if a store cannot be read.
    pub fn traverse<I, F>(&self, roots: I, direction: Direction, mut visitor: F) -> GraphResult<TraversalSummary>
    where
        I: IntoIterator<Item = VertexId>,
        F: FnMut(VertexId, &V) -> Visit,
    {
        let mut order: Vec<VertexId> = Vec::new();
        let mut index: HashMap<VertexId, usize> = HashMap::new();

        for root in roots {
            if index.contains_key(&root) {
                continue;
            }
            if !self.vertices.contains(&root)? {
                debug!("Traversal root {} is not in graph '{}'", root, self.name);
                continue;
            }
            let _ = index.insert(root, order.len());
            order.push(root);
        }
        let root_count = order.len();

        // Discover the reachable subgraph breadth-first.
        let mut next: Vec<Vec<usize>> = Vec::new();
        let mut cursor = 0;
        while cursor < order.len() {
            let mut edges = Vec::new();
            for neighbor in self.neighbors(order[cursor], direction)? {
                let target = match index.get(&neighbor) {
                    Some(&i) => i,
                    None => {
                        if !self.vertices.contains(&neighbor)? {
                            continue;
                        }
                        let i = order.len();
                        let _ = index.insert(neighbor, i);
                        order.push(neighbor);
                        i
                    }
                };
                edges.push(target);
            }
            next.push(edges);
            cursor += 1;
        }

        let total = order.len();
        let mut in_degree = vec![0usize; total];
        for edges in &next {
            for &j in edges {
                in_degree[j] += 1;
            }
        }

        let mut summary = TraversalSummary {
            discovered: total,
            ..TraversalSummary::default()
        };
        let mut processed = vec![false; total];
        let mut reached = vec![false; total];
        for flag in reached.iter_mut().take(root_count) {
            *flag = true;
        }
        let mut ready: VecDeque<usize> = (0..total).filter(|&i| in_degree[i] == 0).collect();
        let mut scan = 0;
        let mut done = 0;

        while done < total {
            let current = if let Some(i) = ready.pop_front() {
                i
            } else {
                while scan < total && processed[scan] {
                    scan += 1;
                }
                // Pending vertices that were never reached cannot become
                // reached any more once no reached vertex is pending.
                let Some(pick) = (scan..total).find(|&i| !processed[i] && reached[i]) else {
                    break;
                };
                debug!(
                    "Cycle in graph '{}' blocks ordering, continuing from {}",
                    self.name, order[pick]
                );
                summary.cycle_breaks += 1;
                pick
            };
            if processed[current] {
                continue;
            }
            processed[current] = true;
            done += 1;

            let mut expand = false;
            if reached[current]
                && let Some(vertex) = self.vertices.get(&order[current])?
            {
                summary.visited += 1;
                match visitor(order[current], &vertex) {
                    Visit::Continue => expand = true,
                    Visit::Skip => {}
                    Visit::Stop => {
                        summary.stopped = true;
                        return Ok(summary);
                    }
                }
            }

            for &j in &next[current] {
                if expand {
                    reached[j] = true;
                }
                if !processed[j] {
                    in_degree[j] = in_degree[j].saturating_sub(1);
                    if in_degree[j] == 0 {
                        ready.push_back(j);
                    }
                }
            }
        }

        Ok(summary)
    }

    /// Find all cycles in the graph, following successor edges.
    ///
    /// Returns a vector of cycles, where each cycle is represented as a vector of vertex IDs.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::Storage` if a store cannot be read.
    pub fn find_cycles(&self) -> GraphResult<Vec<Vec<VertexId>>>
    where
        V: 'static,
    {
        let mut cycles = Vec::new();
        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();
        let mut path = Vec::new();

        for id in self.vertex_ids()? {
            if !visited.contains(&id) {
                self.find_cycles_dfs(id, &mut visited, &mut rec_stack, &mut path, &mut cycles)?;
            }
        }

        if !cycles.is_empty() {
            debug!("Graph '{}' contains {} cycles", self.name, cycles.len());
        }
        Ok(cycles)
    }

    fn find_cycles_dfs(
        &self,
        id: VertexId,
        visited: &mut HashSet<VertexId>,
        rec_stack: &mut HashSet<VertexId>,
        path: &mut Vec<VertexId>,
        cycles: &mut Vec<Vec<VertexId>>,
    ) -> GraphResult<()> {
        let _ = visited.insert(id);
        let _ = rec_stack.insert(id);
        path.push(id);

        for neighbor in self.neighbors(id, Direction::Downward)? {
            if !visited.contains(&neighbor) {
                if self.vertices.contains(&neighbor)? {
                    self.find_cycles_dfs(neighbor, visited, rec_stack, path, cycles)?;
                }
            } else if rec_stack.contains(&neighbor)
                && let Some(cycle_start) = path.iter().position(|&v| v == neighbor)
            {
                cycles.push(path[cycle_start..].to_vec());
            }
        }

        let _ = path.pop();
        let _ = rec_stack.remove(&id);
        Ok(())
    }
}
