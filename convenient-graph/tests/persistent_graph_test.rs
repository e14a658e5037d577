//! Graph persistence and traversal over reopened storage
//!
//! Builds a small include graph, saves it, reopens the storage directory and
//! checks that adjacency and traversal answers are unchanged.

use convenient_graph::{Direction, GraphVertex, PersistentGraph, VertexId, Visit};
use convenient_storage::codec::{Codec, CodecBuffer, CodecContext, CodecResult, StringCodec};
use convenient_storage::{StorageConfig, StorageContext, StorageHint};
use std::collections::HashSet;
use tempfile::TempDir;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Include {
    path: String,
    top_level: bool,
}

impl Include {
    fn new(path: &str, top_level: bool) -> Self {
        Self {
            path: path.to_string(),
            top_level,
        }
    }
}

impl GraphVertex for Include {
    fn vertex_id(&self) -> VertexId {
        VertexId::of(self.path.as_bytes())
    }
}

struct IncludeCodec;

impl Codec for IncludeCodec {
    type Value = Include;

    fn encode(&self, ctx: &CodecContext, buf: &mut CodecBuffer, value: &Include) -> CodecResult<()> {
        StringCodec.encode(ctx, buf, &value.path)?;
        buf.write_u8(u8::from(value.top_level));
        Ok(())
    }

    fn decode(&self, ctx: &CodecContext, buf: &mut CodecBuffer) -> CodecResult<Include> {
        let path = StringCodec.decode(ctx, buf)?;
        let top_level = buf.read_u8()? != 0;
        Ok(Include { path, top_level })
    }
}

fn open(dir: &TempDir, hint: StorageHint) -> (StorageContext, PersistentGraph<Include>) {
    let ctx = StorageContext::open(StorageConfig::at(dir.path())).unwrap();
    let graph = PersistentGraph::open(&ctx, "includes", Some(hint), IncludeCodec).unwrap();
    (ctx, graph)
}

/// Top-level files whose includes reach `path`, stopping at top-level files.
fn top_level_includers(graph: &PersistentGraph<Include>, path: &str) -> HashSet<String> {
    let mut found = HashSet::new();
    let root = VertexId::of(path.as_bytes());
    let _ = graph
        .traverse([root], Direction::Upward, |_, include| {
            if include.top_level {
                let _ = found.insert(include.path.clone());
                Visit::Skip
            } else {
                Visit::Continue
            }
        })
        .unwrap();
    found
}

#[test]
fn test_graph_survives_reopen() {
    for hint in [StorageHint::InMemory, StorageHint::Paged] {
        let tmp = TempDir::new().unwrap();
        {
            let (ctx, graph) = open(&tmp, hint);
            // app and lib are top level; both include common, which includes base
            let app = graph.add_vertex(&Include::new("app.conf", true)).unwrap();
            let lib = graph.add_vertex(&Include::new("lib.conf", true)).unwrap();
            let common = graph.add_vertex(&Include::new("common.inc", false)).unwrap();
            let base = graph.add_vertex(&Include::new("base.inc", false)).unwrap();
            graph.add_edge(app, common).unwrap();
            graph.add_edge(lib, common).unwrap();
            graph.add_edge(common, base).unwrap();
            ctx.save().unwrap();
        }

        let (_ctx, graph) = open(&tmp, hint);
        assert_eq!(graph.vertex_count().unwrap(), 4);
        assert_eq!(graph.edge_count().unwrap(), 3);
        let expected: HashSet<String> = ["app.conf".to_string(), "lib.conf".to_string()].into();
        assert_eq!(top_level_includers(&graph, "base.inc"), expected);
        assert!(top_level_includers(&graph, "unknown.inc").is_empty());
    }
}

#[test]
fn test_top_level_file_stops_expansion() {
    let tmp = TempDir::new().unwrap();
    let (_ctx, graph) = open(&tmp, StorageHint::InMemory);
    // outer includes inner (both top level), inner includes leaf
    let outer = graph.add_vertex(&Include::new("outer.conf", true)).unwrap();
    let inner = graph.add_vertex(&Include::new("inner.conf", true)).unwrap();
    let leaf = graph.add_vertex(&Include::new("leaf.inc", false)).unwrap();
    graph.add_edge(outer, inner).unwrap();
    graph.add_edge(inner, leaf).unwrap();

    let found = top_level_includers(&graph, "leaf.inc");
    assert_eq!(found, HashSet::from(["inner.conf".to_string()]));
}

#[test]
fn test_mutual_includes_terminate() {
    let tmp = TempDir::new().unwrap();
    let (_ctx, graph) = open(&tmp, StorageHint::Paged);
    let top = graph.add_vertex(&Include::new("top.conf", true)).unwrap();
    let a = graph.add_vertex(&Include::new("a.inc", false)).unwrap();
    let b = graph.add_vertex(&Include::new("b.inc", false)).unwrap();
    graph.add_edge(top, a).unwrap();
    graph.add_edge(a, b).unwrap();
    graph.add_edge(b, a).unwrap();

    assert_eq!(
        top_level_includers(&graph, "b.inc"),
        HashSet::from(["top.conf".to_string()])
    );
    assert_eq!(graph.find_cycles().unwrap().len(), 1);
}
