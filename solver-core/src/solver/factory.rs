//! Edge lookup.

use std::sync::Arc;

use dashmap::DashMap;

use super::edge::{Edge, EdgeCell, GraphRef, SharedEdge};
use super::index::EdgeIndex;
use super::op::{Op, OpEdge};

/// Resolves graph references to live edges.
///
/// The factory owns the edges; the scheduler only borrows them while it
/// has requests open against them.
pub trait EdgeFactory: Send + Sync + 'static {
    /// The live edge for `graph_ref`, or `None` if the reference does not
    /// name anything in the graph.
    fn resolve(&self, graph_ref: &GraphRef) -> Option<SharedEdge>;

    /// Index that edges publish their current keys into.
    fn index(&self) -> &EdgeIndex;
}

/// Edge factory backed by an in-memory map.
#[derive(Debug, Default)]
pub struct MemoryEdgeFactory {
    edges: DashMap<GraphRef, SharedEdge>,
    index: EdgeIndex,
}

impl MemoryEdgeFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an edge, replacing whatever was registered for `graph_ref`.
    pub fn insert(&self, graph_ref: GraphRef, edge: impl Edge) -> SharedEdge {
        let cell = EdgeCell::new(graph_ref.clone(), edge);
        self.edges.insert(graph_ref, SharedEdge::clone(&cell));
        cell
    }

    /// Add an [`OpEdge`] evaluating `op`.
    pub fn insert_op(&self, graph_ref: GraphRef, op: impl Op) -> SharedEdge {
        self.insert(graph_ref, OpEdge::new(Arc::new(op)))
    }

    pub fn remove(&self, graph_ref: &GraphRef) -> Option<SharedEdge> {
        self.edges.remove(graph_ref).map(|(_, edge)| edge)
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }
}

impl EdgeFactory for MemoryEdgeFactory {
    fn resolve(&self, graph_ref: &GraphRef) -> Option<SharedEdge> {
        self.edges.get(graph_ref).map(|e| SharedEdge::clone(e.value()))
    }

    fn index(&self) -> &EdgeIndex {
        &self.index
    }
}
