//! Edges
//!
//! An edge evaluates one output of one vertex. The scheduler treats it as
//! an opaque state machine that it advances by calling [`Edge::unpark`]
//! whenever something the edge cares about has changed.
//!
//! This module also defines what travels on the pipes between edges:
//! requests ask an edge to reach some [`EdgeStatus`]; responses carry the
//! edge's progress ([`EdgeState`]) or, for leaf computations, an
//! [`Output`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

use super::scheduler::PipeFactory;
use crate::error::SolverError;
use crate::pipe::{Pipe, PipeReceiver, PipeSender};

/// Value produced by leaf work.
pub type Output = serde_json::Value;

/// Pipe between two edges, or between an edge and a leaf computation.
pub type EdgePipe = Pipe<EdgeRequest, Response>;
/// Fulfilling side of an [`EdgePipe`]: a request the edge must answer.
pub type EdgeSender = PipeSender<EdgeRequest, Response>;
/// Awaiting side of an [`EdgePipe`]: a request the edge is waiting on.
pub type EdgeReceiver = PipeReceiver<EdgeRequest, Response>;

/// Unique identifier for a live edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EdgeId(u64);

impl EdgeId {
    /// Generate a new unique edge ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for EdgeId {
    fn default() -> Self {
        Self::new()
    }
}

/// Reference to one output of one vertex in the build graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GraphRef {
    pub vertex: String,
    pub index: usize,
}

impl GraphRef {
    pub fn new(vertex: impl Into<String>, index: usize) -> Self {
        Self {
            vertex: vertex.into(),
            index,
        }
    }
}

impl fmt::Display for GraphRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.vertex, self.index)
    }
}

/// Key under which equivalent work is registered in the
/// [`EdgeIndex`](super::EdgeIndex).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IndexKey(String);

impl IndexKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How far an edge has progressed. Ordered: a requester asking for
/// `Complete` is satisfied by nothing less.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EdgeStatus {
    #[default]
    Initial,
    /// Waiting on input edges.
    Inputs,
    /// Leaf work is running.
    Executing,
    /// Result cached.
    Complete,
}

/// Payload of a request sent to an edge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EdgeRequest {
    pub desired_state: EdgeStatus,
}

impl EdgeRequest {
    /// Ask for the edge to be evaluated to completion.
    pub fn complete() -> Self {
        Self {
            desired_state: EdgeStatus::Complete,
        }
    }
}

/// The result of an edge, as cached by the edge and handed to requesters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResult {
    pub id: String,
    pub output: Output,
    pub index_key: Option<IndexKey>,
}

/// Progress an edge reports to whoever requested it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EdgeState {
    pub status: EdgeStatus,
    pub index_key: Option<IndexKey>,
    pub result: Option<CachedResult>,
}

/// Value carried by an [`EdgePipe`].
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Response {
    #[default]
    Empty,
    /// Progress of another edge.
    State(EdgeState),
    /// Output of a leaf computation.
    Output(Output),
}

/// The contract between an edge state machine and the scheduler.
///
/// The scheduler never calls into the same edge from two places at once,
/// so implementations keep plain mutable state.
pub trait Edge: Send + 'static {
    /// Advance the state machine.
    ///
    /// `incoming` holds every request this edge still owes an answer;
    /// `updates` the subset of its own outstanding requests that published
    /// something since the last dispatch; `outgoing` all of them. New
    /// outstanding requests are created through `factory`.
    ///
    /// When this returns, the edge must either have answered all of
    /// `incoming` or still be waiting on at least one outgoing request,
    /// and must not be waiting on anything nobody asked for.
    fn unpark(
        &mut self,
        incoming: &[EdgeSender],
        updates: &[EdgeReceiver],
        outgoing: &[EdgeReceiver],
        factory: &mut PipeFactory<'_>,
    );

    /// Force the edge into a failed state and answer `incoming` with `err`.
    ///
    /// Used by the scheduler when `unpark` broke its contract.
    fn mark_failed(
        &mut self,
        incoming: &[EdgeSender],
        factory: &mut PipeFactory<'_>,
        err: SolverError,
    );

    /// Whether the last dispatch changed [`current_index_key`]. Reading
    /// resets the flag.
    ///
    /// [`current_index_key`]: Edge::current_index_key
    fn take_keys_changed(&mut self) -> bool {
        false
    }

    fn current_index_key(&self) -> Option<IndexKey> {
        None
    }

    /// Set before every dispatch: whether any outgoing request is still
    /// open.
    fn set_has_active_outgoing(&mut self, _active: bool) {}

    /// The cached result, once the edge completed successfully.
    fn result(&self) -> Option<CachedResult>;
}

/// A live edge as seen by the scheduler: identity plus serialized access
/// to its state machine.
pub struct EdgeCell {
    id: EdgeId,
    graph_ref: GraphRef,
    edge: Mutex<Box<dyn Edge>>,
}

/// Shared handle to a live edge. Owned by the edge factory.
pub type SharedEdge = Arc<EdgeCell>;

impl EdgeCell {
    pub fn new(graph_ref: GraphRef, edge: impl Edge) -> SharedEdge {
        Arc::new(Self {
            id: EdgeId::new(),
            graph_ref,
            edge: Mutex::new(Box::new(edge)),
        })
    }

    pub fn id(&self) -> EdgeId {
        self.id
    }

    pub fn graph_ref(&self) -> &GraphRef {
        &self.graph_ref
    }

    /// Copy of the edge's cached result.
    pub fn result(&self) -> Option<CachedResult> {
        self.edge.lock().result()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Box<dyn Edge>> {
        self.edge.lock()
    }
}

impl fmt::Debug for EdgeCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EdgeCell")
            .field("id", &self.id)
            .field("graph_ref", &self.graph_ref)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edge_ids_are_unique() {
        let a = EdgeId::new();
        let b = EdgeId::new();
        assert_ne!(a, b);
        assert!(b.raw() > a.raw());
    }

    #[test]
    fn status_order() {
        assert!(EdgeStatus::Initial < EdgeStatus::Inputs);
        assert!(EdgeStatus::Executing < EdgeStatus::Complete);
        assert_eq!(EdgeRequest::default().desired_state, EdgeStatus::Initial);
        assert_eq!(EdgeRequest::complete().desired_state, EdgeStatus::Complete);
    }

    #[test]
    fn graph_ref_display() {
        assert_eq!(GraphRef::new("sha256:abc", 1).to_string(), "sha256:abc[1]");
    }
}
