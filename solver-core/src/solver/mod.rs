//! Build Graph Solver
//!
//! This module implements the scheduler that drives a graph of edges to
//! completion, one dispatch at a time.
//!
//! # Overview
//!
//! - An edge is one output of one vertex, evaluated by a state machine
//!   implementing [`Edge`].
//! - Edges talk to each other only through pipes: an edge that needs an
//!   input opens a request to the input's edge and is dispatched again when
//!   the request publishes something.
//! - The [`Scheduler`] owns all open requests and checks after every
//!   dispatch that no edge was left hanging.
//! - Edges that compute the same thing publish the same [`IndexKey`] into
//!   the [`EdgeIndex`].
//!
//! [`OpEdge`] is the stock state machine for evaluating an [`Op`].

mod edge;
mod factory;
mod index;
pub mod op;
mod queue;
mod scheduler;

pub use edge::{
    CachedResult, Edge, EdgeCell, EdgeId, EdgePipe, EdgeReceiver, EdgeRequest, EdgeSender,
    EdgeState, EdgeStatus, GraphRef, IndexKey, Output, Response, SharedEdge,
};
pub use factory::{EdgeFactory, MemoryEdgeFactory};
pub use index::EdgeIndex;
pub use op::{FnOp, Op, OpEdge};
pub use queue::DispatchQueue;
pub use scheduler::{PipeFactory, Scheduler};
