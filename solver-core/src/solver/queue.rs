//! Dispatch queue.

use std::collections::{HashSet, VecDeque};

use super::edge::{EdgeId, SharedEdge};

/// FIFO of edges waiting to be dispatched.
///
/// An edge is queued at most once at a time: signaling an edge that is
/// already waiting is a no-op, so a burst of signals collapses into one
/// dispatch that sees all of the accumulated changes.
#[derive(Debug, Default)]
pub struct DispatchQueue {
    order: VecDeque<SharedEdge>,
    queued: HashSet<EdgeId>,
}

impl DispatchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `edge` unless it is already waiting. Returns whether it was
    /// added.
    pub fn push(&mut self, edge: &SharedEdge) -> bool {
        if !self.queued.insert(edge.id()) {
            return false;
        }
        self.order.push_back(SharedEdge::clone(edge));
        true
    }

    /// Take the edge at the head of the queue.
    pub fn pop(&mut self) -> Option<SharedEdge> {
        let edge = self.order.pop_front()?;
        self.queued.remove(&edge.id());
        Some(edge)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
