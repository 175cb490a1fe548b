//! Content-addressable edge index.
//!
//! Edges publish their current index key here after a dispatch that
//! changed it. Registration is last-write-wins: the index remembers the
//! edge most recently registered under a key and reports whichever edge
//! held the key before, so the caller can tell that equivalent work
//! exists elsewhere. Nothing is merged.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::edge::{IndexKey, SharedEdge};

#[derive(Debug, Default)]
pub struct EdgeIndex {
    entries: DashMap<IndexKey, SharedEdge>,
}

impl EdgeIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `edge` under `key`.
    ///
    /// Returns the edge previously registered under `key`, or `edge`
    /// itself if the key was free.
    pub fn load_or_store(&self, key: IndexKey, edge: SharedEdge) -> SharedEdge {
        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => occupied.insert(edge),
            Entry::Vacant(vacant) => {
                vacant.insert(SharedEdge::clone(&edge));
                edge
            }
        }
    }

    pub fn get(&self, key: &IndexKey) -> Option<SharedEdge> {
        self.entries.get(key).map(|e| SharedEdge::clone(e.value()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::solver::op::FnOp;
    use crate::solver::{EdgeCell, GraphRef, OpEdge};

    fn edge(name: &str) -> SharedEdge {
        let op = FnOp::new(name, vec![], |_, _| async { Ok(serde_json::Value::Null) });
        EdgeCell::new(GraphRef::new(name, 0), OpEdge::new(Arc::new(op)))
    }

    #[test]
    fn first_registration_returns_self() {
        let index = EdgeIndex::new();
        let a = edge("a");

        let found = index.load_or_store(IndexKey::new("k"), a.clone());
        assert!(Arc::ptr_eq(&found, &a));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn later_registration_wins() {
        let index = EdgeIndex::new();
        let a = edge("a");
        let b = edge("b");
        let key = IndexKey::new("k");

        index.load_or_store(key.clone(), a.clone());
        let previous = index.load_or_store(key.clone(), b.clone());

        assert!(Arc::ptr_eq(&previous, &a));
        assert!(Arc::ptr_eq(&index.get(&key).unwrap(), &b));
        assert_eq!(index.len(), 1);
    }
}
