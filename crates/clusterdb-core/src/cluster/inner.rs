//! Inner nodes: routing entries for child subtrees

use crate::{ClusterError, ObjKey, Result};
use clusterdb_arena::Ref;

/// One child of an inner node
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChildEntry {
    /// Largest key stored in the child's subtree
    pub max_key: ObjKey,
    /// The child node
    pub child: Ref,
    /// Number of objects in the child's subtree
    pub count: usize,
}

impl ChildEntry {
    /// Create a new entry
    pub fn new(max_key: ObjKey, child: Ref, count: usize) -> Self {
        Self {
            max_key,
            child,
            count,
        }
    }
}

/// An inner node of the cluster tree.
///
/// Children are ordered by key range. Each entry carries the subtree's
/// largest key for routing and its object count for positional lookup.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClusterNodeInner {
    children: Vec<ChildEntry>,
}

impl ClusterNodeInner {
    /// Create an inner node over the given children
    pub fn new(children: Vec<ChildEntry>) -> Self {
        Self { children }
    }

    /// Number of children
    pub fn len(&self) -> usize {
        self.children.len()
    }

    /// Check if the node has no children
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// All children in key order
    pub fn children(&self) -> &[ChildEntry] {
        &self.children
    }

    /// Get one child
    pub fn child(&self, i: usize) -> ChildEntry {
        self.children[i]
    }

    /// Total number of objects below this node
    pub fn count(&self) -> usize {
        self.children.iter().map(|c| c.count).sum()
    }

    /// Largest key below this node
    pub fn max_key(&self) -> Option<ObjKey> {
        self.children.last().map(|c| c.max_key)
    }

    /// Number of objects in children `0..i`
    pub fn count_before(&self, i: usize) -> usize {
        self.children[..i].iter().map(|c| c.count).sum()
    }

    /// Child whose range may hold `key`: the first with `max_key >= key`
    pub fn route_lookup(&self, key: ObjKey) -> Option<usize> {
        let i = self.children.partition_point(|c| c.max_key < key);
        (i < self.children.len()).then_some(i)
    }

    /// Child a new `key` goes into. Keys beyond every range go to the last child.
    pub fn route_insert(&self, key: ObjKey) -> usize {
        self.route_lookup(key)
            .unwrap_or_else(|| self.children.len().saturating_sub(1))
    }

    /// Child holding the object at position `index`, with the position
    /// relative to that child
    pub fn route_index(&self, mut index: usize) -> Option<(usize, usize)> {
        for (i, child) in self.children.iter().enumerate() {
            if index < child.count {
                return Some((i, index));
            }
            index -= child.count;
        }
        None
    }

    /// Replace child `i` with one or more entries
    pub(crate) fn replace_child(&mut self, i: usize, entries: Vec<ChildEntry>) {
        self.children.splice(i..=i, entries);
    }

    /// Overwrite child `i`
    pub(crate) fn set_child(&mut self, i: usize, entry: ChildEntry) {
        self.children[i] = entry;
    }

    /// Drop child `i`
    pub(crate) fn remove_child(&mut self, i: usize) -> ChildEntry {
        self.children.remove(i)
    }

    /// Move children `at..` into a new node
    pub(crate) fn split_off(&mut self, at: usize) -> ClusterNodeInner {
        ClusterNodeInner {
            children: self.children.split_off(at),
        }
    }

    /// Append the children of a node covering larger keys
    pub(crate) fn append(&mut self, other: ClusterNodeInner) {
        self.children.extend(other.children);
    }

    /// Check local invariants
    pub fn verify(&self) -> Result<()> {
        if self.children.is_empty() {
            return Err(ClusterError::Corrupted("inner node without children".to_string()));
        }
        if self.children.windows(2).any(|w| w[0].max_key >= w[1].max_key) {
            return Err(ClusterError::Corrupted(
                "inner node ranges out of order".to_string(),
            ));
        }
        Ok(())
    }
}
