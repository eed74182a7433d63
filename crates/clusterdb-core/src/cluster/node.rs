//! Tree nodes as stored in the arena

use super::{Cluster, ClusterNodeInner};
use crate::{ClusterError, ColKey, ObjKey, Result, Value};
use clusterdb_arena::MemRef;

/// A node of the cluster tree
#[derive(Clone, Debug, PartialEq)]
pub enum Node {
    /// Leaf holding objects
    Leaf(Cluster),
    /// Inner node routing to children
    Inner(ClusterNodeInner),
}

impl Node {
    /// Check if this is a leaf
    pub fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf(_))
    }

    /// Number of entries: objects for a leaf, children for an inner node
    pub fn len(&self) -> usize {
        match self {
            Node::Leaf(leaf) => leaf.len(),
            Node::Inner(inner) => inner.len(),
        }
    }

    /// Check if the node has no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of objects below this node
    pub fn count(&self) -> usize {
        match self {
            Node::Leaf(leaf) => leaf.len(),
            Node::Inner(inner) => inner.count(),
        }
    }

    /// Largest key below this node
    pub fn max_key(&self) -> Option<ObjKey> {
        match self {
            Node::Leaf(leaf) => leaf.last_key(),
            Node::Inner(inner) => inner.max_key(),
        }
    }

    /// Get the leaf, if this is one
    pub fn as_leaf(&self) -> Option<&Cluster> {
        match self {
            Node::Leaf(leaf) => Some(leaf),
            _ => None,
        }
    }

    /// Get the inner node, if this is one
    pub fn as_inner(&self) -> Option<&ClusterNodeInner> {
        match self {
            Node::Inner(inner) => Some(inner),
            _ => None,
        }
    }

    /// Move entries `at..` into a new node of the same kind
    pub(crate) fn split_off(&mut self, at: usize) -> Node {
        match self {
            Node::Leaf(leaf) => Node::Leaf(leaf.split_off(at)),
            Node::Inner(inner) => Node::Inner(inner.split_off(at)),
        }
    }

    /// Append a right sibling of the same kind
    pub(crate) fn append(
        &mut self,
        other: Node,
        default: impl FnMut(ColKey) -> Value,
    ) -> Result<()> {
        match (self, other) {
            (Node::Leaf(leaf), Node::Leaf(other)) => leaf.append(other, default),
            (Node::Inner(inner), Node::Inner(other)) => inner.append(other),
            _ => {
                return Err(ClusterError::Corrupted(
                    "siblings at different depths".to_string(),
                ))
            }
        }
        Ok(())
    }
}

/// Borrow the leaf out of a translated node
pub(crate) fn leaf_of(mem: &MemRef<Node>) -> Result<&Cluster> {
    mem.as_leaf()
        .ok_or_else(|| ClusterError::Corrupted(format!("{} is not a leaf", mem.r)))
}

/// Where an object was found, together with the versions the answer is
/// valid for
#[derive(Clone, Debug)]
pub(crate) struct LeafPosition {
    /// The leaf, translated
    pub leaf: MemRef<Node>,
    /// Row within the leaf
    pub ndx: usize,
    /// Tree position of the leaf's first row
    pub leaf_start: usize,
    pub storage_version: u64,
    pub content_version: u64,
}

impl LeafPosition {
    /// Key at the current row
    pub fn key(&self) -> Result<ObjKey> {
        Ok(leaf_of(&self.leaf)?.key(self.ndx))
    }

    /// Tree position of the current row
    pub fn index(&self) -> usize {
        self.leaf_start + self.ndx
    }
}
