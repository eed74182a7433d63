//! Staged node writes.
//!
//! A structural operation first computes every node it will change, then
//! applies them in one step. Allocations happen eagerly so a full arena
//! fails the operation before anything visible has changed; in-place writes
//! and frees are deferred to `commit`.

use super::{ChildEntry, Node};
use crate::{ObjKey, Result};
use clusterdb_arena::{Allocator, Ref};
use tracing::trace;

pub(crate) struct Mutation<'a, A: Allocator<Node>> {
    arena: &'a A,
    allocated: Vec<Ref>,
    writes: Vec<(Ref, Node)>,
    released: Vec<Ref>,
}

impl<'a, A: Allocator<Node>> Mutation<'a, A> {
    pub fn new(arena: &'a A) -> Self {
        Self {
            arena,
            allocated: Vec::new(),
            writes: Vec::new(),
            released: Vec::new(),
        }
    }

    /// Store a brand new node
    pub fn allocate(&mut self, node: Node) -> Result<Ref> {
        let r = self.arena.allocate(node)?;
        self.allocated.push(r);
        Ok(r)
    }

    /// Store new contents for an existing node. Read-only nodes are copied
    /// to a fresh ref and the old ref is released.
    pub fn store(&mut self, r: Ref, node: Node) -> Result<Ref> {
        if self.arena.is_read_only(r) {
            let copy = self.allocate(node)?;
            trace!(from = %r, to = %copy, "copied read-only node");
            self.released.push(r);
            return Ok(copy);
        }
        self.writes.push((r, node));
        Ok(r)
    }

    /// Store a node and describe it as a child entry
    pub fn store_entry(&mut self, r: Ref, node: Node) -> Result<ChildEntry> {
        let (max_key, count) = describe(&node);
        Ok(ChildEntry::new(max_key, self.store(r, node)?, count))
    }

    /// Allocate a node and describe it as a child entry
    pub fn allocate_entry(&mut self, node: Node) -> Result<ChildEntry> {
        let (max_key, count) = describe(&node);
        Ok(ChildEntry::new(max_key, self.allocate(node)?, count))
    }

    /// Free a node once the mutation commits
    pub fn release(&mut self, r: Ref) {
        self.released.push(r);
    }

    /// Check if the mutation moved or created any node
    pub fn relocated(&self) -> bool {
        !self.allocated.is_empty()
    }

    /// Apply every staged write and free every released node
    pub fn commit(self) -> Result<bool> {
        let relocated = self.relocated();
        for (r, node) in self.writes {
            self.arena.write(r, node)?;
        }
        for r in self.released {
            self.arena.free(r)?;
        }
        Ok(relocated)
    }

    /// Undo every allocation. Nothing else has touched the arena yet.
    pub fn abort(self) {
        for r in self.allocated {
            if let Err(err) = self.arena.free(r) {
                trace!(%r, %err, "failed to free node of aborted mutation");
            }
        }
    }
}

fn describe(node: &Node) -> (ObjKey, usize) {
    (node.max_key().unwrap_or(ObjKey::NULL), node.count())
}
