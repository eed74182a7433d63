//! Row handles

use super::node::{leaf_of, LeafPosition};
use super::{ClusterTree, Node};
use crate::{ClusterError, ColKey, ObjKey, Result, TableKey, Value};
use clusterdb_arena::Allocator;
use std::cell::RefCell;
use tracing::trace;

/// A handle to one object.
///
/// The handle remembers the leaf it last found its object in, together with
/// the arena versions that answer was valid for. Every access compares
/// versions first: an unchanged arena reuses the cached leaf, a content-only
/// change re-reads the same leaf, and a structural change looks the key up
/// again from the root. A handle used with a tree other than the one it was
/// created from, including a recreated instance of the same table, fails
/// with [`ClusterError::DetachedAccessor`].
#[derive(Clone, Debug)]
pub struct Obj {
    table: TableKey,
    key: ObjKey,
    instance_version: u64,
    cache: RefCell<Option<LeafPosition>>,
}

impl Obj {
    pub(crate) fn attached<A: Allocator<Node>>(
        tree: &ClusterTree<A>,
        key: ObjKey,
        pos: LeafPosition,
    ) -> Self {
        Self {
            table: tree.table(),
            key,
            instance_version: tree.instance_version(),
            cache: RefCell::new(Some(pos)),
        }
    }

    /// Get the object key
    pub fn key(&self) -> ObjKey {
        self.key
    }

    /// Get the table the object belongs to
    pub fn table(&self) -> TableKey {
        self.table
    }

    fn check_attached<A: Allocator<Node>>(&self, tree: &ClusterTree<A>) -> Result<()> {
        if tree.table() != self.table || tree.instance_version() != self.instance_version {
            return Err(ClusterError::DetachedAccessor);
        }
        Ok(())
    }

    /// Check if the handle still names a live object of `tree`
    pub fn is_valid<A: Allocator<Node>>(&self, tree: &ClusterTree<A>) -> bool {
        self.check_attached(tree).is_ok() && tree.is_valid(self.key)
    }

    fn position<A: Allocator<Node>>(&self, tree: &ClusterTree<A>) -> Result<LeafPosition> {
        self.check_attached(tree)?;
        let storage_version = tree.storage_version();
        let content_version = tree.content_version();
        let mut cache = self.cache.borrow_mut();

        let pos = match cache.take() {
            Some(pos)
                if pos.storage_version == storage_version
                    && pos.content_version == content_version =>
            {
                pos
            }
            Some(pos) if pos.storage_version == storage_version => {
                let leaf = tree.arena().translate(pos.leaf.r)?;
                let ndx = leaf_of(&leaf)?
                    .find(self.key)
                    .map_err(|_| ClusterError::KeyNotFound(self.key))?;
                LeafPosition {
                    leaf,
                    ndx,
                    storage_version,
                    content_version,
                    ..pos
                }
            }
            _ => {
                trace!(key = %self.key, "handle re-descending after structural change");
                tree.find(self.key)?
                    .ok_or(ClusterError::KeyNotFound(self.key))?
            }
        };
        *cache = Some(pos.clone());
        Ok(pos)
    }

    /// Read one field
    pub fn get<A: Allocator<Node>>(&self, tree: &ClusterTree<A>, col: ColKey) -> Result<Value> {
        let pos = self.position(tree)?;
        tree.read_field(&pos, col)
    }

    /// Overwrite one field
    pub fn set<A: Allocator<Node>>(
        &self,
        tree: &mut ClusterTree<A>,
        col: ColKey,
        value: Value,
    ) -> Result<()> {
        self.check_attached(tree)?;
        tree.set_value(self.key, col, value)
    }

    /// Read every column, in schema order
    pub fn row<A: Allocator<Node>>(&self, tree: &ClusterTree<A>) -> Result<Vec<(ColKey, Value)>> {
        let pos = self.position(tree)?;
        tree.schema()
            .columns(tree.table())
            .into_iter()
            .map(|spec| Ok((spec.key, tree.read_field(&pos, spec.key)?)))
            .collect()
    }

    /// Objects linked from one column
    pub fn links<A: Allocator<Node>>(&self, tree: &ClusterTree<A>, col: ColKey) -> Result<Vec<ObjKey>> {
        Ok(self.get(tree, col)?.links())
    }

    /// Tree position of the object
    pub fn index<A: Allocator<Node>>(&self, tree: &ClusterTree<A>) -> Result<usize> {
        Ok(self.position(tree)?.index())
    }
}

impl PartialEq for Obj {
    fn eq(&self, other: &Self) -> bool {
        self.table == other.table
            && self.key == other.key
            && self.instance_version == other.instance_version
    }
}
