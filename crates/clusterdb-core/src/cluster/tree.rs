//! Cluster tree implementation

use super::mutation::Mutation;
use super::node::{leaf_of, LeafPosition};
use super::{
    ChildEntry, Cluster, ClusterNodeInner, Node, DEFAULT_INNER_CAPACITY, DEFAULT_LEAF_CAPACITY,
    MIN_CAPACITY,
};
use crate::cascade::CascadeState;
use crate::{ClusterError, ColKey, ColumnType, Obj, ObjKey, Result, Schema, TableKey, Value};
use clusterdb_arena::{Allocator, Ref};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, instrument, trace};

/// Configuration for cluster tree node sizes
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TreeConfig {
    /// Maximum objects per leaf
    pub leaf_capacity: usize,
    /// Maximum children per inner node
    pub inner_capacity: usize,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            leaf_capacity: DEFAULT_LEAF_CAPACITY,
            inner_capacity: DEFAULT_INNER_CAPACITY,
        }
    }
}

impl TreeConfig {
    /// Check the configuration for nonsensical values
    pub fn validate(&self) -> Result<()> {
        if self.leaf_capacity < MIN_CAPACITY || self.inner_capacity < MIN_CAPACITY {
            return Err(ClusterError::Configuration(format!(
                "node capacities must be at least {} (leaf {}, inner {})",
                MIN_CAPACITY, self.leaf_capacity, self.inner_capacity
            )));
        }
        Ok(())
    }

    fn capacity(&self, node: &Node) -> usize {
        if node.is_leaf() {
            self.leaf_capacity
        } else {
            self.inner_capacity
        }
    }

    /// A non-root node at or below a quarter of its capacity gets merged
    /// with a sibling
    fn is_underfull(&self, node: &Node) -> bool {
        node.len() <= self.capacity(node) / 4
    }
}

/// A copy-on-write B+-tree mapping object keys to rows.
///
/// Leaves hold objects in key order, inner nodes route by key range and
/// count objects for positional access. Nodes live in an arena and are
/// addressed by [`Ref`]; every mutation is staged and applied in one step,
/// so an arena failure leaves the tree exactly as it was.
pub struct ClusterTree<A: Allocator<Node>> {
    table: TableKey,
    arena: Arc<A>,
    schema: Arc<dyn Schema>,
    config: TreeConfig,
    root: Ref,
    size: usize,
    instance_version: u64,
}

impl<A: Allocator<Node>> ClusterTree<A> {
    /// Create an empty tree for a table
    pub fn create(
        table: TableKey,
        arena: Arc<A>,
        schema: Arc<dyn Schema>,
        config: TreeConfig,
    ) -> Result<Self> {
        config.validate()?;
        let leaf = Cluster::new(schema.columns(table).iter().map(|c| c.key));
        let root = arena.allocate(Node::Leaf(leaf))?;
        let instance_version = arena.bump_instance_version();
        debug!(%table, %root, instance_version, "created cluster tree");
        Ok(Self {
            table,
            arena,
            schema,
            config,
            root,
            size: 0,
            instance_version,
        })
    }

    /// Open an existing tree rooted at `root`, for instance one captured by
    /// a frozen snapshot
    pub fn attach(
        table: TableKey,
        arena: Arc<A>,
        schema: Arc<dyn Schema>,
        config: TreeConfig,
        root: Ref,
    ) -> Result<Self> {
        config.validate()?;
        let size = arena.translate(root)?.count();
        let instance_version = arena.bump_instance_version();
        debug!(%table, %root, size, "attached cluster tree");
        Ok(Self {
            table,
            arena,
            schema,
            config,
            root,
            size,
            instance_version,
        })
    }

    /// Get the table this tree stores
    pub fn table(&self) -> TableKey {
        self.table
    }

    /// Get the root ref
    pub fn root_ref(&self) -> Ref {
        self.root
    }

    /// Get the configuration
    pub fn config(&self) -> &TreeConfig {
        &self.config
    }

    /// Get the arena
    pub fn arena(&self) -> &Arc<A> {
        &self.arena
    }

    /// Get the schema
    pub fn schema(&self) -> &Arc<dyn Schema> {
        &self.schema
    }

    /// Number of objects
    pub fn size(&self) -> usize {
        self.size
    }

    /// Check if the tree holds no objects
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Instance version this tree was materialized at
    pub fn instance_version(&self) -> u64 {
        self.instance_version
    }

    /// Current content version of the arena
    pub fn content_version(&self) -> u64 {
        self.arena.content_version()
    }

    /// Current storage version of the arena
    pub fn storage_version(&self) -> u64 {
        self.arena.storage_version()
    }

    fn default_for(&self, col: ColKey) -> Value {
        self.schema
            .default_value(self.table, col)
            .unwrap_or(Value::Null)
    }

    fn empty_leaf(&self) -> Node {
        Node::Leaf(Cluster::new(
            self.schema.columns(self.table).iter().map(|c| c.key),
        ))
    }

    /// Stage a mutation, then commit it and install the new root. If `op`
    /// fails every node it allocated is freed and the tree is unchanged.
    fn mutate<T>(
        &mut self,
        structural: bool,
        op: impl FnOnce(&Self, &mut Mutation<'_, A>) -> Result<(Ref, T)>,
    ) -> Result<T> {
        let arena = Arc::clone(&self.arena);
        let mut m = Mutation::new(&*arena);
        let (root, out) = match op(self, &mut m) {
            Ok(result) => result,
            Err(err) => {
                m.abort();
                return Err(err);
            }
        };
        let relocated = m.commit()?;
        if root != self.root {
            trace!(from = %self.root, to = %root, "installed new root");
        }
        let structural = structural || relocated || root != self.root;
        self.root = root;
        if structural {
            arena.bump_storage_version();
        }
        arena.bump_content_version();
        Ok(out)
    }

    /// Insert a new object. Columns not named in `values` get their default.
    pub fn insert(&mut self, key: ObjKey, values: &[(ColKey, Value)]) -> Result<Obj> {
        self.insert_fast(key, values)?;
        self.get(key)
    }

    /// Insert a new object without building a handle for it
    #[instrument(skip(self, values), fields(table = %self.table))]
    pub fn insert_fast(&mut self, key: ObjKey, values: &[(ColKey, Value)]) -> Result<()> {
        if !key.is_valid() {
            return Err(ClusterError::InvalidKey(key));
        }
        for (col, value) in values {
            self.schema
                .column(self.table, *col)
                .ok_or(ClusterError::ColumnNotFound(*col))?
                .check(value)?;
        }

        self.mutate(true, |tree, m| {
            let entries = tree.insert_rec(m, tree.root, key, values)?;
            let root = if entries.len() == 1 {
                entries[0].child
            } else {
                debug!(table = %tree.table, "grew new root");
                m.allocate(Node::Inner(ClusterNodeInner::new(entries)))?
            };
            Ok((root, ()))
        })?;
        self.size += 1;
        trace!(%key, size = self.size, "inserted object");
        Ok(())
    }

    fn insert_rec(
        &self,
        m: &mut Mutation<'_, A>,
        r: Ref,
        key: ObjKey,
        values: &[(ColKey, Value)],
    ) -> Result<Vec<ChildEntry>> {
        let mut node = self.arena.translate(r)?.to_owned_block();
        match &mut node {
            Node::Leaf(leaf) => {
                for (col, _) in values {
                    if !leaf.has_column(*col) {
                        leaf.insert_column(*col, self.default_for(*col));
                    }
                }
                leaf.insert_row(key, |col| {
                    values
                        .iter()
                        .find(|(c, _)| *c == col)
                        .map(|(_, v)| v.clone())
                        .unwrap_or_else(|| self.default_for(col))
                })?;
            }
            Node::Inner(inner) => {
                let i = inner.route_insert(key);
                let entries = self.insert_rec(m, inner.child(i).child, key, values)?;
                inner.replace_child(i, entries);
            }
        }

        if node.len() <= self.config.capacity(&node) {
            return Ok(vec![m.store_entry(r, node)?]);
        }
        let right = node.split_off((node.len() + 1) / 2);
        debug!(%r, leaf = node.is_leaf(), left = node.len(), right = right.len(), "split node");
        let right = m.allocate_entry(right)?;
        let left = m.store_entry(r, node)?;
        Ok(vec![left, right])
    }

    /// Find the first object whose key is not less than `key`
    pub(crate) fn lower_bound(&self, key: ObjKey) -> Result<Option<LeafPosition>> {
        let storage_version = self.storage_version();
        let content_version = self.content_version();
        let mut r = self.root;
        let mut leaf_start = 0;
        loop {
            let mem = self.arena.translate(r)?;
            match &*mem {
                Node::Inner(inner) => {
                    let Some(i) = inner.route_lookup(key) else {
                        return Ok(None);
                    };
                    leaf_start += inner.count_before(i);
                    r = inner.child(i).child;
                }
                Node::Leaf(leaf) => {
                    let ndx = leaf.lower_bound(key);
                    if ndx >= leaf.len() {
                        return Ok(None);
                    }
                    return Ok(Some(LeafPosition {
                        leaf: mem.clone(),
                        ndx,
                        leaf_start,
                        storage_version,
                        content_version,
                    }));
                }
            }
        }
    }

    /// Find the object with exactly this key
    pub(crate) fn find(&self, key: ObjKey) -> Result<Option<LeafPosition>> {
        let found = self.lower_bound(key)?;
        Ok(match found {
            Some(pos) if pos.key()? == key => Some(pos),
            _ => None,
        })
    }

    /// Find the object at tree position `index`
    pub(crate) fn position(&self, index: usize) -> Result<LeafPosition> {
        if index >= self.size {
            return Err(ClusterError::IndexOutOfRange {
                index,
                size: self.size,
            });
        }
        let storage_version = self.storage_version();
        let content_version = self.content_version();
        let mut r = self.root;
        let mut rel = index;
        loop {
            let mem = self.arena.translate(r)?;
            match &*mem {
                Node::Inner(inner) => {
                    let (i, within) = inner.route_index(rel).ok_or_else(|| {
                        ClusterError::Corrupted(format!("counts below {} do not add up", r))
                    })?;
                    rel = within;
                    r = inner.child(i).child;
                }
                Node::Leaf(leaf) => {
                    if rel >= leaf.len() {
                        return Err(ClusterError::Corrupted(format!(
                            "leaf {} shorter than its count",
                            r
                        )));
                    }
                    return Ok(LeafPosition {
                        leaf: mem.clone(),
                        ndx: rel,
                        leaf_start: index - rel,
                        storage_version,
                        content_version,
                    });
                }
            }
        }
    }

    /// Check if an object with this key exists
    pub fn is_valid(&self, key: ObjKey) -> bool {
        matches!(self.find(key), Ok(Some(_)))
    }

    /// Get a handle to an object
    pub fn get(&self, key: ObjKey) -> Result<Obj> {
        let pos = self.find(key)?.ok_or(ClusterError::KeyNotFound(key))?;
        Ok(Obj::attached(self, key, pos))
    }

    /// Get a handle to the object at tree position `index`
    pub fn get_by_index(&self, index: usize) -> Result<Obj> {
        let pos = self.position(index)?;
        Ok(Obj::attached(self, pos.key()?, pos))
    }

    /// Get the tree position of an object
    pub fn get_ndx(&self, key: ObjKey) -> Result<usize> {
        self.find(key)?
            .map(|pos| pos.index())
            .ok_or(ClusterError::KeyNotFound(key))
    }

    /// Largest key in the tree, or `ObjKey::NULL` if empty
    pub fn get_last_key_value(&self) -> Result<ObjKey> {
        Ok(self
            .arena
            .translate(self.root)?
            .max_key()
            .unwrap_or(ObjKey::NULL))
    }

    /// Read one field of one object
    pub fn get_value(&self, key: ObjKey, col: ColKey) -> Result<Value> {
        let pos = self.find(key)?.ok_or(ClusterError::KeyNotFound(key))?;
        self.read_field(&pos, col)
    }

    /// Read one field at a known position. Columns not yet present in the
    /// leaf read as their default.
    pub(crate) fn read_field(&self, pos: &LeafPosition, col: ColKey) -> Result<Value> {
        let spec = self
            .schema
            .column(self.table, col)
            .ok_or(ClusterError::ColumnNotFound(col))?;
        let leaf = leaf_of(&pos.leaf)?;
        Ok(leaf
            .get(col, pos.ndx)
            .unwrap_or_else(|| spec.default_value()))
    }

    /// Overwrite one field of one object
    #[instrument(skip(self, value), fields(table = %self.table))]
    pub fn set_value(&mut self, key: ObjKey, col: ColKey, value: Value) -> Result<()> {
        self.schema
            .column(self.table, col)
            .ok_or(ClusterError::ColumnNotFound(col))?
            .check(&value)?;
        self.mutate(false, |tree, m| {
            Ok((tree.set_rec(m, tree.root, key, col, &value)?, ()))
        })
    }

    fn set_rec(
        &self,
        m: &mut Mutation<'_, A>,
        r: Ref,
        key: ObjKey,
        col: ColKey,
        value: &Value,
    ) -> Result<Ref> {
        let mem = self.arena.translate(r)?;
        match &*mem {
            Node::Inner(inner) => {
                let i = inner
                    .route_lookup(key)
                    .ok_or(ClusterError::KeyNotFound(key))?;
                let entry = inner.child(i);
                let child = self.set_rec(m, entry.child, key, col, value)?;
                if child == entry.child {
                    return Ok(r);
                }
                let mut inner = inner.clone();
                inner.set_child(i, ChildEntry { child, ..entry });
                m.store(r, Node::Inner(inner))
            }
            Node::Leaf(leaf) => {
                let ndx = leaf
                    .find(key)
                    .map_err(|_| ClusterError::KeyNotFound(key))?;
                let mut leaf = leaf.clone();
                if !leaf.has_column(col) {
                    leaf.insert_column(col, self.default_for(col));
                }
                leaf.set(col, ndx, value.clone())?;
                m.store(r, Node::Leaf(leaf))
            }
        }
    }

    /// Rewrite leaves in place. `f` returns whether it changed the leaf;
    /// unchanged leaves are not written.
    fn rewrite_leaves(
        &self,
        m: &mut Mutation<'_, A>,
        r: Ref,
        f: &mut dyn FnMut(&mut Cluster) -> Result<bool>,
    ) -> Result<Ref> {
        let mem = self.arena.translate(r)?;
        match &*mem {
            Node::Leaf(leaf) => {
                let mut leaf = leaf.clone();
                if !f(&mut leaf)? {
                    return Ok(r);
                }
                m.store(r, Node::Leaf(leaf))
            }
            Node::Inner(inner) => {
                let mut updated: Option<ClusterNodeInner> = None;
                for (i, entry) in inner.children().iter().enumerate() {
                    let child = self.rewrite_leaves(m, entry.child, f)?;
                    if child != entry.child {
                        updated
                            .get_or_insert_with(|| inner.clone())
                            .set_child(i, ChildEntry { child, ..*entry });
                    }
                }
                match updated {
                    Some(inner) => m.store(r, Node::Inner(inner)),
                    None => Ok(r),
                }
            }
        }
    }

    /// Apply `f` to every leaf in key order.
    ///
    /// `f` may change field values but not keys; a leaf whose keys change
    /// fails the whole update and leaves the tree untouched.
    #[instrument(skip(self, f), fields(table = %self.table))]
    pub fn update(&mut self, mut f: impl FnMut(&mut Cluster)) -> Result<()> {
        self.mutate(false, |tree, m| {
            let root = tree.rewrite_leaves(m, tree.root, &mut |leaf: &mut Cluster| -> Result<bool> {
                let before = (leaf.len(), leaf.first_key(), leaf.last_key());
                f(leaf);
                if (leaf.len(), leaf.first_key(), leaf.last_key()) != before {
                    return Err(ClusterError::Corrupted(
                        "update changed the keys of a leaf".to_string(),
                    ));
                }
                Ok(true)
            })?;
            Ok((root, ()))
        })
    }

    /// Visit every leaf in key order. Returns true if `f` stopped early.
    pub fn traverse(&self, mut f: impl FnMut(&Cluster) -> bool) -> Result<bool> {
        self.walk(|_, node| {
            Ok(match node {
                Node::Leaf(leaf) => f(leaf),
                Node::Inner(_) => false,
            })
        })
    }

    /// Pre-order walk over every node, children left to right
    fn walk(&self, mut visit: impl FnMut(Ref, &Node) -> Result<bool>) -> Result<bool> {
        let mut stack = vec![self.root];
        while let Some(r) = stack.pop() {
            let mem = self.arena.translate(r)?;
            if visit(r, &*mem)? {
                return Ok(true);
            }
            if let Node::Inner(inner) = &*mem {
                stack.extend(inner.children().iter().rev().map(|c| c.child));
            }
        }
        Ok(false)
    }

    /// Erase an object, recording its links in `state` for the cascade
    #[instrument(skip(self, state), fields(table = %self.table))]
    pub fn erase(&mut self, key: ObjKey, state: &mut CascadeState) -> Result<()> {
        let removed = self.mutate(true, |tree, m| {
            let (node, removed) = tree.erase_rec(m, tree.root, key)?;
            let root = match node {
                Node::Inner(inner) if inner.len() == 1 => {
                    m.release(tree.root);
                    debug!(table = %tree.table, "collapsed root");
                    inner.child(0).child
                }
                node => m.store(tree.root, node)?,
            };
            Ok((root, removed))
        })?;
        self.size -= 1;
        trace!(%key, size = self.size, "erased object");

        state.mark_erased(self.table, key);
        self.record_links(&removed, state);
        self.nullify_links(key, state);
        Ok(())
    }

    fn erase_rec(
        &self,
        m: &mut Mutation<'_, A>,
        r: Ref,
        key: ObjKey,
    ) -> Result<(Node, Vec<(ColKey, Value)>)> {
        let mem = self.arena.translate(r)?;
        match &*mem {
            Node::Leaf(leaf) => {
                let ndx = leaf
                    .find(key)
                    .map_err(|_| ClusterError::KeyNotFound(key))?;
                let mut leaf = leaf.clone();
                let removed = leaf.erase_row(ndx);
                Ok((Node::Leaf(leaf), removed))
            }
            Node::Inner(inner) => {
                let i = inner
                    .route_lookup(key)
                    .ok_or(ClusterError::KeyNotFound(key))?;
                let entry = inner.child(i);
                let (child, removed) = self.erase_rec(m, entry.child, key)?;
                let mut inner = inner.clone();
                if inner.len() > 1 && self.config.is_underfull(&child) {
                    self.rebalance(m, &mut inner, i, entry.child, child)?;
                } else {
                    inner.set_child(i, m.store_entry(entry.child, child)?);
                }
                Ok((Node::Inner(inner), removed))
            }
        }
    }

    /// Merge an underfull child with a neighbor, or even out the two if they
    /// do not fit in one node
    fn rebalance(
        &self,
        m: &mut Mutation<'_, A>,
        inner: &mut ClusterNodeInner,
        i: usize,
        child_ref: Ref,
        child: Node,
    ) -> Result<()> {
        let (left_i, right_i) = if i > 0 { (i - 1, i) } else { (i, i + 1) };
        let sibling_i = if i > 0 { left_i } else { right_i };
        let sibling_ref = inner.child(sibling_i).child;
        let sibling = self.arena.translate(sibling_ref)?.to_owned_block();
        let (mut left, right, left_ref, right_ref) = if sibling_i < i {
            (sibling, child, sibling_ref, child_ref)
        } else {
            (child, sibling, child_ref, sibling_ref)
        };

        left.append(right, |col| self.default_for(col))?;
        if left.len() <= self.config.capacity(&left) {
            let entry = m.store_entry(left_ref, left)?;
            m.release(right_ref);
            inner.remove_child(right_i);
            inner.set_child(left_i, entry);
            debug!(left = %left_ref, right = %right_ref, "merged nodes");
        } else {
            let right = left.split_off((left.len() + 1) / 2);
            let right_entry = m.store_entry(right_ref, right)?;
            let left_entry = m.store_entry(left_ref, left)?;
            inner.set_child(left_i, left_entry);
            inner.set_child(right_i, right_entry);
            debug!(left = %left_ref, right = %right_ref, "redistributed nodes");
        }
        Ok(())
    }

    /// Schedule the targets of a removed row's links
    fn record_links(&self, row: &[(ColKey, Value)], state: &mut CascadeState) {
        for (col, value) in row {
            if let Some(target) = self.schema.link_target(self.table, *col) {
                for linked in value.links() {
                    state.schedule_delete(target.table, linked, target.strength);
                }
            }
        }
    }

    /// Schedule removal of every link pointing at `key` from other objects
    pub fn nullify_links(&self, key: ObjKey, state: &mut CascadeState) {
        for (origin_table, origin_col) in self.schema.incoming_links(self.table) {
            state.schedule_nullify(origin_table, origin_col, self.table, key);
        }
    }

    /// Remove links to any of `targets` from one link column. Returns the
    /// number of fields changed.
    pub fn remove_links(&mut self, col: ColKey, targets: &BTreeSet<ObjKey>) -> Result<usize> {
        if targets.is_empty() {
            return Ok(0);
        }
        let mut changed = 0;
        self.mutate(false, |tree, m| {
            let root = tree.rewrite_leaves(m, tree.root, &mut |leaf: &mut Cluster| -> Result<bool> {
                let mut touched = false;
                for ndx in 0..leaf.len() {
                    let Some(mut value) = leaf.get(col, ndx) else {
                        return Ok(false);
                    };
                    if value.remove_links(targets) {
                        leaf.set(col, ndx, value)?;
                        changed += 1;
                        touched = true;
                    }
                }
                Ok(touched)
            })?;
            Ok((root, ()))
        })?;
        if changed > 0 {
            debug!(table = %self.table, %col, changed, "removed dangling links");
        }
        Ok(changed)
    }

    /// Remove every object, recording their links in `state`
    #[instrument(skip(self, state), fields(table = %self.table))]
    pub fn clear(&mut self, state: &mut CascadeState) -> Result<()> {
        let mut nodes = Vec::new();
        let mut rows = Vec::with_capacity(self.size);
        let link_cols: Vec<ColKey> = self
            .schema
            .columns(self.table)
            .into_iter()
            .filter(|c| c.link.is_some())
            .map(|c| c.key)
            .collect();
        self.walk(|r, node| {
            nodes.push(r);
            if let Node::Leaf(leaf) = node {
                for ndx in 0..leaf.len() {
                    let links: Vec<(ColKey, Value)> = link_cols
                        .iter()
                        .filter_map(|col| leaf.get(*col, ndx).map(|v| (*col, v)))
                        .collect();
                    rows.push((leaf.key(ndx), links));
                }
            }
            Ok(false)
        })?;

        let empty = self.empty_leaf();
        self.mutate(true, |_, m| {
            let root = m.allocate(empty)?;
            for r in nodes {
                m.release(r);
            }
            Ok((root, ()))
        })?;
        debug!(table = %self.table, objects = rows.len(), "cleared tree");
        self.size = 0;

        for (key, links) in rows {
            state.mark_erased(self.table, key);
            self.record_links(&links, state);
            self.nullify_links(key, state);
        }
        Ok(())
    }

    /// Add a column to every leaf, filled with its default
    pub fn insert_column(&mut self, col: ColKey) -> Result<()> {
        let default = self.default_for(col);
        self.mutate(true, |tree, m| {
            let root = tree.rewrite_leaves(m, tree.root, &mut |leaf: &mut Cluster| -> Result<bool> {
                Ok(leaf.insert_column(col, default.clone()))
            })?;
            Ok((root, ()))
        })?;
        debug!(table = %self.table, %col, "inserted column");
        Ok(())
    }

    /// Drop a column from every leaf
    pub fn remove_column(&mut self, col: ColKey) -> Result<()> {
        self.mutate(true, |tree, m| {
            let root = tree.rewrite_leaves(m, tree.root, &mut |leaf: &mut Cluster| -> Result<bool> {
                Ok(leaf.remove_column(col))
            })?;
            Ok((root, ()))
        })?;
        debug!(table = %self.table, %col, "removed column");
        Ok(())
    }

    /// Intern a string column when it has few distinct values.
    ///
    /// Returns true if the column was converted. Reads are unaffected either
    /// way.
    #[instrument(skip(self), fields(table = %self.table))]
    pub fn enumerate_string_column(&mut self, col: ColKey) -> Result<bool> {
        let spec = self
            .schema
            .column(self.table, col)
            .ok_or(ClusterError::ColumnNotFound(col))?;
        if spec.column_type != ColumnType::String {
            return Err(ClusterError::TypeMismatch {
                column: col,
                expected: ColumnType::String.as_str().to_string(),
                actual: spec.column_type.as_str().to_string(),
            });
        }

        let mut distinct = BTreeSet::new();
        self.traverse(|leaf| {
            for ndx in 0..leaf.len() {
                if let Some(Value::String(s)) = leaf.get(col, ndx) {
                    distinct.insert(s);
                }
            }
            false
        })?;
        if self.size == 0 || distinct.len() * 2 > self.size {
            debug!(distinct = distinct.len(), size = self.size, "not worth interning");
            return Ok(false);
        }

        let dictionary = Arc::new(distinct.into_iter().collect::<Vec<_>>());
        self.mutate(false, |tree, m| {
            let root = tree.rewrite_leaves(m, tree.root, &mut |leaf: &mut Cluster| -> Result<bool> {
                Ok(leaf.enumerate(col, &dictionary))
            })?;
            Ok((root, ()))
        })?;
        debug!(%col, entries = dictionary.len(), "interned string column");
        Ok(true)
    }

    /// Free every node. The tree must not be used afterwards.
    pub fn destroy(self) -> Result<()> {
        let mut nodes = Vec::new();
        self.walk(|r, _| {
            nodes.push(r);
            Ok(false)
        })?;
        for r in &nodes {
            self.arena.free(*r)?;
        }
        self.arena.bump_storage_version();
        debug!(table = %self.table, nodes = nodes.len(), "destroyed tree");
        Ok(())
    }

    /// Render every object, one per line, and log it at debug level
    pub fn dump_objects(&self) -> Result<String> {
        let mut out = String::new();
        self.traverse(|leaf| {
            for ndx in 0..leaf.len() {
                out.push_str(&format!("{}:", leaf.key(ndx).value()));
                for (col, value) in leaf.row(ndx) {
                    out.push_str(&format!(" {}={:?}", col.value(), value));
                }
                out.push('\n');
            }
            false
        })?;
        debug!(table = %self.table, "objects:\n{}", out);
        Ok(out)
    }

    /// Check every structural invariant of the tree
    pub fn verify(&self) -> Result<()> {
        let (count, _) = self.verify_node(self.root, true)?;
        if count != self.size {
            return Err(ClusterError::Corrupted(format!(
                "tree holds {} objects, size says {}",
                count, self.size
            )));
        }
        Ok(())
    }

    fn verify_node(&self, r: Ref, is_root: bool) -> Result<(usize, Option<(ObjKey, ObjKey)>)> {
        let mem = self.arena.translate(r)?;
        let capacity = self.config.capacity(&mem);
        if mem.len() > capacity {
            return Err(ClusterError::Corrupted(format!(
                "{} holds {} entries, capacity {}",
                r,
                mem.len(),
                capacity
            )));
        }
        match &*mem {
            Node::Leaf(leaf) => {
                leaf.verify()?;
                if !is_root && leaf.is_empty() {
                    return Err(ClusterError::Corrupted(format!("empty non-root leaf {}", r)));
                }
                Ok((leaf.len(), leaf.first_key().zip(leaf.last_key())))
            }
            Node::Inner(inner) => {
                inner.verify()?;
                if is_root && inner.len() < 2 {
                    return Err(ClusterError::Corrupted(format!(
                        "inner root {} has a single child",
                        r
                    )));
                }
                let mut total = 0;
                let mut range: Option<(ObjKey, ObjKey)> = None;
                for entry in inner.children() {
                    let (count, child_range) = self.verify_node(entry.child, false)?;
                    let (min, max) = child_range.ok_or_else(|| {
                        ClusterError::Corrupted(format!("empty subtree {}", entry.child))
                    })?;
                    if entry.count != count || entry.max_key != max {
                        return Err(ClusterError::Corrupted(format!(
                            "stale entry for {}: count {} max {}, actual {} {}",
                            entry.child, entry.count, entry.max_key, count, max
                        )));
                    }
                    if let Some((_, prev_max)) = range {
                        if min <= prev_max {
                            return Err(ClusterError::Corrupted(format!(
                                "subtree {} overlaps its left neighbor",
                                entry.child
                            )));
                        }
                    }
                    range = Some((range.map(|(lo, _)| lo).unwrap_or(min), max));
                    total += count;
                }
                Ok((total, range))
            }
        }
    }
}

impl<A: Allocator<Node>> fmt::Debug for ClusterTree<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterTree")
            .field("table", &self.table)
            .field("root", &self.root)
            .field("size", &self.size)
            .field("instance_version", &self.instance_version)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cascade::CascadeMode;
    use crate::MemorySchema;
    use clusterdb_arena::{ArenaConfig, ArenaError, MemoryArena};

    pub(crate) struct Fixture {
        pub tree: ClusterTree<MemoryArena<Node>>,
        pub schema: Arc<MemorySchema>,
        pub arena: Arc<MemoryArena<Node>>,
        pub num: ColKey,
        pub text: ColKey,
    }

    pub(crate) fn fixture_with(capacity: usize, arena: MemoryArena<Node>) -> Fixture {
        let schema = Arc::new(MemorySchema::new());
        let table = TableKey::new(1);
        schema.add_table(table, "items");
        let num = schema
            .add_column(table, "num", ColumnType::Int, false)
            .unwrap();
        let text = schema
            .add_column(table, "text", ColumnType::String, true)
            .unwrap();
        let arena = Arc::new(arena);
        let config = TreeConfig {
            leaf_capacity: capacity,
            inner_capacity: capacity,
        };
        let tree = ClusterTree::create(
            table,
            Arc::clone(&arena),
            Arc::clone(&schema) as Arc<dyn Schema>,
            config,
        )
        .unwrap();
        Fixture {
            tree,
            schema,
            arena,
            num,
            text,
        }
    }

    pub(crate) fn fixture(capacity: usize) -> Fixture {
        fixture_with(capacity, MemoryArena::new())
    }

    pub(crate) fn fill(f: &mut Fixture, keys: impl IntoIterator<Item = i64>) {
        for k in keys {
            f.tree
                .insert_fast(ObjKey::new(k), &[(f.num, Value::Int(k * 10))])
                .unwrap();
        }
    }

    fn keys(tree: &ClusterTree<MemoryArena<Node>>) -> Vec<i64> {
        tree.keys().unwrap().into_iter().map(|k| k.value()).collect()
    }

    fn leaves(tree: &ClusterTree<MemoryArena<Node>>) -> Vec<Vec<i64>> {
        let mut out = Vec::new();
        tree.traverse(|leaf| {
            out.push(leaf.keys().map(|k| k.value()).collect());
            false
        })
        .unwrap();
        out
    }

    #[test]
    fn test_config_validation() {
        assert!(TreeConfig::default().validate().is_ok());
        let config = TreeConfig {
            leaf_capacity: 3,
            inner_capacity: 16,
        };
        assert!(matches!(
            config.validate(),
            Err(ClusterError::Configuration(_))
        ));
    }

    #[test_log::test]
    fn test_split_and_merge_at_capacity_four() {
        let mut f = fixture(4);
        fill(&mut f, 1..=5);

        assert_eq!(leaves(&f.tree), vec![vec![1, 2, 3], vec![4, 5]]);
        assert_eq!(f.tree.get_ndx(ObjKey::new(4)).unwrap(), 3);
        f.tree.verify().unwrap();

        let mut state = CascadeState::new(CascadeMode::Strong);
        f.tree.erase(ObjKey::new(2), &mut state).unwrap();

        assert_eq!(leaves(&f.tree), vec![vec![1, 3], vec![4, 5]]);
        assert_eq!(f.tree.size(), 4);
        assert_eq!(keys(&f.tree), vec![1, 3, 4, 5]);
        f.tree.verify().unwrap();
    }

    #[test]
    fn test_get_and_positions() {
        let mut f = fixture(4);
        fill(&mut f, [50, 10, 40, 20, 30, 60, 70]);

        assert_eq!(keys(&f.tree), vec![10, 20, 30, 40, 50, 60, 70]);
        for (i, k) in [10, 20, 30, 40, 50, 60, 70].iter().enumerate() {
            assert_eq!(f.tree.get_ndx(ObjKey::new(*k)).unwrap(), i);
            assert_eq!(f.tree.get_by_index(i).unwrap().key(), ObjKey::new(*k));
        }
        assert_eq!(
            f.tree.get_value(ObjKey::new(30), f.num).unwrap(),
            Value::Int(300)
        );
        assert_eq!(f.tree.get_value(ObjKey::new(30), f.text).unwrap(), Value::Null);
        assert_eq!(f.tree.get_last_key_value().unwrap(), ObjKey::new(70));
        assert!(matches!(
            f.tree.get_by_index(7),
            Err(ClusterError::IndexOutOfRange { index: 7, size: 7 })
        ));
    }

    #[test]
    fn test_insert_errors_leave_tree_unchanged() {
        let mut f = fixture(4);
        fill(&mut f, 1..=4);

        assert_eq!(
            f.tree.insert_fast(ObjKey::new(3), &[]),
            Err(ClusterError::DuplicateKey(ObjKey::new(3)))
        );
        assert_eq!(
            f.tree.insert_fast(ObjKey::new(-4), &[]),
            Err(ClusterError::InvalidKey(ObjKey::new(-4)))
        );
        assert!(matches!(
            f.tree.insert_fast(ObjKey::new(9), &[(f.num, Value::from("x"))]),
            Err(ClusterError::TypeMismatch { .. })
        ));
        assert_eq!(f.tree.size(), 4);
        assert!(!f.tree.is_valid(ObjKey::new(9)));
        f.tree.verify().unwrap();
    }

    #[test]
    fn test_empty_tree() {
        let f = fixture(4);
        assert!(f.tree.is_empty());
        assert_eq!(f.tree.get_last_key_value().unwrap(), ObjKey::NULL);
        assert!(!f.tree.is_valid(ObjKey::new(0)));
        assert!(matches!(
            f.tree.get(ObjKey::new(0)),
            Err(ClusterError::KeyNotFound(_))
        ));
        let mut leaves = 0;
        f.tree
            .traverse(|leaf| {
                assert!(leaf.is_empty());
                leaves += 1;
                false
            })
            .unwrap();
        assert_eq!(leaves, 1);
        f.tree.verify().unwrap();
    }

    #[test]
    fn test_erase_missing_key() {
        let mut f = fixture(4);
        fill(&mut f, 1..=3);
        let versions = (f.tree.storage_version(), f.tree.content_version());

        let mut state = CascadeState::new(CascadeMode::Strong);
        assert_eq!(
            f.tree.erase(ObjKey::new(8), &mut state),
            Err(ClusterError::KeyNotFound(ObjKey::new(8)))
        );
        assert_eq!(versions, (f.tree.storage_version(), f.tree.content_version()));
        assert_eq!(state.erased_count(), 0);
    }

    #[test_log::test]
    fn test_grow_and_shrink_to_empty() {
        let mut f = fixture(4);
        let order: Vec<i64> = (0..200).map(|i| (i * 37) % 200).collect();
        fill(&mut f, order.iter().copied());
        f.tree.verify().unwrap();
        assert_eq!(keys(&f.tree), (0..200).collect::<Vec<_>>());
        assert!(!f.arena.translate(f.tree.root_ref()).unwrap().is_leaf());

        let mut state = CascadeState::new(CascadeMode::Strong);
        for (i, k) in order.iter().enumerate() {
            f.tree.erase(ObjKey::new(*k), &mut state).unwrap();
            assert_eq!(f.tree.size(), 199 - i);
            f.tree.verify().unwrap();
        }
        assert!(f.arena.translate(f.tree.root_ref()).unwrap().is_leaf());
        assert_eq!(f.arena.len(), 1);
        assert_eq!(state.erased_count(), 200);
    }

    #[test]
    fn test_set_value() {
        let mut f = fixture(4);
        fill(&mut f, 1..=6);
        let storage = f.tree.storage_version();
        let content = f.tree.content_version();

        f.tree
            .set_value(ObjKey::new(5), f.text, Value::from("five"))
            .unwrap();
        assert_eq!(
            f.tree.get_value(ObjKey::new(5), f.text).unwrap(),
            Value::from("five")
        );
        assert_eq!(f.tree.storage_version(), storage);
        assert!(f.tree.content_version() > content);

        assert_eq!(
            f.tree.set_value(ObjKey::new(5), f.num, Value::Null),
            Err(ClusterError::NullNotAllowed(f.num))
        );
        assert_eq!(
            f.tree.set_value(ObjKey::new(99), f.num, Value::Int(1)),
            Err(ClusterError::KeyNotFound(ObjKey::new(99)))
        );
        assert_eq!(
            f.tree.get_value(ObjKey::new(5), ColKey::new(999)),
            Err(ClusterError::ColumnNotFound(ColKey::new(999)))
        );
    }

    #[test]
    fn test_allocation_failure_during_split_is_atomic() {
        let mut f = fixture_with(
            4,
            MemoryArena::with_config(ArenaConfig { max_blocks: Some(1) }).unwrap(),
        );
        fill(&mut f, 1..=4);
        let versions = (f.tree.storage_version(), f.tree.content_version());
        let root = f.tree.root_ref();

        let result = f.tree.insert_fast(ObjKey::new(5), &[]);
        assert_eq!(
            result,
            Err(ClusterError::Arena(ArenaError::AllocationFailure { capacity: 1 }))
        );
        assert_eq!(f.tree.size(), 4);
        assert_eq!(f.tree.root_ref(), root);
        assert_eq!(keys(&f.tree), vec![1, 2, 3, 4]);
        assert_eq!(versions, (f.tree.storage_version(), f.tree.content_version()));
        assert_eq!(f.arena.len(), 1);
        f.tree.verify().unwrap();
    }

    #[test]
    fn test_clear_allocation_failure_keeps_objects() {
        let mut f = fixture_with(
            4,
            MemoryArena::with_config(ArenaConfig { max_blocks: Some(1) }).unwrap(),
        );
        fill(&mut f, 1..=3);

        let mut state = CascadeState::new(CascadeMode::Strong);
        assert!(f.tree.clear(&mut state).is_err());
        assert_eq!(f.tree.size(), 3);
        assert_eq!(state.erased_count(), 0);
    }

    #[test]
    fn test_frozen_nodes_are_copied_on_write() {
        let mut f = fixture(4);
        fill(&mut f, 1..=8);
        f.arena.freeze();
        let frozen_root = f.tree.root_ref();

        fill(&mut f, 9..=12);
        f.tree
            .set_value(ObjKey::new(1), f.num, Value::Int(-1))
            .unwrap();
        let mut state = CascadeState::new(CascadeMode::Strong);
        f.tree.erase(ObjKey::new(2), &mut state).unwrap();
        assert_ne!(f.tree.root_ref(), frozen_root);
        f.tree.verify().unwrap();

        let snapshot = ClusterTree::attach(
            f.tree.table(),
            Arc::clone(&f.arena),
            Arc::clone(&f.schema) as Arc<dyn Schema>,
            f.tree.config().clone(),
            frozen_root,
        )
        .unwrap();
        assert_eq!(keys(&snapshot), (1..=8).collect::<Vec<_>>());
        assert_eq!(
            snapshot.get_value(ObjKey::new(1), f.num).unwrap(),
            Value::Int(10)
        );
        snapshot.verify().unwrap();
        assert_eq!(
            f.tree.get_value(ObjKey::new(1), f.num).unwrap(),
            Value::Int(-1)
        );
    }

    #[test]
    fn test_update_changes_values_only() {
        let mut f = fixture(4);
        fill(&mut f, 1..=9);
        let num = f.num;

        f.tree
            .update(|leaf| {
                for ndx in 0..leaf.len() {
                    let doubled = leaf.get(num, ndx).and_then(|v| v.as_int()).unwrap() * 2;
                    leaf.set(num, ndx, Value::Int(doubled)).unwrap();
                }
            })
            .unwrap();
        assert_eq!(
            f.tree.get_value(ObjKey::new(9), f.num).unwrap(),
            Value::Int(180)
        );

        let before = keys(&f.tree);
        let result = f.tree.update(|leaf| *leaf = Cluster::new([num]));
        assert!(matches!(result, Err(ClusterError::Corrupted(_))));
        assert_eq!(keys(&f.tree), before);
        f.tree.verify().unwrap();
    }

    #[test]
    fn test_traverse_stops_early() {
        let mut f = fixture(4);
        fill(&mut f, 1..=20);
        let mut visited = 0;
        let stopped = f
            .tree
            .traverse(|_| {
                visited += 1;
                visited == 2
            })
            .unwrap();
        assert!(stopped);
        assert_eq!(visited, 2);
    }

    #[test]
    fn test_column_propagation() {
        let mut f = fixture(4);
        fill(&mut f, 1..=9);
        let table = f.tree.table();
        let flag = f
            .schema
            .add_column(table, "flag", ColumnType::Bool, false)
            .unwrap();

        // Not yet propagated: reads synthesize the default
        assert_eq!(
            f.tree.get_value(ObjKey::new(3), flag).unwrap(),
            Value::Bool(false)
        );
        f.tree.insert_column(flag).unwrap();
        f.tree.set_value(ObjKey::new(3), flag, Value::Bool(true)).unwrap();
        assert_eq!(
            f.tree.get_value(ObjKey::new(3), flag).unwrap(),
            Value::Bool(true)
        );
        f.tree.verify().unwrap();

        f.schema.remove_column(table, flag).unwrap();
        f.tree.remove_column(flag).unwrap();
        assert_eq!(
            f.tree.get_value(ObjKey::new(3), flag),
            Err(ClusterError::ColumnNotFound(flag))
        );
        f.tree
            .traverse(|leaf| {
                assert!(!leaf.has_column(flag));
                false
            })
            .unwrap();
    }

    #[test]
    fn test_enumerate_string_column() {
        let mut f = fixture(4);
        for k in 0..12 {
            let text = ["red", "green", "blue"][k as usize % 3];
            f.tree
                .insert_fast(ObjKey::new(k), &[(f.text, Value::from(text))])
                .unwrap();
        }
        let before: Vec<Value> = (0..12)
            .map(|k| f.tree.get_value(ObjKey::new(k), f.text).unwrap())
            .collect();

        assert!(f.tree.enumerate_string_column(f.text).unwrap());
        let after: Vec<Value> = (0..12)
            .map(|k| f.tree.get_value(ObjKey::new(k), f.text).unwrap())
            .collect();
        assert_eq!(before, after);
        let text = f.text;
        f.tree
            .traverse(|leaf| {
                assert!(leaf.field_array(text).unwrap().is_enumerated());
                false
            })
            .unwrap();

        // Inserts after interning still read back
        f.tree
            .insert_fast(ObjKey::new(12), &[(f.text, Value::from("violet"))])
            .unwrap();
        assert_eq!(
            f.tree.get_value(ObjKey::new(12), f.text).unwrap(),
            Value::from("violet")
        );
        f.tree.verify().unwrap();
    }

    #[test]
    fn test_enumerate_rejects_unsuitable_columns() {
        let mut f = fixture(4);
        for k in 0..4 {
            f.tree
                .insert_fast(ObjKey::new(k), &[(f.text, Value::String(format!("v{}", k)))])
                .unwrap();
        }
        assert!(!f.tree.enumerate_string_column(f.text).unwrap());
        assert!(matches!(
            f.tree.enumerate_string_column(f.num),
            Err(ClusterError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_clear() {
        let mut f = fixture(4);
        fill(&mut f, 0..30);
        let mut state = CascadeState::new(CascadeMode::Strong);

        f.tree.clear(&mut state).unwrap();
        assert!(f.tree.is_empty());
        assert_eq!(state.erased_count(), 30);
        assert_eq!(f.arena.len(), 1);
        f.tree.verify().unwrap();

        fill(&mut f, [7]);
        assert_eq!(keys(&f.tree), vec![7]);
    }

    #[test]
    fn test_destroy_frees_every_node() {
        let mut f = fixture(4);
        fill(&mut f, 0..30);
        f.tree.destroy().unwrap();
        assert!(f.arena.is_empty());
    }

    #[test]
    fn test_dump_objects() {
        let mut f = fixture(4);
        fill(&mut f, [3, 1]);
        let dump = f.tree.dump_objects().unwrap();
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("1:"));
        assert!(lines[1].contains("Int(30)"));
    }
}
