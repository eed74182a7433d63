//! Cascading deletion across tables
//!
//! Erasing an object seeds a [`CascadeState`] with the objects it strongly
//! links to and with the link columns that may still point at it.
//! [`remove_recursive`] then drains the work-list one object at a time,
//! never recursing and never erasing the same object twice, so cyclic link
//! graphs terminate. Dangling links are cleared in a final pass.

use crate::cluster::{ClusterTree, Node};
use crate::{ColKey, LinkStrength, ObjKey, Result, TableKey};
use clusterdb_arena::Allocator;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::{debug, instrument, trace};

/// Which links pull their targets into a deletion
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CascadeMode {
    /// Never delete targets, only clear links to deleted objects
    None,
    /// Follow strong link columns
    #[default]
    Strong,
    /// Follow every link column
    All,
}

impl CascadeMode {
    /// Check if a link of this strength pulls its target in
    pub fn follows(&self, strength: LinkStrength) -> bool {
        match self {
            CascadeMode::None => false,
            CascadeMode::Strong => strength == LinkStrength::Strong,
            CascadeMode::All => true,
        }
    }
}

/// A link column entry that must stop pointing at a deleted object
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LinkNullification {
    /// Table holding the link column
    pub origin_table: TableKey,
    /// The link column
    pub origin_col: ColKey,
    /// Table of the deleted object
    pub target_table: TableKey,
    /// The deleted object
    pub target: ObjKey,
}

/// Accumulated work of one cascading delete
#[derive(Clone, Debug, Default)]
pub struct CascadeState {
    mode: CascadeMode,
    pending: BTreeSet<(TableKey, ObjKey)>,
    erased: HashSet<(TableKey, ObjKey)>,
    nullifications: BTreeSet<LinkNullification>,
}

impl CascadeState {
    /// Create an empty state
    pub fn new(mode: CascadeMode) -> Self {
        Self {
            mode,
            ..Default::default()
        }
    }

    /// Get the cascade mode
    pub fn mode(&self) -> CascadeMode {
        self.mode
    }

    /// Queue a link target for deletion if the mode follows this strength.
    /// Returns true if it was queued.
    pub fn schedule_delete(&mut self, table: TableKey, key: ObjKey, strength: LinkStrength) -> bool {
        if !self.mode.follows(strength) || self.erased.contains(&(table, key)) {
            return false;
        }
        let queued = self.pending.insert((table, key));
        if queued {
            trace!(%table, %key, "queued cascade delete");
        }
        queued
    }

    /// Queue removal of links from `origin_col` to a deleted object
    pub fn schedule_nullify(
        &mut self,
        origin_table: TableKey,
        origin_col: ColKey,
        target_table: TableKey,
        target: ObjKey,
    ) {
        self.nullifications.insert(LinkNullification {
            origin_table,
            origin_col,
            target_table,
            target,
        });
    }

    /// Record that an object is gone
    pub fn mark_erased(&mut self, table: TableKey, key: ObjKey) {
        self.pending.remove(&(table, key));
        self.erased.insert((table, key));
    }

    /// Check if an object was erased during this cascade
    pub fn is_erased(&self, table: TableKey, key: ObjKey) -> bool {
        self.erased.contains(&(table, key))
    }

    /// Objects still waiting to be erased
    pub fn pending(&self) -> impl Iterator<Item = &(TableKey, ObjKey)> {
        self.pending.iter()
    }

    /// Number of objects erased so far
    pub fn erased_count(&self) -> usize {
        self.erased.len()
    }

    /// Scheduled link removals
    pub fn nullifications(&self) -> impl Iterator<Item = &LinkNullification> {
        self.nullifications.iter()
    }

    fn pop_pending(&mut self) -> Option<(TableKey, ObjKey)> {
        self.pending.pop_first()
    }

    /// Take the scheduled link removals, grouped by origin column
    fn take_nullifications(&mut self) -> BTreeMap<(TableKey, ColKey), BTreeSet<ObjKey>> {
        let mut grouped: BTreeMap<(TableKey, ColKey), BTreeSet<ObjKey>> = BTreeMap::new();
        for n in std::mem::take(&mut self.nullifications) {
            grouped
                .entry((n.origin_table, n.origin_col))
                .or_default()
                .insert(n.target);
        }
        grouped
    }
}

/// Resolves table identity for the cascade walker
pub trait TableResolver<A: Allocator<Node>> {
    /// Get the tree storing a table
    fn tree_mut(&mut self, table: TableKey) -> Result<&mut ClusterTree<A>>;
}

/// Drain a cascade: erase every pending object, then clear every link that
/// still points at an erased one. Returns the number of objects erased by
/// the walk itself.
#[instrument(skip(resolver, state), fields(mode = ?state.mode()))]
pub fn remove_recursive<A, R>(resolver: &mut R, state: &mut CascadeState) -> Result<usize>
where
    A: Allocator<Node>,
    R: TableResolver<A> + ?Sized,
{
    let mut erased = 0;
    while let Some((table, key)) = state.pop_pending() {
        if state.is_erased(table, key) {
            continue;
        }
        let tree = resolver.tree_mut(table)?;
        if !tree.is_valid(key) {
            trace!(%table, %key, "cascade target already gone");
            continue;
        }
        tree.erase(key, state)?;
        erased += 1;
    }

    let mut cleared = 0;
    for ((origin_table, origin_col), targets) in state.take_nullifications() {
        let tree = resolver.tree_mut(origin_table)?;
        if !tree.schema().has_column(origin_table, origin_col) {
            continue;
        }
        cleared += tree.remove_links(origin_col, &targets)?;
    }
    debug!(erased, cleared, "cascade finished");
    Ok(erased)
}
