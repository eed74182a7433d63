//! Table registry
//!
//! A [`Group`] owns one cluster tree per table. All trees share one arena
//! and one schema, so links between tables can be followed and frozen
//! together.

use crate::cascade::{remove_recursive, CascadeMode, CascadeState, TableResolver};
use crate::cluster::{ClusterTree, Node, TreeConfig};
use crate::{
    ClusterError, ColKey, ColumnType, DictionaryRef, LinkStrength, MemorySchema, Obj, ObjKey,
    Result, Schema, TableKey, Value,
};
use clusterdb_arena::{Allocator, ArenaConfig, MemoryArena, Ref};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Configuration for a group
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupConfig {
    /// Node sizes of every tree
    pub tree: TreeConfig,
    /// Arena limits
    pub arena: ArenaConfig,
    /// Cascade policy of `remove_object` and `clear_table`
    pub cascade_mode: CascadeMode,
}

impl GroupConfig {
    /// Parse and validate a JSON configuration
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for nonsensical values
    pub fn validate(&self) -> Result<()> {
        self.tree.validate()?;
        self.arena.validate()?;
        Ok(())
    }
}

/// A reference to one materialization of a table.
///
/// Goes stale when the table is removed or recreated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TableRef {
    table: TableKey,
    instance_version: u64,
}

impl TableRef {
    /// Get the table key
    pub fn key(&self) -> TableKey {
        self.table
    }

    /// Instance version the reference was taken at
    pub fn instance_version(&self) -> u64 {
        self.instance_version
    }
}

/// Root refs of every table at the moment of a freeze
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Snapshot {
    roots: BTreeMap<TableKey, Ref>,
}

impl Snapshot {
    /// Root of one table
    pub fn root(&self, table: TableKey) -> Option<Ref> {
        self.roots.get(&table).copied()
    }

    /// Tables captured by the snapshot
    pub fn tables(&self) -> impl Iterator<Item = TableKey> + '_ {
        self.roots.keys().copied()
    }
}

/// A set of tables sharing an arena and a schema
pub struct Group<A: Allocator<Node> = MemoryArena<Node>> {
    arena: Arc<A>,
    schema: Arc<MemorySchema>,
    tables: BTreeMap<TableKey, ClusterTree<A>>,
    config: GroupConfig,
    next_table: u32,
}

impl Group<MemoryArena<Node>> {
    /// Create an empty group backed by an in-memory arena
    pub fn new() -> Self {
        Self {
            arena: Arc::new(MemoryArena::new()),
            schema: Arc::new(MemorySchema::new()),
            tables: BTreeMap::new(),
            config: GroupConfig::default(),
            next_table: 1,
        }
    }

    /// Create with custom configuration
    pub fn with_config(config: GroupConfig) -> Result<Self> {
        let arena = MemoryArena::with_config(config.arena.clone())?;
        Self::with_arena(Arc::new(arena), config)
    }
}

impl Default for Group<MemoryArena<Node>> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Allocator<Node>> Group<A> {
    /// Create an empty group over an existing arena
    pub fn with_arena(arena: Arc<A>, config: GroupConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            arena,
            schema: Arc::new(MemorySchema::new()),
            tables: BTreeMap::new(),
            config,
            next_table: 1,
        })
    }

    /// Get the configuration
    pub fn config(&self) -> &GroupConfig {
        &self.config
    }

    /// Get the arena
    pub fn arena(&self) -> &Arc<A> {
        &self.arena
    }

    /// Get the schema
    pub fn schema(&self) -> &Arc<MemorySchema> {
        &self.schema
    }

    fn new_tree(&self, table: TableKey) -> Result<ClusterTree<A>> {
        let schema: Arc<dyn Schema> = Arc::clone(&self.schema) as Arc<dyn Schema>;
        ClusterTree::create(
            table,
            Arc::clone(&self.arena),
            schema,
            self.config.tree.clone(),
        )
    }

    /// Add an empty table
    #[instrument(skip(self))]
    pub fn add_table(&mut self, name: &str) -> Result<TableKey> {
        if self.schema.find_table(name).is_some() {
            return Err(ClusterError::Configuration(format!(
                "table {} already exists",
                name
            )));
        }
        let table = TableKey::new(self.next_table);
        self.schema.add_table(table, name);
        let tree = match self.new_tree(table) {
            Ok(tree) => tree,
            Err(err) => {
                self.schema.remove_table(table)?;
                return Err(err);
            }
        };
        self.tables.insert(table, tree);
        self.next_table += 1;
        info!(%table, name, "added table");
        Ok(table)
    }

    /// Find a table by name
    pub fn find_table(&self, name: &str) -> Option<TableKey> {
        self.schema.find_table(name)
    }

    /// Every table, in key order
    pub fn table_keys(&self) -> Vec<TableKey> {
        self.tables.keys().copied().collect()
    }

    /// Remove a table and free its storage. Fails while other tables link
    /// into it.
    #[instrument(skip(self))]
    pub fn remove_table(&mut self, table: TableKey) -> Result<()> {
        if !self.tables.contains_key(&table) {
            return Err(ClusterError::NoSuchTable(table));
        }
        if self
            .schema
            .incoming_links(table)
            .iter()
            .any(|(origin, _)| *origin != table)
        {
            return Err(ClusterError::TableInUse(table));
        }
        if let Some(tree) = self.tables.remove(&table) {
            tree.destroy()?;
        }
        self.schema.remove_table(table)?;
        info!(%table, "removed table");
        Ok(())
    }

    /// Replace a table's storage with a fresh empty tree. Links from other
    /// tables into the old objects are cleared. References and handles taken
    /// before become detached.
    #[instrument(skip(self))]
    pub fn recreate_table(&mut self, table: TableKey) -> Result<TableRef> {
        let mut state = CascadeState::new(CascadeMode::None);
        self.clear_table_with(table, &mut state)?;
        let fresh = self.new_tree(table)?;
        if let Some(old) = self.tables.insert(table, fresh) {
            old.destroy()?;
        }
        info!(%table, "recreated table");
        self.get_table(table)
    }

    /// Take a reference to the current materialization of a table
    pub fn get_table(&self, table: TableKey) -> Result<TableRef> {
        let tree = self.tree(table)?;
        Ok(TableRef {
            table,
            instance_version: tree.instance_version(),
        })
    }

    /// Resolve a table reference, failing if the table is gone or was
    /// recreated since
    pub fn checked(&self, table: &TableRef) -> Result<&ClusterTree<A>> {
        let tree = self
            .tables
            .get(&table.table)
            .ok_or(ClusterError::NoSuchTable(table.table))?;
        if tree.instance_version() != table.instance_version {
            return Err(ClusterError::DetachedAccessor);
        }
        Ok(tree)
    }

    /// Mutable variant of [`Group::checked`]
    pub fn checked_mut(&mut self, table: &TableRef) -> Result<&mut ClusterTree<A>> {
        let tree = self
            .tables
            .get_mut(&table.table)
            .ok_or(ClusterError::NoSuchTable(table.table))?;
        if tree.instance_version() != table.instance_version {
            return Err(ClusterError::DetachedAccessor);
        }
        Ok(tree)
    }

    /// Resolve a table reference, or `None` if it went stale
    pub fn checked_or_null(&self, table: &TableRef) -> Option<&ClusterTree<A>> {
        self.checked(table).ok()
    }

    /// Get the tree storing a table
    pub fn tree(&self, table: TableKey) -> Result<&ClusterTree<A>> {
        self.tables
            .get(&table)
            .ok_or(ClusterError::NoSuchTable(table))
    }

    /// Get the tree storing a table, mutably
    pub fn tree_mut(&mut self, table: TableKey) -> Result<&mut ClusterTree<A>> {
        self.tables
            .get_mut(&table)
            .ok_or(ClusterError::NoSuchTable(table))
    }

    /// Add a value column, backfilled with its default
    #[instrument(skip(self))]
    pub fn add_column(
        &mut self,
        table: TableKey,
        name: &str,
        column_type: ColumnType,
        nullable: bool,
    ) -> Result<ColKey> {
        self.tree(table)?;
        let col = self.schema.add_column(table, name, column_type, nullable)?;
        self.propagate_column(table, col)
    }

    /// Add a link column pointing into `target`
    #[instrument(skip(self))]
    pub fn add_link_column(
        &mut self,
        table: TableKey,
        name: &str,
        column_type: ColumnType,
        target: TableKey,
        strength: LinkStrength,
    ) -> Result<ColKey> {
        self.tree(table)?;
        let col = self
            .schema
            .add_link_column(table, name, column_type, target, strength)?;
        self.propagate_column(table, col)
    }

    fn propagate_column(&mut self, table: TableKey, col: ColKey) -> Result<ColKey> {
        if let Err(err) = self.tree_mut(table)?.insert_column(col) {
            self.schema.remove_column(table, col)?;
            return Err(err);
        }
        Ok(col)
    }

    /// Remove a column from the schema and every leaf
    #[instrument(skip(self))]
    pub fn remove_column(&mut self, table: TableKey, col: ColKey) -> Result<()> {
        self.tree(table)?;
        self.schema.remove_column(table, col)?;
        self.tree_mut(table)?.remove_column(col)
    }

    /// Change the cascade policy of a link column
    pub fn set_link_strength(
        &self,
        table: TableKey,
        col: ColKey,
        strength: LinkStrength,
    ) -> Result<()> {
        self.schema.set_link_strength(table, col, strength)
    }

    /// Check that every link in `values` points at a live object
    fn check_links(&self, table: TableKey, values: &[(ColKey, Value)]) -> Result<()> {
        for (col, value) in values {
            if let Some(target) = self.schema.link_target(table, *col) {
                let target_tree = self.tree(target.table)?;
                for key in value.links() {
                    if !target_tree.is_valid(key) {
                        return Err(ClusterError::KeyNotFound(key));
                    }
                }
            }
        }
        Ok(())
    }

    /// Create an object under the next free key
    pub fn create_object(&mut self, table: TableKey, values: &[(ColKey, Value)]) -> Result<ObjKey> {
        let last = self.tree(table)?.get_last_key_value()?;
        let key = if last.is_null() {
            ObjKey::new(0)
        } else {
            let next = last
                .value()
                .checked_add(1)
                .ok_or(ClusterError::InvalidKey(last))?;
            ObjKey::new(next)
        };
        self.create_object_with_key(table, key, values)
    }

    /// Create an object under a chosen key
    #[instrument(skip(self, values))]
    pub fn create_object_with_key(
        &mut self,
        table: TableKey,
        key: ObjKey,
        values: &[(ColKey, Value)],
    ) -> Result<ObjKey> {
        self.check_links(table, values)?;
        self.tree_mut(table)?.insert_fast(key, values)?;
        Ok(key)
    }

    /// Get a handle to an object
    pub fn get_object(&self, table: TableKey, key: ObjKey) -> Result<Obj> {
        self.tree(table)?.get(key)
    }

    /// Bind the dictionary stored in one field. Edits go through
    /// [`Group::tree_mut`].
    pub fn get_dictionary(
        &self,
        table: TableKey,
        key: ObjKey,
        col: ColKey,
    ) -> Result<DictionaryRef> {
        let tree = self.tree(table)?;
        DictionaryRef::new(tree, tree.get(key)?, col)
    }

    /// Read one field
    pub fn get_value(&self, table: TableKey, key: ObjKey, col: ColKey) -> Result<Value> {
        self.tree(table)?.get_value(key, col)
    }

    /// Overwrite one field
    pub fn set_value(&mut self, table: TableKey, key: ObjKey, col: ColKey, value: Value) -> Result<()> {
        self.check_links(table, std::slice::from_ref(&(col, value.clone())))?;
        self.tree_mut(table)?.set_value(key, col, value)
    }

    /// Erase an object together with everything its links cascade to.
    /// Returns the number of objects erased.
    pub fn remove_object(&mut self, table: TableKey, key: ObjKey) -> Result<usize> {
        let mut state = CascadeState::new(self.config.cascade_mode);
        self.remove_object_with(table, key, &mut state)
    }

    /// Erase an object using caller-provided cascade state
    #[instrument(skip(self, state))]
    pub fn remove_object_with(
        &mut self,
        table: TableKey,
        key: ObjKey,
        state: &mut CascadeState,
    ) -> Result<usize> {
        self.tree_mut(table)?.erase(key, state)?;
        let cascaded = remove_recursive(self, state)?;
        debug!(%table, %key, cascaded, "removed object");
        Ok(1 + cascaded)
    }

    /// Erase every object of a table and cascade. Returns the number of
    /// objects erased.
    pub fn clear_table(&mut self, table: TableKey) -> Result<usize> {
        let mut state = CascadeState::new(self.config.cascade_mode);
        self.clear_table_with(table, &mut state)
    }

    fn clear_table_with(&mut self, table: TableKey, state: &mut CascadeState) -> Result<usize> {
        let tree = self.tree_mut(table)?;
        let count = tree.size();
        tree.clear(state)?;
        let cascaded = remove_recursive(self, state)?;
        debug!(%table, count, cascaded, "cleared table");
        Ok(count + cascaded)
    }

    /// Make every node read-only and capture the current roots. Later writes
    /// copy the nodes they touch, leaving the snapshot intact.
    ///
    /// Replaced nodes stay in the arena, and count against `max_blocks`,
    /// until [`Group::release_snapshots`] drops them.
    pub fn freeze(&self) -> Snapshot {
        self.arena.freeze();
        let roots = self
            .tables
            .iter()
            .map(|(table, tree)| (*table, tree.root_ref()))
            .collect();
        debug!(tables = self.tables.len(), "froze group");
        Snapshot { roots }
    }

    /// Open a read view of one table as it was when `snapshot` was taken
    pub fn open_snapshot(&self, snapshot: &Snapshot, table: TableKey) -> Result<ClusterTree<A>> {
        let root = snapshot
            .root(table)
            .ok_or(ClusterError::NoSuchTable(table))?;
        let schema: Arc<dyn Schema> = Arc::clone(&self.schema) as Arc<dyn Schema>;
        ClusterTree::attach(
            table,
            Arc::clone(&self.arena),
            schema,
            self.config.tree.clone(),
            root,
        )
    }

    /// Drop the nodes only earlier snapshots still reach. Trees opened from
    /// those snapshots can no longer be read afterwards.
    pub fn release_snapshots(&self) -> usize {
        let released = self.arena.release_retired();
        debug!(released, "released snapshot nodes");
        released
    }

    /// Check every tree's invariants
    pub fn verify(&self) -> Result<()> {
        for (table, tree) in &self.tables {
            if let Err(err) = tree.verify() {
                warn!(%table, error = %err, "verification failed");
                return Err(err);
            }
        }
        Ok(())
    }
}

impl<A: Allocator<Node>> TableResolver<A> for Group<A> {
    fn tree_mut(&mut self, table: TableKey) -> Result<&mut ClusterTree<A>> {
        self.tables
            .get_mut(&table)
            .ok_or(ClusterError::NoSuchTable(table))
    }
}
