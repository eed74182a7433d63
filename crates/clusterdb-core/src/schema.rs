//! Column descriptors consumed by the cluster tree
//!
//! The tree only asks three things of a schema: does a column exist, what is
//! its default value, and if it is a link, where does it point and how
//! strongly. Answers are read on every call and never cached, so changes to
//! link strength are honored mid-cascade.

use crate::{ClusterError, ColKey, ColumnType, Result, TableKey, Value};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// How deleting an object affects the objects it links to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStrength {
    /// Targets survive; only links to deleted objects are cleared
    Weak,
    /// Targets are deleted together with the origin
    Strong,
}

/// Where a link column points
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkTarget {
    /// Target table
    pub table: TableKey,
    /// Cascade policy
    pub strength: LinkStrength,
}

/// Descriptor of one column
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColumnSpec {
    /// Column key
    pub key: ColKey,
    /// Owning table
    pub table: TableKey,
    /// Column name
    pub name: String,
    /// Physical type
    pub column_type: ColumnType,
    /// Whether null may be stored
    pub nullable: bool,
    /// Link target, for link columns
    pub link: Option<LinkTarget>,
}

impl ColumnSpec {
    /// Value of this column for rows that never set it
    pub fn default_value(&self) -> Value {
        self.column_type.default_value(self.nullable)
    }

    /// Check that a value may be stored in this column
    pub fn check(&self, value: &Value) -> Result<()> {
        if value.is_null() {
            if self.nullable || self.column_type == ColumnType::Link {
                return Ok(());
            }
            return Err(ClusterError::NullNotAllowed(self.key));
        }
        if !self.column_type.accepts(value) {
            return Err(ClusterError::TypeMismatch {
                column: self.key,
                expected: self.column_type.as_str().to_string(),
                actual: value.type_name().to_string(),
            });
        }
        if let Value::Dictionary(dict) = value {
            dict.validate()?;
        }
        Ok(())
    }
}

/// Trait for schema backends
pub trait Schema: Send + Sync {
    /// Look up a column of a table
    fn column(&self, table: TableKey, col: ColKey) -> Option<ColumnSpec>;

    /// All columns of a table, in creation order
    fn columns(&self, table: TableKey) -> Vec<ColumnSpec>;

    /// Every `(origin table, origin column)` whose links point into `target`
    fn incoming_links(&self, target: TableKey) -> Vec<(TableKey, ColKey)>;

    /// Check if a column exists
    fn has_column(&self, table: TableKey, col: ColKey) -> bool {
        self.column(table, col).is_some()
    }

    /// Link target of a column, if it is a link column
    fn link_target(&self, table: TableKey, col: ColKey) -> Option<LinkTarget> {
        self.column(table, col).and_then(|spec| spec.link)
    }

    /// Default value of a column
    fn default_value(&self, table: TableKey, col: ColKey) -> Option<Value> {
        self.column(table, col).map(|spec| spec.default_value())
    }
}

#[derive(Clone, Debug, Default)]
struct TableSpec {
    name: String,
    columns: Vec<ColumnSpec>,
}

/// An in-memory schema
#[derive(Debug)]
pub struct MemorySchema {
    tables: RwLock<BTreeMap<TableKey, TableSpec>>,
    next_col: AtomicU64,
}

impl MemorySchema {
    /// Create a new empty schema
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(BTreeMap::new()),
            next_col: AtomicU64::new(1),
        }
    }

    /// Register a table
    pub fn add_table(&self, table: TableKey, name: impl Into<String>) {
        self.tables.write().insert(
            table,
            TableSpec {
                name: name.into(),
                columns: Vec::new(),
            },
        );
    }

    /// Forget a table and its columns
    pub fn remove_table(&self, table: TableKey) -> Result<()> {
        self.tables
            .write()
            .remove(&table)
            .map(|_| ())
            .ok_or(ClusterError::NoSuchTable(table))
    }

    /// Check if a table is registered
    pub fn has_table(&self, table: TableKey) -> bool {
        self.tables.read().contains_key(&table)
    }

    /// Get a table's name
    pub fn table_name(&self, table: TableKey) -> Option<String> {
        self.tables.read().get(&table).map(|t| t.name.clone())
    }

    /// Find a table by name
    pub fn find_table(&self, name: &str) -> Option<TableKey> {
        self.tables
            .read()
            .iter()
            .find(|(_, t)| t.name == name)
            .map(|(key, _)| *key)
    }

    /// Add a value column
    pub fn add_column(
        &self,
        table: TableKey,
        name: impl Into<String>,
        column_type: ColumnType,
        nullable: bool,
    ) -> Result<ColKey> {
        if column_type.is_link() {
            return Err(ClusterError::Configuration(
                "link columns need a target, use add_link_column".to_string(),
            ));
        }
        self.push_column(table, name.into(), column_type, nullable, None)
    }

    /// Add a link column (`Link` or `LinkList`) pointing into `target`
    pub fn add_link_column(
        &self,
        table: TableKey,
        name: impl Into<String>,
        column_type: ColumnType,
        target: TableKey,
        strength: LinkStrength,
    ) -> Result<ColKey> {
        if !column_type.is_link() {
            return Err(ClusterError::Configuration(format!(
                "{} is not a link type",
                column_type.as_str()
            )));
        }
        if !self.has_table(target) {
            return Err(ClusterError::NoSuchTable(target));
        }
        let link = LinkTarget {
            table: target,
            strength,
        };
        self.push_column(table, name.into(), column_type, true, Some(link))
    }

    fn push_column(
        &self,
        table: TableKey,
        name: String,
        column_type: ColumnType,
        nullable: bool,
        link: Option<LinkTarget>,
    ) -> Result<ColKey> {
        let mut tables = self.tables.write();
        let spec = tables
            .get_mut(&table)
            .ok_or(ClusterError::NoSuchTable(table))?;
        if spec.columns.iter().any(|c| c.name == name) {
            return Err(ClusterError::Configuration(format!(
                "column {} already exists",
                name
            )));
        }
        let key = ColKey::new(self.next_col.fetch_add(1, Ordering::Relaxed));
        spec.columns.push(ColumnSpec {
            key,
            table,
            name,
            column_type,
            nullable,
            link,
        });
        Ok(key)
    }

    /// Remove a column and return its descriptor
    pub fn remove_column(&self, table: TableKey, col: ColKey) -> Result<ColumnSpec> {
        let mut tables = self.tables.write();
        let spec = tables
            .get_mut(&table)
            .ok_or(ClusterError::NoSuchTable(table))?;
        let pos = spec
            .columns
            .iter()
            .position(|c| c.key == col)
            .ok_or(ClusterError::ColumnNotFound(col))?;
        Ok(spec.columns.remove(pos))
    }

    /// Change the cascade policy of a link column
    pub fn set_link_strength(
        &self,
        table: TableKey,
        col: ColKey,
        strength: LinkStrength,
    ) -> Result<()> {
        let mut tables = self.tables.write();
        let column = tables
            .get_mut(&table)
            .and_then(|t| t.columns.iter_mut().find(|c| c.key == col))
            .ok_or(ClusterError::ColumnNotFound(col))?;
        match column.link.as_mut() {
            Some(link) => {
                link.strength = strength;
                Ok(())
            }
            None => Err(ClusterError::TypeMismatch {
                column: col,
                expected: "link".to_string(),
                actual: column.column_type.as_str().to_string(),
            }),
        }
    }

    /// Find a column by name
    pub fn find_column(&self, table: TableKey, name: &str) -> Option<ColKey> {
        self.tables
            .read()
            .get(&table)?
            .columns
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.key)
    }
}

impl Default for MemorySchema {
    fn default() -> Self {
        Self::new()
    }
}

impl Schema for MemorySchema {
    fn column(&self, table: TableKey, col: ColKey) -> Option<ColumnSpec> {
        self.tables
            .read()
            .get(&table)?
            .columns
            .iter()
            .find(|c| c.key == col)
            .cloned()
    }

    fn columns(&self, table: TableKey) -> Vec<ColumnSpec> {
        self.tables
            .read()
            .get(&table)
            .map(|t| t.columns.clone())
            .unwrap_or_default()
    }

    fn incoming_links(&self, target: TableKey) -> Vec<(TableKey, ColKey)> {
        self.tables
            .read()
            .values()
            .flat_map(|t| t.columns.iter())
            .filter(|c| c.link.map(|l| l.table) == Some(target))
            .map(|c| (c.table, c.key))
            .collect()
    }
}
