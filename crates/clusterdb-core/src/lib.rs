//! # Clusterdb Core
//!
//! Ordered object storage for an embedded database.
//!
//! This crate provides:
//! - **Cluster Trees**: copy-on-write B+-trees mapping object keys to rows
//! - **Row Handles and Cursors**: accessors that survive tree mutation
//! - **Cascading Deletion**: work-list driven deletes across linked tables
//! - **Dictionaries**: string-keyed maps stored in one field of an object
//! - **Groups**: tables sharing one arena and one schema
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │                 Group                   │
//! ├─────────────────────────────────────────┤
//! │   Cluster Trees    │  Cascade Walker    │
//! ├─────────────────────────────────────────┤
//! │      Schema        │      Arena         │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust
//! use clusterdb_core::{ColumnType, Group, Value};
//!
//! let mut group = Group::new();
//! let people = group.add_table("people").unwrap();
//! let name = group.add_column(people, "name", ColumnType::String, false).unwrap();
//!
//! let alice = group.create_object(people, &[(name, Value::from("alice"))]).unwrap();
//! assert_eq!(group.get_value(people, alice, name).unwrap(), Value::from("alice"));
//! ```

pub mod cascade;
pub mod cluster;
pub mod dictionary;
pub mod error;
pub mod group;
pub mod keys;
pub mod schema;
pub mod value;

pub use cascade::{remove_recursive, CascadeMode, CascadeState, LinkNullification, TableResolver};
pub use cluster::{
    ChildEntry, Cluster, ClusterNodeInner, ClusterTree, Cursor, CursorMut, FieldArray, Iter, Node,
    Obj, TreeConfig,
};
pub use dictionary::{Dictionary, DictionaryRef};
pub use error::{ClusterError, Result};
pub use group::{Group, GroupConfig, Snapshot, TableRef};
pub use keys::{ColKey, ObjKey, TableKey};
pub use schema::{ColumnSpec, LinkStrength, LinkTarget, MemorySchema, Schema};
pub use value::{ColumnType, Value};
