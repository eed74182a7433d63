//! Cluster tree: the per-table object store
//!
//! A B+-tree keyed by [`ObjKey`](crate::ObjKey):
//! - Leaves ([`Cluster`]) hold a run of keys plus one field array per column
//! - Inner nodes route by key range and count objects for positional access
//! - Nodes live in an arena and are copied on write once frozen
//! - Handles and cursors survive mutation by checking arena versions

mod inner;
mod iter;
mod leaf;
mod mutation;
mod node;
mod obj;
pub(crate) mod tree;

pub use inner::{ChildEntry, ClusterNodeInner};
pub use iter::{Cursor, CursorMut, Iter};
pub use leaf::{Cluster, FieldArray};
pub use node::Node;
pub use obj::Obj;
pub use tree::{ClusterTree, TreeConfig};

/// Default maximum objects per leaf
pub const DEFAULT_LEAF_CAPACITY: usize = 256;

/// Default maximum children per inner node
pub const DEFAULT_INNER_CAPACITY: usize = 256;

/// Smallest capacity a node may be configured with
pub const MIN_CAPACITY: usize = 4;
