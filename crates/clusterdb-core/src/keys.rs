//! Identifiers for objects, tables and columns

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one object within a table.
///
/// Keys order the tree. `ObjKey::NULL` stands for an absent or tombstoned
/// reference and doubles as the end marker of iteration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjKey(i64);

impl ObjKey {
    /// The null key
    pub const NULL: ObjKey = ObjKey(-1);

    /// Create a key from its raw value
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    /// Get the raw value
    pub const fn value(self) -> i64 {
        self.0
    }

    /// Check if this is the null key
    pub const fn is_null(self) -> bool {
        self.0 == Self::NULL.0
    }

    /// Check if this key may be stored in a tree
    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }
}

impl Default for ObjKey {
    fn default() -> Self {
        Self::NULL
    }
}

impl From<i64> for ObjKey {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl fmt::Display for ObjKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "ObjKey(null)")
        } else {
            write!(f, "ObjKey({})", self.0)
        }
    }
}

/// Identifies a table within a group
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableKey(u32);

impl TableKey {
    /// Create a key from its raw value
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// Get the raw value
    pub const fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Display for TableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TableKey({})", self.0)
    }
}

/// Identifies a column. Unique across every table of a group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ColKey(u64);

impl ColKey {
    /// Create a key from its raw value
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the raw value
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ColKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ColKey({})", self.0)
    }
}
