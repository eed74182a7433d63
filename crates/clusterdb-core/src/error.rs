//! Error types for the clusterdb-core crate

use crate::{ColKey, ObjKey, TableKey};
use thiserror::Error;

/// Result type alias using `ClusterError`
pub type Result<T> = std::result::Result<T, ClusterError>;

/// Errors that can occur in cluster tree operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClusterError {
    /// No object with this key
    #[error("key not found: {0}")]
    KeyNotFound(ObjKey),

    /// An object with this key already exists
    #[error("duplicate key: {0}")]
    DuplicateKey(ObjKey),

    /// Positional lookup beyond the end of the tree
    #[error("index {index} out of range (size {size})")]
    IndexOutOfRange { index: usize, size: usize },

    /// The accessor outlived the table it was created for
    #[error("detached accessor")]
    DetachedAccessor,

    /// The key cannot be stored
    #[error("invalid key: {0}")]
    InvalidKey(ObjKey),

    /// Table not found
    #[error("no such table: {0}")]
    NoSuchTable(TableKey),

    /// Column not found
    #[error("column not found: {0}")]
    ColumnNotFound(ColKey),

    /// Value does not fit the column
    #[error("type mismatch on {column}: expected {expected}, got {actual}")]
    TypeMismatch {
        column: ColKey,
        expected: String,
        actual: String,
    },

    /// Null stored in a non-nullable column
    #[error("null not allowed in {0}")]
    NullNotAllowed(ColKey),

    /// No entry with this key in a dictionary
    #[error("dictionary key not found: {0}")]
    DictionaryKeyNotFound(String),

    /// Value type a dictionary cannot hold
    #[error("dictionary cannot hold {0} values")]
    UnsupportedDictionaryValue(String),

    /// Table is still the target of links from other tables
    #[error("table in use: {0} is the target of links from other tables")]
    TableInUse(TableKey),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Structural corruption detected
    #[error("tree corruption: {0}")]
    Corrupted(String),

    /// Arena error
    #[error("arena error: {0}")]
    Arena(#[from] clusterdb_arena::ArenaError),
}

impl From<serde_json::Error> for ClusterError {
    fn from(err: serde_json::Error) -> Self {
        ClusterError::Configuration(err.to_string())
    }
}
