//! Error types for the clusterdb-arena crate

use crate::Ref;
use thiserror::Error;

/// Result type alias using `ArenaError`
pub type Result<T> = std::result::Result<T, ArenaError>;

/// Errors that can occur during arena operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ArenaError {
    /// The ref does not name a live block
    #[error("invalid ref: {0}")]
    InvalidRef(Ref),

    /// The arena cannot hold another block
    #[error("allocation failure: arena is full ({capacity} blocks)")]
    AllocationFailure { capacity: usize },

    /// The block belongs to a frozen snapshot and cannot be written in place
    #[error("block is read-only: {0}")]
    ReadOnly(Ref),

    /// Configuration error
    #[error("configuration error: {0}")]
    Configuration(String),
}
