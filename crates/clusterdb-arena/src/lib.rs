//! # Clusterdb Arena
//!
//! Block arena backing every node of every cluster tree in a database.
//!
//! This crate provides:
//! - **Refs**: persistent block identifiers that survive relocation
//! - **Translation**: turning a ref into a snapshot of the block for one call
//! - **Copy-on-write snapshots**: freezing makes existing blocks read-only
//! - **Version counters**: content, storage and instance versions
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │     Cluster trees (one per table)       │
//! ├─────────────────────────────────────────┤
//! │           Allocator Trait               │
//! ├─────────────────────────────────────────┤
//! │             MemoryArena                 │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust
//! use clusterdb_arena::{Allocator, MemoryArena};
//!
//! let arena: MemoryArena<String> = MemoryArena::new();
//! let r = arena.allocate("hello".to_string()).unwrap();
//! assert_eq!(arena.translate(r).unwrap().as_str(), "hello");
//! ```

pub mod block;
pub mod error;
pub mod memory;
pub mod version;

pub use block::{MemRef, Ref};
pub use error::{ArenaError, Result};
pub use memory::{ArenaConfig, ArenaStats, MemoryArena};
pub use version::VersionCounters;

/// Trait for arena backends.
///
/// Every block is addressed by a [`Ref`]. `translate` hands out a snapshot of
/// the block; the snapshot is only current until the next `write` or `free`
/// of the same ref. Blocks made read-only by [`Allocator::freeze`] must never
/// be written in place; writers copy them to a fresh ref instead.
pub trait Allocator<T>: Send + Sync {
    /// Store a new block and return its ref
    fn allocate(&self, block: T) -> Result<Ref>;

    /// Translate a ref into the block it currently names
    fn translate(&self, r: Ref) -> Result<MemRef<T>>;

    /// Replace the contents of a writable block
    fn write(&self, r: Ref, block: T) -> Result<()>;

    /// Release a block. Read-only blocks are retired instead of dropped.
    fn free(&self, r: Ref) -> Result<()>;

    /// Check if a block belongs to a frozen snapshot
    fn is_read_only(&self, r: Ref) -> bool;

    /// Make every block allocated so far read-only
    fn freeze(&self) -> Ref;

    /// Drop every retired block and return how many went.
    ///
    /// Only safe once no reader is attached to a snapshot taken before the
    /// blocks were retired.
    fn release_retired(&self) -> usize;

    /// Version counters for this arena
    fn versions(&self) -> &VersionCounters;

    /// Current content version
    fn content_version(&self) -> u64 {
        self.versions().content()
    }

    /// Current storage version
    fn storage_version(&self) -> u64 {
        self.versions().storage()
    }

    /// Current instance version
    fn instance_version(&self) -> u64 {
        self.versions().instance()
    }

    /// Bump the content version
    fn bump_content_version(&self) -> u64 {
        self.versions().bump_content()
    }

    /// Bump the storage version
    fn bump_storage_version(&self) -> u64 {
        self.versions().bump_storage()
    }

    /// Bump the instance version
    fn bump_instance_version(&self) -> u64 {
        self.versions().bump_instance()
    }
}
