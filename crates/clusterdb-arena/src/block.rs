//! Block references and translated blocks

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

/// A persistent reference to a block in an arena.
///
/// Refs survive relocation; the memory behind them does not. Callers
/// translate a ref at the start of every operation instead of holding on to
/// what a previous translation returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Ref(u64);

impl Ref {
    /// The null ref. Never names a block.
    pub const NULL: Ref = Ref(0);

    /// Create a ref from its raw value
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw value
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Check if this is the null ref
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ref#{}", self.0)
    }
}

impl From<Ref> for u64 {
    fn from(r: Ref) -> Self {
        r.0
    }
}

/// A translated block: the ref together with a snapshot of its contents.
///
/// The snapshot stays readable after the arena rewrites or frees the block,
/// it just stops being current. Version counters tell the holder when to
/// stop believing it.
#[derive(Debug)]
pub struct MemRef<T> {
    /// The ref this block was translated from
    pub r: Ref,
    /// The block contents at translation time
    pub block: Arc<T>,
}

impl<T> MemRef<T> {
    /// Create a new translated block
    pub fn new(r: Ref, block: Arc<T>) -> Self {
        Self { r, block }
    }

    /// Get the ref
    pub fn get_ref(&self) -> Ref {
        self.r
    }

    /// Take an owned, mutable copy of the contents
    pub fn to_owned_block(&self) -> T
    where
        T: Clone,
    {
        T::clone(&self.block)
    }
}

impl<T> Clone for MemRef<T> {
    fn clone(&self) -> Self {
        Self {
            r: self.r,
            block: Arc::clone(&self.block),
        }
    }
}

impl<T> Deref for MemRef<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.block
    }
}
