//! Version counters shared by every tree living in one arena

use std::sync::atomic::{AtomicU64, Ordering};

/// The three monotonically increasing counters accessors use to detect
/// staleness without taking a lock.
///
/// - content: bumped on any value change
/// - storage: bumped on any change of shape or of which ref holds what
/// - instance: bumped whenever a table is (re)materialized
#[derive(Debug, Default)]
pub struct VersionCounters {
    content: AtomicU64,
    storage: AtomicU64,
    instance: AtomicU64,
}

impl VersionCounters {
    /// Create counters starting at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Current content version
    pub fn content(&self) -> u64 {
        self.content.load(Ordering::Acquire)
    }

    /// Current storage version
    pub fn storage(&self) -> u64 {
        self.storage.load(Ordering::Acquire)
    }

    /// Current instance version
    pub fn instance(&self) -> u64 {
        self.instance.load(Ordering::Acquire)
    }

    /// Bump the content version and return the new value
    pub fn bump_content(&self) -> u64 {
        self.content.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Bump the storage version and return the new value
    pub fn bump_storage(&self) -> u64 {
        self.storage.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Bump the instance version and return the new value
    pub fn bump_instance(&self) -> u64 {
        self.instance.fetch_add(1, Ordering::AcqRel) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_independent() {
        let v = VersionCounters::new();
        assert_eq!(v.bump_content(), 1);
        assert_eq!(v.bump_content(), 2);
        assert_eq!(v.bump_storage(), 1);

        assert_eq!(v.content(), 2);
        assert_eq!(v.storage(), 1);
        assert_eq!(v.instance(), 0);
    }
}
