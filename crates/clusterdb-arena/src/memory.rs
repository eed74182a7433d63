//! In-memory arena

use crate::{Allocator, ArenaError, MemRef, Ref, Result, VersionCounters};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Configuration for arena behavior
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArenaConfig {
    /// Maximum number of live blocks (unbounded if `None`)
    pub max_blocks: Option<usize>,
}

impl ArenaConfig {
    /// Check the configuration for nonsensical values
    pub fn validate(&self) -> Result<()> {
        if self.max_blocks == Some(0) {
            return Err(ArenaError::Configuration(
                "max_blocks must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Arena statistics
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ArenaStats {
    /// Blocks currently stored (live and retired)
    pub blocks: usize,
    /// Blocks frozen by the last `freeze`
    pub read_only: usize,
    /// Read-only blocks released by their owner but kept for snapshot readers
    pub retired: usize,
}

/// An in-memory arena.
///
/// Blocks live in a concurrent map keyed by ref. Refs are never reused, so a
/// stale ref fails with [`ArenaError::InvalidRef`] instead of silently naming
/// someone else's block.
pub struct MemoryArena<T> {
    blocks: DashMap<Ref, Arc<T>>,
    next_ref: AtomicU64,
    /// Refs below this value are read-only
    baseline: AtomicU64,
    retired: Mutex<Vec<Ref>>,
    versions: VersionCounters,
    config: ArenaConfig,
}

impl<T> MemoryArena<T> {
    /// Create a new empty arena
    pub fn new() -> Self {
        Self {
            blocks: DashMap::new(),
            next_ref: AtomicU64::new(1),
            baseline: AtomicU64::new(1),
            retired: Mutex::new(Vec::new()),
            versions: VersionCounters::new(),
            config: ArenaConfig::default(),
        }
    }

    /// Create with custom configuration
    pub fn with_config(config: ArenaConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            ..Self::new()
        })
    }

    /// Get the number of blocks stored
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Check if the arena is empty
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Check if a ref names a stored block
    pub fn contains(&self, r: Ref) -> bool {
        self.blocks.contains_key(&r)
    }

    /// Get arena statistics
    pub fn stats(&self) -> ArenaStats {
        let baseline = self.baseline.load(Ordering::Acquire);
        ArenaStats {
            blocks: self.blocks.len(),
            read_only: self
                .blocks
                .iter()
                .filter(|entry| entry.key().get() < baseline)
                .count(),
            retired: self.retired.lock().len(),
        }
    }
}

impl<T> Default for MemoryArena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + Sync> Allocator<T> for MemoryArena<T> {
    fn allocate(&self, block: T) -> Result<Ref> {
        if let Some(capacity) = self.config.max_blocks {
            if self.blocks.len() >= capacity {
                return Err(ArenaError::AllocationFailure { capacity });
            }
        }
        let r = Ref::new(self.next_ref.fetch_add(1, Ordering::AcqRel));
        self.blocks.insert(r, Arc::new(block));
        trace!(%r, "allocated block");
        Ok(r)
    }

    fn translate(&self, r: Ref) -> Result<MemRef<T>> {
        self.blocks
            .get(&r)
            .map(|entry| MemRef::new(r, Arc::clone(entry.value())))
            .ok_or(ArenaError::InvalidRef(r))
    }

    fn write(&self, r: Ref, block: T) -> Result<()> {
        if self.is_read_only(r) {
            return Err(ArenaError::ReadOnly(r));
        }
        match self.blocks.get_mut(&r) {
            Some(mut entry) => {
                *entry.value_mut() = Arc::new(block);
                Ok(())
            }
            None => Err(ArenaError::InvalidRef(r)),
        }
    }

    fn free(&self, r: Ref) -> Result<()> {
        if !self.blocks.contains_key(&r) {
            return Err(ArenaError::InvalidRef(r));
        }
        if self.is_read_only(r) {
            self.retired.lock().push(r);
            trace!(%r, "retired read-only block");
        } else {
            self.blocks.remove(&r);
            trace!(%r, "freed block");
        }
        Ok(())
    }

    fn is_read_only(&self, r: Ref) -> bool {
        r.get() < self.baseline.load(Ordering::Acquire)
    }

    fn freeze(&self) -> Ref {
        let watermark = self.next_ref.load(Ordering::Acquire);
        self.baseline.store(watermark, Ordering::Release);
        debug!(watermark, "froze arena");
        Ref::new(watermark)
    }

    fn release_retired(&self) -> usize {
        let retired = std::mem::take(&mut *self.retired.lock());
        let count = retired.len();
        for r in retired {
            self.blocks.remove(&r);
        }
        debug!(count, "released retired blocks");
        count
    }

    fn versions(&self) -> &VersionCounters {
        &self.versions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;
    use std::collections::HashMap;

    #[test]
    fn test_memory_arena_basic() {
        let arena: MemoryArena<Vec<u8>> = MemoryArena::new();

        let r = arena.allocate(vec![1u8, 2, 3]).unwrap();
        assert!(arena.contains(r));

        let block = arena.translate(r).unwrap();
        assert_eq!(block.as_slice(), &[1, 2, 3]);
    }

    #[test]
    fn test_memory_arena_invalid_ref() {
        let arena: MemoryArena<u32> = MemoryArena::new();

        let result = arena.translate(Ref::new(42));
        assert!(matches!(result, Err(ArenaError::InvalidRef(_))));
        assert!(matches!(arena.translate(Ref::NULL), Err(ArenaError::InvalidRef(_))));
    }

    #[test]
    fn test_memory_arena_free() {
        let arena: MemoryArena<&str> = MemoryArena::new();

        let r = arena.allocate("delete me").unwrap();
        arena.free(r).unwrap();
        assert!(!arena.contains(r));
        assert!(matches!(arena.free(r), Err(ArenaError::InvalidRef(_))));
    }

    #[test]
    fn test_refs_are_not_reused() {
        let arena: MemoryArena<i32> = MemoryArena::new();

        let first = arena.allocate(1).unwrap();
        arena.free(first).unwrap();
        let second = arena.allocate(2).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_write_replaces_contents_but_not_old_snapshots() {
        let arena: MemoryArena<i32> = MemoryArena::new();

        let r = arena.allocate(10).unwrap();
        let before = arena.translate(r).unwrap();
        arena.write(r, 20).unwrap();

        assert_eq!(*before, 10);
        assert_eq!(*arena.translate(r).unwrap(), 20);
    }

    #[test]
    fn test_freeze_makes_blocks_read_only() {
        let arena: MemoryArena<i32> = MemoryArena::new();

        let old = arena.allocate(1).unwrap();
        arena.freeze();
        let new = arena.allocate(2).unwrap();

        assert!(arena.is_read_only(old));
        assert!(!arena.is_read_only(new));
        assert_eq!(arena.write(old, 5), Err(ArenaError::ReadOnly(old)));
        arena.write(new, 5).unwrap();
    }

    #[test_log::test]
    fn test_free_read_only_block_retires_it() {
        let arena: MemoryArena<i32> = MemoryArena::new();

        let r = arena.allocate(1).unwrap();
        arena.freeze();
        arena.free(r).unwrap();

        // Still readable by snapshot holders until released
        assert_eq!(*arena.translate(r).unwrap(), 1);
        assert_eq!(arena.stats().retired, 1);

        assert_eq!(arena.release_retired(), 1);
        assert!(!arena.contains(r));
    }

    #[rstest]
    #[case(1)]
    #[case(3)]
    #[case(16)]
    fn test_allocation_limit(#[case] capacity: usize) {
        let arena: MemoryArena<usize> = MemoryArena::with_config(ArenaConfig {
            max_blocks: Some(capacity),
        })
        .unwrap();

        for i in 0..capacity {
            arena.allocate(i).unwrap();
        }
        assert_eq!(
            arena.allocate(capacity),
            Err(ArenaError::AllocationFailure { capacity })
        );
    }

    #[test]
    fn test_zero_capacity_is_rejected() {
        let result = MemoryArena::<u8>::with_config(ArenaConfig {
            max_blocks: Some(0),
        });
        assert!(matches!(result, Err(ArenaError::Configuration(_))));
    }

    #[test]
    fn test_versions_are_shared_through_trait() {
        let arena: MemoryArena<u8> = MemoryArena::new();
        arena.bump_storage_version();
        arena.bump_content_version();
        arena.bump_content_version();

        assert_eq!(arena.storage_version(), 1);
        assert_eq!(arena.content_version(), 2);
        assert_eq!(arena.instance_version(), 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn live_blocks_match_model(ops in prop::collection::vec((any::<bool>(), 0usize..32), 0..200)) {
            let arena: MemoryArena<usize> = MemoryArena::new();
            let mut model: HashMap<Ref, usize> = HashMap::new();
            let mut order: Vec<Ref> = Vec::new();

            for (alloc, pick) in ops {
                if alloc || order.is_empty() {
                    let r = arena.allocate(pick).unwrap();
                    prop_assert!(!model.contains_key(&r));
                    model.insert(r, pick);
                    order.push(r);
                } else {
                    let r = order.swap_remove(pick % order.len());
                    model.remove(&r);
                    arena.free(r).unwrap();
                    prop_assert!(!arena.contains(r));
                }
            }

            prop_assert_eq!(arena.len(), model.len());
            for (r, value) in &model {
                prop_assert_eq!(*arena.translate(*r).unwrap(), *value);
            }
        }
    }
}
