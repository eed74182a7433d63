//! Key-ordered iteration
//!
//! A [`Cursor`] is detached state: the key it stands on plus a cached leaf
//! position. Each call takes the tree, compares versions and re-seeks when
//! the tree changed underneath. A cursor whose object was erased moves on to
//! the next larger key; one that runs off the end holds `ObjKey::NULL`.

use super::node::{leaf_of, LeafPosition};
use super::{ClusterTree, Node};
use crate::cascade::CascadeState;
use crate::{ClusterError, ColKey, Obj, ObjKey, Result, TableKey, Value};
use clusterdb_arena::Allocator;

/// Iteration state over one tree
#[derive(Clone, Debug)]
pub struct Cursor {
    table: TableKey,
    instance_version: u64,
    key: ObjKey,
    pos: Option<LeafPosition>,
}

impl Cursor {
    /// A cursor that seeks to the first key not less than `start` on first use
    fn unpositioned<A: Allocator<Node>>(tree: &ClusterTree<A>, start: ObjKey) -> Self {
        Self {
            table: tree.table(),
            instance_version: tree.instance_version(),
            key: if start.is_valid() { start } else { ObjKey::new(0) },
            pos: None,
        }
    }

    /// Position at the first key not less than `start`
    pub fn new<A: Allocator<Node>>(tree: &ClusterTree<A>, start: ObjKey) -> Result<Self> {
        let mut cursor = Self::unpositioned(tree, start);
        cursor.revalidate(tree)?;
        Ok(cursor)
    }

    /// Position at tree position `index`. `index == size` is the end.
    pub fn at_index<A: Allocator<Node>>(tree: &ClusterTree<A>, index: usize) -> Result<Self> {
        let mut cursor = Self::unpositioned(tree, ObjKey::new(0));
        if index == tree.size() {
            cursor.key = ObjKey::NULL;
            return Ok(cursor);
        }
        let pos = tree.position(index)?;
        cursor.key = pos.key()?;
        cursor.pos = Some(pos);
        Ok(cursor)
    }

    /// Key the cursor stands on, `ObjKey::NULL` at the end
    pub fn key(&self) -> ObjKey {
        self.key
    }

    /// Check if the cursor has run off the end
    pub fn is_end(&self) -> bool {
        self.key.is_null()
    }

    /// Bring the cached position up to date with the tree
    pub fn revalidate<A: Allocator<Node>>(&mut self, tree: &ClusterTree<A>) -> Result<()> {
        if tree.table() != self.table || tree.instance_version() != self.instance_version {
            return Err(ClusterError::DetachedAccessor);
        }
        if self.is_end() {
            return Ok(());
        }
        if let Some(pos) = &self.pos {
            if pos.storage_version == tree.storage_version()
                && pos.content_version == tree.content_version()
            {
                return Ok(());
            }
        }
        self.seek(tree, self.key)
    }

    fn seek<A: Allocator<Node>>(&mut self, tree: &ClusterTree<A>, key: ObjKey) -> Result<()> {
        match tree.lower_bound(key)? {
            Some(pos) => {
                self.key = pos.key()?;
                self.pos = Some(pos);
            }
            None => {
                self.key = ObjKey::NULL;
                self.pos = None;
            }
        }
        Ok(())
    }

    /// Handle to the current object
    pub fn obj<A: Allocator<Node>>(&mut self, tree: &ClusterTree<A>) -> Result<Obj> {
        self.revalidate(tree)?;
        let pos = self
            .pos
            .clone()
            .ok_or(ClusterError::KeyNotFound(ObjKey::NULL))?;
        Ok(Obj::attached(tree, self.key, pos))
    }

    /// Read one field of the current object
    pub fn get<A: Allocator<Node>>(&mut self, tree: &ClusterTree<A>, col: ColKey) -> Result<Value> {
        self.revalidate(tree)?;
        let pos = self
            .pos
            .as_ref()
            .ok_or(ClusterError::KeyNotFound(ObjKey::NULL))?;
        tree.read_field(pos, col)
    }

    /// Step to the next key. Stepping at the end stays at the end.
    pub fn advance<A: Allocator<Node>>(&mut self, tree: &ClusterTree<A>) -> Result<()> {
        self.revalidate(tree)?;
        let Some(pos) = self.pos.as_mut() else {
            return Ok(());
        };
        let leaf = leaf_of(&pos.leaf)?;
        if pos.ndx + 1 < leaf.len() {
            pos.ndx += 1;
            self.key = leaf.key(pos.ndx);
            return Ok(());
        }
        match self.key.value().checked_add(1) {
            Some(next) => self.seek(tree, ObjKey::new(next)),
            None => {
                self.key = ObjKey::NULL;
                self.pos = None;
                Ok(())
            }
        }
    }

    /// Step `n` keys ahead, landing on the end if fewer remain
    pub fn advance_by<A: Allocator<Node>>(&mut self, tree: &ClusterTree<A>, n: usize) -> Result<()> {
        self.revalidate(tree)?;
        let Some(pos) = self.pos.as_mut() else {
            return Ok(());
        };
        let leaf = leaf_of(&pos.leaf)?;
        if let Some(ndx) = pos.ndx.checked_add(n).filter(|ndx| *ndx < leaf.len()) {
            pos.ndx = ndx;
            self.key = leaf.key(ndx);
            return Ok(());
        }
        let Some(target) = pos.index().checked_add(n).filter(|t| *t < tree.size()) else {
            self.key = ObjKey::NULL;
            self.pos = None;
            return Ok(());
        };
        let pos = tree.position(target)?;
        self.key = pos.key()?;
        self.pos = Some(pos);
        Ok(())
    }
}

impl PartialEq for Cursor {
    fn eq(&self, other: &Self) -> bool {
        self.table == other.table && self.key == other.key
    }
}

/// Iterator over the objects of a tree in key order
pub struct Iter<'a, A: Allocator<Node>> {
    tree: &'a ClusterTree<A>,
    cursor: Cursor,
    done: bool,
}

impl<'a, A: Allocator<Node>> Iter<'a, A> {
    fn step(&mut self) -> Result<Option<Obj>> {
        self.cursor.revalidate(self.tree)?;
        if self.cursor.is_end() {
            return Ok(None);
        }
        let obj = self.cursor.obj(self.tree)?;
        self.cursor.advance(self.tree)?;
        Ok(Some(obj))
    }
}

impl<'a, A: Allocator<Node>> Iterator for Iter<'a, A> {
    type Item = Result<Obj>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.step() {
            Ok(Some(obj)) => Some(Ok(obj)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

impl<'a, A: Allocator<Node>> IntoIterator for &'a ClusterTree<A> {
    type Item = Result<Obj>;
    type IntoIter = Iter<'a, A>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Cursor holding the tree mutably, for edits during iteration
pub struct CursorMut<'a, A: Allocator<Node>> {
    tree: &'a mut ClusterTree<A>,
    cursor: Cursor,
}

impl<'a, A: Allocator<Node>> CursorMut<'a, A> {
    /// Get the tree
    pub fn tree(&self) -> &ClusterTree<A> {
        &*self.tree
    }

    /// Key the cursor stands on, `ObjKey::NULL` at the end
    pub fn key(&mut self) -> Result<ObjKey> {
        self.cursor.revalidate(self.tree)?;
        Ok(self.cursor.key())
    }

    /// Check if the cursor has run off the end
    pub fn is_end(&mut self) -> Result<bool> {
        Ok(self.key()?.is_null())
    }

    /// Handle to the current object
    pub fn obj(&mut self) -> Result<Obj> {
        self.cursor.obj(self.tree)
    }

    /// Read one field of the current object
    pub fn get(&mut self, col: ColKey) -> Result<Value> {
        self.cursor.get(self.tree, col)
    }

    /// Overwrite one field of the current object
    pub fn set(&mut self, col: ColKey, value: Value) -> Result<()> {
        let key = self.key()?;
        if key.is_null() {
            return Err(ClusterError::KeyNotFound(key));
        }
        self.tree.set_value(key, col, value)
    }

    /// Erase the current object. The cursor moves on to the next key.
    pub fn remove(&mut self, state: &mut CascadeState) -> Result<()> {
        let key = self.key()?;
        if key.is_null() {
            return Err(ClusterError::KeyNotFound(key));
        }
        self.tree.erase(key, state)?;
        self.cursor.revalidate(self.tree)
    }

    /// Step to the next key
    pub fn advance(&mut self) -> Result<()> {
        self.cursor.advance(self.tree)
    }

    /// Step `n` keys ahead
    pub fn advance_by(&mut self, n: usize) -> Result<()> {
        self.cursor.advance_by(self.tree, n)
    }
}

impl<A: Allocator<Node>> ClusterTree<A> {
    /// Iterate over every object in key order
    pub fn iter(&self) -> Iter<'_, A> {
        self.iter_from(ObjKey::new(0))
    }

    /// Iterate over the objects whose key is not less than `start`
    pub fn iter_from(&self, start: ObjKey) -> Iter<'_, A> {
        Iter {
            tree: self,
            cursor: Cursor::unpositioned(self, start),
            done: false,
        }
    }

    /// Cursor at the first key not less than `start`
    pub fn cursor_at(&self, start: ObjKey) -> Result<Cursor> {
        Cursor::new(self, start)
    }

    /// Cursor at tree position `index`
    pub fn cursor_at_index(&self, index: usize) -> Result<Cursor> {
        Cursor::at_index(self, index)
    }

    /// Mutable cursor at the first key not less than `start`
    pub fn cursor_mut(&mut self, start: ObjKey) -> Result<CursorMut<'_, A>> {
        let cursor = Cursor::new(self, start)?;
        Ok(CursorMut { tree: self, cursor })
    }

    /// All keys in order
    pub fn keys(&self) -> Result<Vec<ObjKey>> {
        let mut keys = Vec::with_capacity(self.size());
        self.traverse(|leaf| {
            keys.extend(leaf.keys());
            false
        })?;
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cascade::CascadeMode;
    use crate::cluster::tree::tests::{fill, fixture};
    use rstest::rstest;

    fn collect<A: Allocator<Node>>(iter: Iter<'_, A>) -> Vec<i64> {
        iter.map(|obj| obj.unwrap().key().value()).collect()
    }

    #[test]
    fn test_iterates_in_key_order() {
        let mut f = fixture(4);
        fill(&mut f, [9, 3, 15, 1, 12, 6, 0]);

        assert_eq!(collect(f.tree.iter()), vec![0, 1, 3, 6, 9, 12, 15]);
        assert_eq!(collect(f.tree.iter_from(ObjKey::new(4))), vec![6, 9, 12, 15]);
        assert!(collect(f.tree.iter_from(ObjKey::new(16))).is_empty());

        let mut sum = 0;
        for obj in &f.tree {
            sum += obj.unwrap().get(&f.tree, f.num).unwrap().as_int().unwrap();
        }
        assert_eq!(sum, 460);
    }

    #[test]
    fn test_empty_tree_iterates_nothing() {
        let f = fixture(4);
        assert_eq!(f.tree.iter().count(), 0);
        assert!(f.tree.cursor_at(ObjKey::new(0)).unwrap().is_end());
    }

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(3)]
    #[case(7)]
    #[case(25)]
    fn test_advance_by_matches_single_steps(#[case] n: usize) {
        let mut f = fixture(4);
        fill(&mut f, (0..20).map(|k| k * 2));

        let mut jumped = f.tree.cursor_at(ObjKey::new(5)).unwrap();
        let mut stepped = jumped.clone();
        jumped.advance_by(&f.tree, n).unwrap();
        for _ in 0..n {
            stepped.advance(&f.tree).unwrap();
        }
        assert_eq!(jumped, stepped);
        assert_eq!(jumped.is_end(), n >= 17);
    }

    #[rstest]
    #[case(ObjKey::new(0))]
    #[case(ObjKey::new(1))]
    #[case(ObjKey::new(5))]
    fn test_advance_by_huge_step_reaches_end(#[case] start: ObjKey) {
        let mut f = fixture(4);
        fill(&mut f, (0..20).map(|k| k * 2));

        let mut cursor = f.tree.cursor_at(start).unwrap();
        cursor.advance(&f.tree).unwrap();
        cursor.advance_by(&f.tree, usize::MAX).unwrap();
        assert!(cursor.is_end());
    }

    #[test]
    fn test_iterates_past_largest_key() {
        let mut f = fixture(4);
        for k in [0, i64::MAX - 1, i64::MAX] {
            f.tree
                .insert_fast(ObjKey::new(k), &[(f.num, Value::Int(1))])
                .unwrap();
        }

        assert_eq!(collect(f.tree.iter()), vec![0, i64::MAX - 1, i64::MAX]);

        let mut cursor = f.tree.cursor_at(ObjKey::new(i64::MAX)).unwrap();
        assert_eq!(cursor.key(), ObjKey::new(i64::MAX));
        cursor.advance(&f.tree).unwrap();
        assert!(cursor.is_end());
    }

    #[test]
    fn test_cursor_end() {
        let mut f = fixture(4);
        fill(&mut f, 1..=5);

        let mut cursor = f.tree.cursor_at(ObjKey::new(6)).unwrap();
        assert!(cursor.is_end());
        assert_eq!(cursor.key(), ObjKey::NULL);
        assert_eq!(
            cursor.obj(&f.tree),
            Err(ClusterError::KeyNotFound(ObjKey::NULL))
        );
        cursor.advance(&f.tree).unwrap();
        assert!(cursor.is_end());

        assert!(f.tree.cursor_at_index(5).unwrap().is_end());
        assert!(matches!(
            f.tree.cursor_at_index(6),
            Err(ClusterError::IndexOutOfRange { index: 6, size: 5 })
        ));
        assert_eq!(f.tree.cursor_at_index(2).unwrap().key(), ObjKey::new(3));
    }

    #[test]
    fn test_cursor_on_erased_key_moves_to_next() {
        let mut f = fixture(4);
        fill(&mut f, 1..=10);
        let mut cursor = f.tree.cursor_at(ObjKey::new(4)).unwrap();

        let mut state = CascadeState::new(CascadeMode::Strong);
        f.tree.erase(ObjKey::new(4), &mut state).unwrap();
        f.tree.erase(ObjKey::new(5), &mut state).unwrap();

        cursor.revalidate(&f.tree).unwrap();
        assert_eq!(cursor.key(), ObjKey::new(6));
        assert_eq!(cursor.get(&f.tree, f.num).unwrap(), Value::Int(60));
    }

    #[test]
    fn test_cursor_follows_inserts_and_updates() {
        let mut f = fixture(4);
        fill(&mut f, [10, 20, 30]);
        let mut cursor = f.tree.cursor_at(ObjKey::new(10)).unwrap();

        fill(&mut f, 11..=18);
        cursor.advance(&f.tree).unwrap();
        assert_eq!(cursor.key(), ObjKey::new(11));

        f.tree
            .set_value(ObjKey::new(11), f.num, Value::Int(-11))
            .unwrap();
        assert_eq!(cursor.get(&f.tree, f.num).unwrap(), Value::Int(-11));
    }

    #[test]
    fn test_cursor_detached_from_recreated_tree() {
        let mut f = fixture(4);
        fill(&mut f, 1..=3);
        let mut cursor = f.tree.cursor_at(ObjKey::new(1)).unwrap();

        let reopened = ClusterTree::attach(
            f.tree.table(),
            std::sync::Arc::clone(&f.arena),
            std::sync::Arc::clone(&f.schema) as std::sync::Arc<dyn crate::Schema>,
            f.tree.config().clone(),
            f.tree.root_ref(),
        )
        .unwrap();
        assert_eq!(
            cursor.revalidate(&reopened),
            Err(ClusterError::DetachedAccessor)
        );
    }

    #[test]
    fn test_cursor_mut_edits_while_iterating() {
        let mut f = fixture(4);
        fill(&mut f, 0..40);
        let num = f.num;
        let mut state = CascadeState::new(CascadeMode::Strong);

        let mut cursor = f.tree.cursor_mut(ObjKey::new(0)).unwrap();
        while !cursor.is_end().unwrap() {
            let key = cursor.key().unwrap();
            if key.value() % 2 == 0 {
                cursor.remove(&mut state).unwrap();
            } else {
                cursor.set(num, Value::Int(-key.value())).unwrap();
                cursor.advance().unwrap();
            }
        }
        assert_eq!(
            cursor.set(num, Value::Int(0)),
            Err(ClusterError::KeyNotFound(ObjKey::NULL))
        );

        f.tree.verify().unwrap();
        assert_eq!(f.tree.size(), 20);
        assert_eq!(state.erased_count(), 20);
        for obj in f.tree.iter() {
            let obj = obj.unwrap();
            assert_eq!(obj.key().value() % 2, 1);
            assert_eq!(
                obj.get(&f.tree, num).unwrap(),
                Value::Int(-obj.key().value())
            );
        }
    }

    #[test]
    fn test_keys() {
        let mut f = fixture(4);
        fill(&mut f, [5, 2, 8]);
        assert_eq!(
            f.tree.keys().unwrap(),
            vec![ObjKey::new(2), ObjKey::new(5), ObjKey::new(8)]
        );
    }
}
