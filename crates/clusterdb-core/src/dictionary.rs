//! String-keyed maps stored in a single field
//!
//! A [`Dictionary`] is the value held by a `ColumnType::Dictionary` column:
//! string keys in insertion order, each mapped to a scalar value. A
//! [`DictionaryRef`] binds one such field of one object and keeps a local
//! copy of it, re-read whenever the tree's content version moves on.

use crate::cluster::{ClusterTree, Node};
use crate::{ClusterError, ColKey, ColumnType, Obj, Result, Value};
use clusterdb_arena::Allocator;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// An insertion-ordered map from strings to scalar values
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Dictionary {
    entries: Vec<(String, Value)>,
}

impl Dictionary {
    /// Create an empty dictionary
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the dictionary has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Position of `key` in insertion order
    pub fn find(&self, key: &str) -> Option<usize> {
        self.entries.iter().position(|(k, _)| k == key)
    }

    /// Check if `key` is present
    pub fn contains_key(&self, key: &str) -> bool {
        self.find(key).is_some()
    }

    /// Look up a value
    pub fn get(&self, key: &str) -> Result<&Value> {
        self.find(key)
            .map(|ndx| &self.entries[ndx].1)
            .ok_or_else(|| ClusterError::DictionaryKeyNotFound(key.to_string()))
    }

    /// Entry at position `ndx` in insertion order
    pub fn entry_at(&self, ndx: usize) -> Option<(&str, &Value)> {
        self.entries.get(ndx).map(|(k, v)| (k.as_str(), v))
    }

    /// Insert or overwrite. Returns the entry's position and whether the key
    /// was new. Overwriting keeps the original position.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Result<(usize, bool)> {
        check_entry(&value)?;
        let key = key.into();
        match self.find(&key) {
            Some(ndx) => {
                self.entries[ndx].1 = value;
                Ok((ndx, false))
            }
            None => {
                self.entries.push((key, value));
                Ok((self.entries.len() - 1, true))
            }
        }
    }

    /// Look up a value, adding `key` with a null value if absent
    pub fn get_or_insert(&mut self, key: &str) -> &Value {
        let ndx = match self.find(key) {
            Some(ndx) => ndx,
            None => {
                self.entries.push((key.to_string(), Value::Null));
                self.entries.len() - 1
            }
        };
        &self.entries[ndx].1
    }

    /// Remove an entry and return its value
    pub fn erase(&mut self, key: &str) -> Result<Value> {
        let ndx = self
            .find(key)
            .ok_or_else(|| ClusterError::DictionaryKeyNotFound(key.to_string()))?;
        Ok(self.entries.remove(ndx).1)
    }

    /// Remove every entry
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Entries in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> + '_ {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Keys in insertion order
    pub fn keys(&self) -> impl Iterator<Item = &str> + '_ {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    /// Check every value is one a dictionary may hold
    pub fn validate(&self) -> Result<()> {
        self.entries.iter().try_for_each(|(_, v)| check_entry(v))
    }
}

fn check_entry(value: &Value) -> Result<()> {
    match value {
        Value::Link(_) | Value::LinkList(_) | Value::Dictionary(_) => Err(
            ClusterError::UnsupportedDictionaryValue(value.type_name().to_string()),
        ),
        _ => Ok(()),
    }
}

/// Accessor for the dictionary stored in one field of one object.
///
/// Reads are served from a local copy. Every call compares the tree's
/// content version with the one the copy was taken at and re-reads the field
/// when they differ, so writes made through other handles are picked up.
#[derive(Clone, Debug)]
pub struct DictionaryRef {
    obj: Obj,
    col: ColKey,
    content_version: u64,
    cached: Dictionary,
}

impl DictionaryRef {
    /// Bind the dictionary column `col` of `obj`
    pub fn new<A: Allocator<Node>>(tree: &ClusterTree<A>, obj: Obj, col: ColKey) -> Result<Self> {
        let spec = tree
            .schema()
            .column(tree.table(), col)
            .ok_or(ClusterError::ColumnNotFound(col))?;
        if spec.column_type != ColumnType::Dictionary {
            return Err(ClusterError::TypeMismatch {
                column: col,
                expected: ColumnType::Dictionary.as_str().to_string(),
                actual: spec.column_type.as_str().to_string(),
            });
        }
        let mut dict = Self {
            obj,
            col,
            content_version: tree.content_version(),
            cached: Dictionary::new(),
        };
        dict.reload(tree)?;
        Ok(dict)
    }

    /// The object owning the field
    pub fn obj(&self) -> &Obj {
        &self.obj
    }

    /// The dictionary column
    pub fn col(&self) -> ColKey {
        self.col
    }

    fn reload<A: Allocator<Node>>(&mut self, tree: &ClusterTree<A>) -> Result<()> {
        self.cached = match self.obj.get(tree, self.col)? {
            Value::Dictionary(dict) => dict,
            _ => Dictionary::new(),
        };
        self.content_version = tree.content_version();
        Ok(())
    }

    fn update_if_needed<A: Allocator<Node>>(&mut self, tree: &ClusterTree<A>) -> Result<()> {
        if self.content_version != tree.content_version() {
            trace!(key = %self.obj.key(), col = %self.col, "refreshing dictionary");
            self.reload(tree)?;
        }
        Ok(())
    }

    /// Current contents
    pub fn get_all<A: Allocator<Node>>(&mut self, tree: &ClusterTree<A>) -> Result<&Dictionary> {
        self.update_if_needed(tree)?;
        Ok(&self.cached)
    }

    /// Number of entries
    pub fn size<A: Allocator<Node>>(&mut self, tree: &ClusterTree<A>) -> Result<usize> {
        Ok(self.get_all(tree)?.len())
    }

    /// Look up a value
    pub fn get<A: Allocator<Node>>(&mut self, tree: &ClusterTree<A>, key: &str) -> Result<Value> {
        self.get_all(tree)?.get(key).cloned()
    }

    fn write<A: Allocator<Node>, T>(
        &mut self,
        tree: &mut ClusterTree<A>,
        edit: impl FnOnce(&mut Dictionary) -> Result<T>,
    ) -> Result<T> {
        self.update_if_needed(tree)?;
        let mut next = self.cached.clone();
        let out = edit(&mut next)?;
        self.obj
            .set(tree, self.col, Value::Dictionary(next.clone()))?;
        self.cached = next;
        self.content_version = tree.content_version();
        Ok(out)
    }

    /// Insert or overwrite. Returns true if the key was new.
    pub fn insert<A: Allocator<Node>>(
        &mut self,
        tree: &mut ClusterTree<A>,
        key: &str,
        value: Value,
    ) -> Result<bool> {
        self.write(tree, |dict| Ok(dict.insert(key, value)?.1))
    }

    /// Look up a value, storing a null under `key` if it is absent
    pub fn get_or_insert<A: Allocator<Node>>(
        &mut self,
        tree: &mut ClusterTree<A>,
        key: &str,
    ) -> Result<Value> {
        self.update_if_needed(tree)?;
        if let Ok(value) = self.cached.get(key) {
            return Ok(value.clone());
        }
        self.write(tree, |dict| Ok(dict.get_or_insert(key).clone()))
    }

    /// Remove an entry and return its value
    pub fn erase<A: Allocator<Node>>(&mut self, tree: &mut ClusterTree<A>, key: &str) -> Result<Value> {
        self.write(tree, |dict| dict.erase(key))
    }

    /// Remove every entry
    pub fn clear<A: Allocator<Node>>(&mut self, tree: &mut ClusterTree<A>) -> Result<()> {
        if self.size(tree)? == 0 {
            return Ok(());
        }
        self.write(tree, |dict| {
            dict.clear();
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::tree::tests::fixture;
    use crate::{ObjKey, Schema};

    fn hello_goodbye() -> Dictionary {
        let mut dict = Dictionary::new();
        assert!(dict.insert("Hello", Value::Int(9)).unwrap().1);
        dict.insert("Goodbye", Value::from("cruel world")).unwrap();
        dict
    }

    #[test]
    fn test_insert_overwrites_in_place() {
        let mut dict = Dictionary::new();
        assert_eq!(dict.insert("Hello", Value::Int(9)).unwrap(), (0, true));
        assert_eq!(dict.get("Hello").unwrap(), &Value::Int(9));
        assert_eq!(dict.insert("Hello", Value::Int(10)).unwrap(), (0, false));
        assert_eq!(dict.get("Hello").unwrap(), &Value::Int(10));
        assert_eq!(
            dict.insert("Goodbye", Value::from("cruel world")).unwrap(),
            (1, true)
        );
        assert_eq!(dict.get("Goodbye").unwrap().as_str(), Some("cruel world"));
        assert_eq!(dict.len(), 2);
    }

    #[test]
    fn test_missing_keys() {
        let mut dict = hello_goodbye();
        assert_eq!(
            dict.get("Baa"),
            Err(ClusterError::DictionaryKeyNotFound("Baa".to_string()))
        );
        assert!(dict.get("Foo").is_err());
        assert!(dict.erase("Foo").is_err());
        assert_eq!(dict.len(), 2);
    }

    #[test]
    fn test_iterates_in_insertion_order() {
        let dict = hello_goodbye();
        let mut it = dict.iter();
        assert_eq!(it.next(), Some(("Hello", &Value::Int(9))));
        assert_eq!(it.next().map(|(k, _)| k), Some("Goodbye"));
        assert_eq!(it.next(), None);
        assert_eq!(dict.entry_at(1).map(|(k, _)| k), Some("Goodbye"));
        assert_eq!(dict.keys().collect::<Vec<_>>(), vec!["Hello", "Goodbye"]);
    }

    #[test]
    fn test_copies_are_independent() {
        let mut dict = hello_goodbye();
        let mut other = dict.clone();
        assert_eq!(other, dict);

        dict.clear();
        assert_eq!(dict.len(), 0);
        assert!(dict.get("Goodbye").is_err());

        assert_eq!(other.len(), 2);
        assert_eq!(other.get("Goodbye").unwrap().as_str(), Some("cruel world"));
        other.insert("Goodbye", Value::Double(100.0)).unwrap();
        assert_eq!(other.get("Goodbye").unwrap(), &Value::Double(100.0));
        assert_eq!(other.erase("Goodbye").unwrap(), Value::Double(100.0));
        assert_eq!(other.len(), 1);
        assert_ne!(other, dict);
    }

    #[test]
    fn test_get_or_insert_adds_null() {
        let mut dict = hello_goodbye();
        assert_eq!(dict.get_or_insert("Hello"), &Value::Int(9));
        assert_eq!(dict.get_or_insert("Later"), &Value::Null);
        assert_eq!(dict.len(), 3);
    }

    #[test]
    fn test_rejects_links_and_nesting() {
        let mut dict = Dictionary::new();
        assert!(matches!(
            dict.insert("owner", Value::Link(ObjKey::new(1))),
            Err(ClusterError::UnsupportedDictionaryValue(_))
        ));
        assert!(dict
            .insert("inner", Value::Dictionary(Dictionary::new()))
            .is_err());
        assert!(dict.is_empty());
    }

    #[test]
    fn test_equality_is_order_sensitive() {
        let mut a = Dictionary::new();
        a.insert("x", Value::Int(1)).unwrap();
        a.insert("y", Value::Int(2)).unwrap();
        let mut b = Dictionary::new();
        b.insert("y", Value::Int(2)).unwrap();
        b.insert("x", Value::Int(1)).unwrap();
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn test_serde() {
        let dict = hello_goodbye();
        let json = serde_json::to_string(&Value::Dictionary(dict.clone())).unwrap();
        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Value::Dictionary(dict));
    }

    #[test]
    fn test_accessor_writes_through_to_the_tree() {
        let mut f = fixture(4);
        let col = f
            .schema
            .add_column(f.tree.table(), "attrs", ColumnType::Dictionary, true)
            .unwrap();
        let obj = f.tree.insert(ObjKey::new(1), &[]).unwrap();

        let mut dict = DictionaryRef::new(&f.tree, obj.clone(), col).unwrap();
        assert_eq!(dict.size(&f.tree).unwrap(), 0);
        assert!(dict.insert(&mut f.tree, "Hello", Value::Int(9)).unwrap());
        assert_eq!(
            dict.get_or_insert(&mut f.tree, "Goodbye").unwrap(),
            Value::Null
        );
        dict.insert(&mut f.tree, "Goodbye", Value::from("cruel world"))
            .unwrap();

        let mut fresh = DictionaryRef::new(&f.tree, obj, col).unwrap();
        assert_eq!(fresh.get(&f.tree, "Hello").unwrap(), Value::Int(9));
        assert_eq!(
            fresh.get(&f.tree, "Goodbye").unwrap(),
            Value::from("cruel world")
        );
        assert_eq!(
            f.tree.get_value(ObjKey::new(1), col).unwrap(),
            Value::Dictionary(dict.get_all(&f.tree).unwrap().clone())
        );
    }

    #[test]
    fn test_accessor_refreshes_after_other_writes() {
        let mut f = fixture(4);
        let col = f
            .schema
            .add_column(f.tree.table(), "attrs", ColumnType::Dictionary, false)
            .unwrap();
        let obj = f.tree.insert(ObjKey::new(1), &[]).unwrap();

        let mut reader = DictionaryRef::new(&f.tree, obj.clone(), col).unwrap();
        let mut writer = DictionaryRef::new(&f.tree, obj, col).unwrap();
        writer.insert(&mut f.tree, "Hello", Value::Int(9)).unwrap();
        assert_eq!(reader.get(&f.tree, "Hello").unwrap(), Value::Int(9));

        writer
            .insert(&mut f.tree, "Good morning", Value::from("sunshine"))
            .unwrap();
        assert_eq!(reader.size(&f.tree).unwrap(), 2);
        assert_eq!(reader.erase(&mut f.tree, "Hello").unwrap(), Value::Int(9));
        assert_eq!(writer.size(&f.tree).unwrap(), 1);

        writer.clear(&mut f.tree).unwrap();
        assert_eq!(reader.size(&f.tree).unwrap(), 0);
    }

    #[test]
    fn test_accessor_errors() {
        let mut f = fixture(4);
        let obj = f.tree.insert(ObjKey::new(1), &[]).unwrap();

        assert!(matches!(
            DictionaryRef::new(&f.tree, obj.clone(), f.num),
            Err(ClusterError::TypeMismatch { .. })
        ));

        let col = f
            .schema
            .add_column(f.tree.table(), "attrs", ColumnType::Dictionary, false)
            .unwrap();
        let mut dict = DictionaryRef::new(&f.tree, obj, col).unwrap();
        assert!(dict.get(&f.tree, "missing").is_err());

        let mut state = crate::CascadeState::default();
        f.tree.erase(ObjKey::new(1), &mut state).unwrap();
        assert_eq!(
            dict.size(&f.tree),
            Err(ClusterError::KeyNotFound(ObjKey::new(1)))
        );
        assert!(f.schema.column(f.tree.table(), col).is_some());
    }
}
