//! Leaf nodes: keys plus dense per-column field arrays

use crate::{ClusterError, ColKey, ObjKey, Result, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Physical storage of one column within one leaf
#[derive(Clone, Debug, PartialEq)]
pub enum FieldArray {
    /// One value per row
    Plain(Vec<Value>),
    /// Interned strings: a dictionary shared between leaves plus one index
    /// per row (`None` for null)
    Enumerated {
        dictionary: Arc<Vec<String>>,
        indices: Vec<Option<u32>>,
    },
}

impl FieldArray {
    /// Number of rows
    pub fn len(&self) -> usize {
        match self {
            FieldArray::Plain(values) => values.len(),
            FieldArray::Enumerated { indices, .. } => indices.len(),
        }
    }

    /// Check if the array is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check if the array is interned
    pub fn is_enumerated(&self) -> bool {
        matches!(self, FieldArray::Enumerated { .. })
    }

    /// Read one row
    pub fn get(&self, ndx: usize) -> Value {
        match self {
            FieldArray::Plain(values) => values[ndx].clone(),
            FieldArray::Enumerated {
                dictionary,
                indices,
            } => match indices[ndx] {
                Some(i) => Value::String(dictionary[i as usize].clone()),
                None => Value::Null,
            },
        }
    }

    fn set(&mut self, ndx: usize, value: Value) {
        if let Some(index) = self.intern(&value) {
            if let FieldArray::Enumerated { indices, .. } = self {
                indices[ndx] = index;
                return;
            }
        }
        self.materialize()[ndx] = value;
    }

    fn insert(&mut self, ndx: usize, value: Value) {
        if let Some(index) = self.intern(&value) {
            if let FieldArray::Enumerated { indices, .. } = self {
                indices.insert(ndx, index);
                return;
            }
        }
        self.materialize().insert(ndx, value);
    }

    fn remove(&mut self, ndx: usize) -> Value {
        let value = self.get(ndx);
        match self {
            FieldArray::Plain(values) => {
                values.remove(ndx);
            }
            FieldArray::Enumerated { indices, .. } => {
                indices.remove(ndx);
            }
        }
        value
    }

    fn split_off(&mut self, at: usize) -> FieldArray {
        match self {
            FieldArray::Plain(values) => FieldArray::Plain(values.split_off(at)),
            FieldArray::Enumerated {
                dictionary,
                indices,
            } => FieldArray::Enumerated {
                dictionary: Arc::clone(dictionary),
                indices: indices.split_off(at),
            },
        }
    }

    fn append(&mut self, other: FieldArray) {
        if let (
            FieldArray::Enumerated {
                dictionary,
                indices,
            },
            FieldArray::Enumerated {
                dictionary: other_dictionary,
                indices: other_indices,
            },
        ) = (&mut *self, &other)
        {
            if Arc::ptr_eq(dictionary, other_dictionary) {
                indices.extend_from_slice(other_indices);
                return;
            }
        }
        let tail = match other {
            FieldArray::Plain(values) => values,
            enumerated => (0..enumerated.len()).map(|i| enumerated.get(i)).collect(),
        };
        self.materialize().extend(tail);
    }

    /// Dictionary slot for a value, if this array is interned and the value
    /// can be expressed in it. `Some(None)` is null.
    fn intern(&self, value: &Value) -> Option<Option<u32>> {
        let FieldArray::Enumerated { dictionary, .. } = self else {
            return None;
        };
        match value {
            Value::Null => Some(None),
            Value::String(s) => dictionary
                .binary_search(s)
                .ok()
                .map(|i| Some(i as u32)),
            _ => None,
        }
    }

    /// Turn an interned array back into plain values
    fn materialize(&mut self) -> &mut Vec<Value> {
        if self.is_enumerated() {
            let values: Vec<Value> = (0..self.len()).map(|i| self.get(i)).collect();
            *self = FieldArray::Plain(values);
        }
        match self {
            FieldArray::Plain(values) => values,
            FieldArray::Enumerated { .. } => unreachable!("materialized above"),
        }
    }

    /// Intern every row against a sorted dictionary. Leaves the array
    /// untouched if some row is not in the dictionary.
    fn enumerate(&mut self, dictionary: &Arc<Vec<String>>) -> bool {
        let FieldArray::Plain(values) = self else {
            return false;
        };
        let mut indices = Vec::with_capacity(values.len());
        for value in values.iter() {
            match value {
                Value::Null => indices.push(None),
                Value::String(s) => match dictionary.binary_search(s) {
                    Ok(i) => indices.push(Some(i as u32)),
                    Err(_) => return false,
                },
                _ => return false,
            }
        }
        *self = FieldArray::Enumerated {
            dictionary: Arc::clone(dictionary),
            indices,
        };
        true
    }
}

/// A leaf of the cluster tree.
///
/// Holds a contiguous run of object keys, stored as offsets from
/// `key_base`, and one field array per column at matching row offsets.
#[derive(Clone, Debug, PartialEq)]
pub struct Cluster {
    key_base: i64,
    offsets: Vec<u64>,
    columns: BTreeMap<ColKey, FieldArray>,
}

impl Cluster {
    /// Create an empty leaf carrying the given columns
    pub fn new(columns: impl IntoIterator<Item = ColKey>) -> Self {
        Self {
            key_base: 0,
            offsets: Vec::new(),
            columns: columns
                .into_iter()
                .map(|col| (col, FieldArray::Plain(Vec::new())))
                .collect(),
        }
    }

    /// Number of objects
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    /// Check if the leaf holds no objects
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Offset every key in this leaf is stored relative to
    pub fn key_base(&self) -> i64 {
        self.key_base
    }

    /// Key of the object at `ndx`
    pub fn key(&self, ndx: usize) -> ObjKey {
        ObjKey::new(self.key_base + self.offsets[ndx] as i64)
    }

    /// All keys in ascending order
    pub fn keys(&self) -> impl Iterator<Item = ObjKey> + '_ {
        self.offsets
            .iter()
            .map(move |off| ObjKey::new(self.key_base + *off as i64))
    }

    /// Smallest key
    pub fn first_key(&self) -> Option<ObjKey> {
        (!self.is_empty()).then(|| self.key(0))
    }

    /// Largest key
    pub fn last_key(&self) -> Option<ObjKey> {
        (!self.is_empty()).then(|| self.key(self.len() - 1))
    }

    /// Locate a key: `Ok(ndx)` if present, `Err(ndx)` for its insertion point
    pub fn find(&self, key: ObjKey) -> std::result::Result<usize, usize> {
        let Some(offset) = self.offset_of(key) else {
            return Err(0);
        };
        self.offsets.binary_search(&offset)
    }

    /// Index of the first key not less than `key`
    pub fn lower_bound(&self, key: ObjKey) -> usize {
        match self.find(key) {
            Ok(ndx) | Err(ndx) => ndx,
        }
    }

    /// Columns physically present in this leaf
    pub fn column_keys(&self) -> impl Iterator<Item = ColKey> + '_ {
        self.columns.keys().copied()
    }

    /// Check if a column is physically present
    pub fn has_column(&self, col: ColKey) -> bool {
        self.columns.contains_key(&col)
    }

    /// Physical array of a column
    pub fn field_array(&self, col: ColKey) -> Option<&FieldArray> {
        self.columns.get(&col)
    }

    /// Read one field. `None` if the column is not present in this leaf.
    pub fn get(&self, col: ColKey, ndx: usize) -> Option<Value> {
        self.columns.get(&col).map(|array| array.get(ndx))
    }

    /// All fields of one row
    pub fn row(&self, ndx: usize) -> Vec<(ColKey, Value)> {
        self.columns
            .iter()
            .map(|(col, array)| (*col, array.get(ndx)))
            .collect()
    }

    /// Overwrite one field in place
    pub fn set(&mut self, col: ColKey, ndx: usize, value: Value) -> Result<()> {
        if ndx >= self.len() {
            return Err(ClusterError::IndexOutOfRange {
                index: ndx,
                size: self.len(),
            });
        }
        let array = self
            .columns
            .get_mut(&col)
            .ok_or(ClusterError::ColumnNotFound(col))?;
        array.set(ndx, value);
        Ok(())
    }

    fn offset_of(&self, key: ObjKey) -> Option<u64> {
        let value = key.value();
        (value >= self.key_base).then(|| (value - self.key_base) as u64)
    }

    /// Insert a row. `field` supplies the value of every present column.
    pub(crate) fn insert_row(
        &mut self,
        key: ObjKey,
        mut field: impl FnMut(ColKey) -> Value,
    ) -> Result<usize> {
        if self.is_empty() {
            self.key_base = key.value();
        } else if key.value() < self.key_base {
            self.rebase(key.value());
        }
        let ndx = match self.find(key) {
            Ok(_) => return Err(ClusterError::DuplicateKey(key)),
            Err(ndx) => ndx,
        };
        let offset = (key.value() - self.key_base) as u64;
        self.offsets.insert(ndx, offset);
        for (col, array) in self.columns.iter_mut() {
            array.insert(ndx, field(*col));
        }
        Ok(ndx)
    }

    /// Remove a row and return its fields
    pub(crate) fn erase_row(&mut self, ndx: usize) -> Vec<(ColKey, Value)> {
        self.offsets.remove(ndx);
        self.columns
            .iter_mut()
            .map(|(col, array)| (*col, array.remove(ndx)))
            .collect()
    }

    fn rebase(&mut self, new_base: i64) {
        let shift = (self.key_base - new_base) as u64;
        for off in self.offsets.iter_mut() {
            *off += shift;
        }
        self.key_base = new_base;
    }

    /// Move rows `at..` into a new leaf
    pub(crate) fn split_off(&mut self, at: usize) -> Cluster {
        let tail = self.offsets.split_off(at);
        let key_base = tail
            .first()
            .map(|off| self.key_base + *off as i64)
            .unwrap_or(0);
        let shift = (key_base - self.key_base) as u64;
        Cluster {
            key_base,
            offsets: tail.into_iter().map(|off| off - shift).collect(),
            columns: self
                .columns
                .iter_mut()
                .map(|(col, array)| (*col, array.split_off(at)))
                .collect(),
        }
    }

    /// Append every row of `other`, whose keys must all be greater than ours.
    /// Columns missing on either side are filled with `default`.
    pub(crate) fn append(&mut self, mut other: Cluster, mut default: impl FnMut(ColKey) -> Value) {
        if other.is_empty() {
            return;
        }
        if self.is_empty() {
            self.key_base = other.key_base;
        }
        let own_len = self.len();
        let other_len = other.len();
        for col in other.column_keys().collect::<Vec<_>>() {
            if !self.has_column(col) {
                let value = default(col);
                self.columns
                    .insert(col, FieldArray::Plain(vec![value; own_len]));
            }
        }
        for (col, array) in self.columns.iter_mut() {
            let tail = other
                .columns
                .remove(col)
                .unwrap_or_else(|| FieldArray::Plain(vec![default(*col); other_len]));
            array.append(tail);
        }
        let shift = (other.key_base - self.key_base) as u64;
        self.offsets
            .extend(other.offsets.into_iter().map(|off| off + shift));
    }

    /// Add a column, backfilling every row with `default`
    pub(crate) fn insert_column(&mut self, col: ColKey, default: Value) -> bool {
        if self.has_column(col) {
            return false;
        }
        self.columns
            .insert(col, FieldArray::Plain(vec![default; self.len()]));
        true
    }

    /// Drop a column
    pub(crate) fn remove_column(&mut self, col: ColKey) -> bool {
        self.columns.remove(&col).is_some()
    }

    /// Intern a string column against a shared dictionary
    pub(crate) fn enumerate(&mut self, col: ColKey, dictionary: &Arc<Vec<String>>) -> bool {
        self.columns
            .get_mut(&col)
            .map(|array| array.enumerate(dictionary))
            .unwrap_or(false)
    }

    /// Check local invariants
    pub fn verify(&self) -> Result<()> {
        if self.offsets.windows(2).any(|w| w[0] >= w[1]) {
            return Err(ClusterError::Corrupted(format!(
                "leaf keys not strictly increasing (base {})",
                self.key_base
            )));
        }
        for (col, array) in &self.columns {
            if array.len() != self.len() {
                return Err(ClusterError::Corrupted(format!(
                    "column {} has {} rows, leaf has {}",
                    col,
                    array.len(),
                    self.len()
                )));
            }
        }
        Ok(())
    }
}
