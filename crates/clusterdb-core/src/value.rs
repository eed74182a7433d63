//! Field values and column types

use crate::{Dictionary, ObjKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// The value of one column of one object
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// No value
    #[default]
    Null,
    /// Signed integer
    Int(i64),
    /// Boolean
    Bool(bool),
    /// Single precision float
    Float(f32),
    /// Double precision float
    Double(f64),
    /// UTF-8 string
    String(String),
    /// Raw bytes
    Binary(#[serde(with = "serde_bytes")] Vec<u8>),
    /// Point in time
    Timestamp(DateTime<Utc>),
    /// Link to one object in the column's target table
    Link(ObjKey),
    /// Ordered links to objects in the column's target table
    LinkList(Vec<ObjKey>),
    /// String-keyed map of scalar values
    Dictionary(Dictionary),
}

impl Value {
    /// Get the type name, used in error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Int(_) => "int",
            Value::Bool(_) => "bool",
            Value::Float(_) => "float",
            Value::Double(_) => "double",
            Value::String(_) => "string",
            Value::Binary(_) => "binary",
            Value::Timestamp(_) => "timestamp",
            Value::Link(_) => "link",
            Value::LinkList(_) => "link list",
            Value::Dictionary(_) => "dictionary",
        }
    }

    /// Check if this is null. A link to the null key counts as null.
    pub fn is_null(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Link(k) => k.is_null(),
            _ => false,
        }
    }

    /// Get the integer, if this is one
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Get the string, if this is one
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Get the dictionary, if this is one
    pub fn as_dictionary(&self) -> Option<&Dictionary> {
        match self {
            Value::Dictionary(dict) => Some(dict),
            _ => None,
        }
    }

    /// Get the link target, if this is a non-null link
    pub fn as_link(&self) -> Option<ObjKey> {
        match self {
            Value::Link(k) if !k.is_null() => Some(*k),
            _ => None,
        }
    }

    /// All objects this value links to
    pub fn links(&self) -> Vec<ObjKey> {
        match self {
            Value::Link(k) if !k.is_null() => vec![*k],
            Value::LinkList(keys) => keys.clone(),
            _ => Vec::new(),
        }
    }

    /// Drop every link to one of `targets`. Returns true if anything changed.
    pub fn remove_links(&mut self, targets: &BTreeSet<ObjKey>) -> bool {
        match self {
            Value::Link(k) if targets.contains(k) => {
                *self = Value::Null;
                true
            }
            Value::LinkList(keys) => {
                let before = keys.len();
                keys.retain(|k| !targets.contains(k));
                keys.len() != before
            }
            _ => false,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<ObjKey> for Value {
    fn from(v: ObjKey) -> Self {
        Value::Link(v)
    }
}

/// Physical type of a column
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Int,
    Bool,
    Float,
    Double,
    String,
    Binary,
    Timestamp,
    Link,
    LinkList,
    Dictionary,
}

impl ColumnType {
    /// Get the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Int => "int",
            Self::Bool => "bool",
            Self::Float => "float",
            Self::Double => "double",
            Self::String => "string",
            Self::Binary => "binary",
            Self::Timestamp => "timestamp",
            Self::Link => "link",
            Self::LinkList => "link list",
            Self::Dictionary => "dictionary",
        }
    }

    /// Check if this column holds links
    pub fn is_link(&self) -> bool {
        matches!(self, Self::Link | Self::LinkList)
    }

    /// Value stored for rows that never set this column
    pub fn default_value(&self, nullable: bool) -> Value {
        if nullable {
            return match self {
                Self::LinkList => Value::LinkList(Vec::new()),
                Self::Dictionary => Value::Dictionary(Dictionary::new()),
                _ => Value::Null,
            };
        }
        match self {
            Self::Int => Value::Int(0),
            Self::Bool => Value::Bool(false),
            Self::Float => Value::Float(0.0),
            Self::Double => Value::Double(0.0),
            Self::String => Value::String(String::new()),
            Self::Binary => Value::Binary(Vec::new()),
            Self::Timestamp => Value::Timestamp(DateTime::<Utc>::UNIX_EPOCH),
            Self::Link => Value::Null,
            Self::LinkList => Value::LinkList(Vec::new()),
            Self::Dictionary => Value::Dictionary(Dictionary::new()),
        }
    }

    /// Check if a non-null value can be stored in this column
    pub fn accepts(&self, value: &Value) -> bool {
        matches!(
            (self, value),
            (Self::Int, Value::Int(_))
                | (Self::Bool, Value::Bool(_))
                | (Self::Float, Value::Float(_))
                | (Self::Double, Value::Double(_))
                | (Self::String, Value::String(_))
                | (Self::Binary, Value::Binary(_))
                | (Self::Timestamp, Value::Timestamp(_))
                | (Self::Link, Value::Link(_))
                | (Self::LinkList, Value::LinkList(_))
                | (Self::Dictionary, Value::Dictionary(_))
        )
    }
}
