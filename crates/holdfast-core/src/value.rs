//! Persistent record values
//!
//! `Value` is a JSON-shaped tree whose containers are shared through `Arc`.
//! Cloning a value is cheap and never aliases mutable state: every mutation
//! goes through `Arc::make_mut`, which copies a container only when it is
//! shared. Reference identity is observable through [`Value::ptr_eq`], which is
//! what the reconcile layer relies on to report unchanged branches.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Ordered map of string keys to values
pub type Map = BTreeMap<String, Value>;

/// A record value
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "serde_json::Value", into = "serde_json::Value")]
pub enum Value {
    /// Absent / nil
    #[default]
    Null,
    /// Boolean leaf
    Bool(bool),
    /// Numeric leaf
    Number(serde_json::Number),
    /// String leaf
    String(Arc<str>),
    /// Ordered sequence
    Array(Arc<Vec<Value>>),
    /// Keyed map
    Map(Arc<Map>),
}

impl Value {
    /// Create an empty map value
    pub fn map() -> Self {
        Value::Map(Arc::new(Map::new()))
    }

    /// Wrap an owned map
    pub fn from_map(map: Map) -> Self {
        Value::Map(Arc::new(map))
    }

    /// Wrap an owned vector
    pub fn from_vec(items: Vec<Value>) -> Self {
        Value::Array(Arc::new(items))
    }

    /// Reference identity.
    ///
    /// Containers and strings compare by pointer; scalars have no identity
    /// beyond their value and compare by equality.
    pub fn ptr_eq(a: &Value, b: &Value) -> bool {
        match (a, b) {
            (Value::Map(x), Value::Map(y)) => Arc::ptr_eq(x, y),
            (Value::Array(x), Value::Array(y)) => Arc::ptr_eq(x, y),
            (Value::String(x), Value::String(y)) => Arc::ptr_eq(x, y),
            (Value::Null, Value::Null) => true,
            (Value::Bool(x), Value::Bool(y)) => x == y,
            (Value::Number(x), Value::Number(y)) => x == y,
            _ => false,
        }
    }

    /// Deep structural equality with a pointer fast path at every level
    pub fn deep_eq(a: &Value, b: &Value) -> bool {
        if Value::ptr_eq(a, b) {
            return true;
        }
        match (a, b) {
            (Value::String(x), Value::String(y)) => x == y,
            (Value::Array(x), Value::Array(y)) => {
                x.len() == y.len() && x.iter().zip(y.iter()).all(|(l, r)| Value::deep_eq(l, r))
            }
            (Value::Map(x), Value::Map(y)) => {
                x.len() == y.len()
                    && x.iter().all(|(k, l)| match y.get(k) {
                        Some(r) => Value::deep_eq(l, r),
                        None => false,
                    })
            }
            _ => false,
        }
    }

    /// Rebuild every container so the result shares no allocation with `self`
    pub fn deep_copy(&self) -> Value {
        match self {
            Value::String(s) => Value::String(Arc::from(&**s)),
            Value::Array(items) => {
                Value::from_vec(items.iter().map(Value::deep_copy).collect())
            }
            Value::Map(map) => Value::from_map(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.deep_copy()))
                    .collect(),
            ),
            scalar => scalar.clone(),
        }
    }

    /// Short name of the variant, used in diagnostics
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
        }
    }

    /// True for `Null`
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// True for maps
    pub fn is_map(&self) -> bool {
        matches!(self, Value::Map(_))
    }

    /// Borrow the map, if this is one
    pub fn as_map(&self) -> Option<&Map> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Mutable map access; clones the map first if it is shared
    pub fn as_map_mut(&mut self) -> Option<&mut Map> {
        match self {
            Value::Map(map) => Some(Arc::make_mut(map)),
            _ => None,
        }
    }

    /// Borrow the elements, if this is an array
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Mutable array access; clones the vector first if it is shared
    pub fn as_array_mut(&mut self) -> Option<&mut Vec<Value>> {
        match self {
            Value::Array(items) => Some(Arc::make_mut(items)),
            _ => None,
        }
    }

    /// Borrow the string, if this is one
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// The boolean, if this is one
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer view; floats with no fractional part count
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    /// Numeric value as a float
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    /// Look up a map entry
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map().and_then(|map| map.get(key))
    }

    /// Follow a path of map keys
    pub fn get_path<S: AsRef<str>>(&self, path: &[S]) -> Option<&Value> {
        path.iter()
            .try_fold(self, |node, key| node.get(key.as_ref()))
    }

    /// Insert a map entry, returning the previous value.
    ///
    /// A non-map receiver is replaced by an empty map first.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        if !self.is_map() {
            *self = Value::map();
        }
        self.as_map_mut()
            .and_then(|map| map.insert(key.into(), value.into()))
    }

    /// Remove a map entry
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.as_map_mut().and_then(|map| map.remove(key))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json: serde_json::Value = self.clone().into();
        write!(f, "{json}")
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n),
            serde_json::Value::String(s) => Value::String(Arc::from(s)),
            serde_json::Value::Array(items) => {
                Value::from_vec(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => Value::from_map(
                map.into_iter().map(|(k, v)| (k, Value::from(v))).collect(),
            ),
        }
    }
}

impl From<Value> for serde_json::Value {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(b),
            Value::Number(n) => serde_json::Value::Number(n),
            Value::String(s) => serde_json::Value::String(s.to_string()),
            Value::Array(items) => serde_json::Value::Array(
                items.iter().cloned().map(serde_json::Value::from).collect(),
            ),
            Value::Map(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), serde_json::Value::from(v.clone())))
                    .collect(),
            ),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n.into())
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n.into())
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::Number(n.into())
    }
}

impl From<f64> for Value {
    /// Non-finite floats have no JSON form and become `Null`
    fn from(n: f64) -> Self {
        serde_json::Number::from_f64(n).map_or(Value::Null, Value::Number)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(Arc::from(s))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(Arc::from(s))
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::from_vec(items)
    }
}

impl From<Map> for Value {
    fn from(map: Map) -> Self {
        Value::from_map(map)
    }
}
