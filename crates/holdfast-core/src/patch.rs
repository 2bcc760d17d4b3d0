//! Patches over record values
//!
//! A patch is an ordered list of set/remove operations addressed by map-key
//! paths. Patches are produced by [`crate::reconcile::diff`] and stored inside
//! a pending transaction, so they are serializable and applying one never
//! mutates the base value.

use crate::value::Value;
use serde::{Deserialize, Serialize};

/// A single patch operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PatchOp {
    /// Set the value at `path`, replacing whatever was there
    Set {
        /// Map keys from the root to the target entry
        path: Vec<String>,
        /// New value
        value: Value,
    },
    /// Remove the entry at `path`
    Remove {
        /// Map keys from the root to the removed entry
        path: Vec<String>,
    },
}

impl PatchOp {
    /// Path the operation targets
    pub fn path(&self) -> &[String] {
        match self {
            PatchOp::Set { path, .. } | PatchOp::Remove { path } => path,
        }
    }
}

/// Errors raised while applying a patch
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PatchError {
    /// An intermediate path segment does not exist
    #[error("missing parent entry at {path:?}")]
    MissingParent { path: Vec<String> },

    /// An intermediate path segment is not a map
    #[error("entry at {path:?} is a {found}, expected map")]
    NotAMap { path: Vec<String>, found: &'static str },
}

/// Ordered list of patch operations
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Patch {
    /// Operations in application order
    pub ops: Vec<PatchOp>,
}

impl Patch {
    /// Empty patch
    pub fn new() -> Self {
        Self::default()
    }

    /// True when applying the patch changes nothing
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Number of operations
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Append an operation
    pub fn push(&mut self, op: PatchOp) {
        self.ops.push(op);
    }

    /// Apply the patch to `base`, returning the patched value.
    ///
    /// Only the containers along each touched path are copied; every other
    /// branch of the result is shared with `base`. Removing an absent key is
    /// a no-op so a patch can be re-applied to its own output.
    pub fn apply(&self, base: &Value) -> Result<Value, PatchError> {
        let mut result = base.clone();
        for op in &self.ops {
            apply_op(&mut result, op)?;
        }
        Ok(result)
    }
}

fn apply_op(root: &mut Value, op: &PatchOp) -> Result<(), PatchError> {
    let path = op.path();
    let Some((last, parents)) = path.split_last() else {
        *root = match op {
            PatchOp::Set { value, .. } => value.clone(),
            PatchOp::Remove { .. } => Value::Null,
        };
        return Ok(());
    };

    let mut node = root;
    for (depth, key) in parents.iter().enumerate() {
        let found = node.type_name();
        let map = node.as_map_mut().ok_or_else(|| PatchError::NotAMap {
            path: path[..depth].to_vec(),
            found,
        })?;
        node = map.get_mut(key).ok_or_else(|| PatchError::MissingParent {
            path: path[..=depth].to_vec(),
        })?;
    }

    let found = node.type_name();
    let map = node.as_map_mut().ok_or_else(|| PatchError::NotAMap {
        path: parents.to_vec(),
        found,
    })?;
    match op {
        PatchOp::Set { value, .. } => {
            map.insert(last.clone(), value.clone());
        }
        PatchOp::Remove { .. } => {
            map.remove(last);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path(keys: &[&str]) -> Vec<String> {
        keys.iter().map(|k| k.to_string()).collect()
    }

    #[test]
    fn apply_leaves_base_untouched() {
        let base = Value::from(json!({"coins": 1, "bag": {"a": 1}, "other": {"x": 0}}));
        let patch = Patch {
            ops: vec![
                PatchOp::Set {
                    path: path(&["bag", "b"]),
                    value: Value::from(2),
                },
                PatchOp::Remove {
                    path: path(&["coins"]),
                },
            ],
        };

        let out = patch.apply(&base).unwrap();
        assert_eq!(out, Value::from(json!({"bag": {"a": 1, "b": 2}, "other": {"x": 0}})));
        assert_eq!(base.get("coins").and_then(Value::as_i64), Some(1));
        assert!(Value::ptr_eq(base.get("other").unwrap(), out.get("other").unwrap()));
    }

    #[test]
    fn missing_parent_is_reported() {
        let base = Value::from(json!({"a": {}}));
        let patch = Patch {
            ops: vec![PatchOp::Set {
                path: path(&["a", "b", "c"]),
                value: Value::Null,
            }],
        };
        assert_eq!(
            patch.apply(&base),
            Err(PatchError::MissingParent {
                path: path(&["a", "b"])
            })
        );
    }

    #[test]
    fn non_map_parent_is_reported() {
        let base = Value::from(json!({"a": 5}));
        let patch = Patch {
            ops: vec![PatchOp::Remove {
                path: path(&["a", "b"]),
            }],
        };
        assert!(matches!(
            patch.apply(&base),
            Err(PatchError::NotAMap { found: "number", .. })
        ));
    }

    #[test]
    fn root_set_replaces_everything() {
        let patch = Patch {
            ops: vec![PatchOp::Set {
                path: vec![],
                value: Value::from(json!([1, 2])),
            }],
        };
        assert_eq!(patch.apply(&Value::map()).unwrap(), Value::from(json!([1, 2])));
    }
}
