//! Structural reconcile and diff
//!
//! All functions here are pure and copy-on-write: they never mutate their
//! inputs, they allocate a new container only at the levels that actually
//! changed, and every unchanged branch of a result is the same `Arc` as the
//! branch it came from. When nothing changed at all the caller gets
//! [`Reconciled::Unchanged`] carrying the original reference, so "is this a
//! no-op?" is answered without a deep comparison.

use crate::patch::{Patch, PatchOp};
use crate::value::{Map, Value};

/// Outcome of a reconcile pass
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciled {
    /// Result is semantically identical to the target; carries the target reference
    Unchanged(Value),
    /// Result differs from the target; carries the freshly built value
    Changed(Value),
}

impl Reconciled {
    /// Whether reconciliation produced a new value
    pub fn is_changed(&self) -> bool {
        matches!(self, Reconciled::Changed(_))
    }

    /// The reconciled value
    pub fn value(&self) -> &Value {
        match self {
            Reconciled::Unchanged(v) | Reconciled::Changed(v) => v,
        }
    }

    /// Take the reconciled value
    pub fn into_value(self) -> Value {
        match self {
            Reconciled::Unchanged(v) | Reconciled::Changed(v) => v,
        }
    }
}

/// Reconcile `target` toward `source`.
///
/// The result has exactly the keys of `source`. Entries whose values are
/// deeply equal keep the `target` reference, differing nested maps and arrays
/// are reconciled recursively, and differing leaves take the `source` value.
pub fn reconcile(target: &Value, source: &Value) -> Reconciled {
    if Value::ptr_eq(target, source) {
        return Reconciled::Unchanged(target.clone());
    }

    match (target, source) {
        (Value::Map(t), Value::Map(s)) => {
            // Same length plus every source key found in target means no removals.
            let mut changed = t.len() != s.len();
            let mut out = Map::new();
            for (key, s_val) in s.iter() {
                let merged = match t.get(key) {
                    Some(t_val) => match reconcile(t_val, s_val) {
                        Reconciled::Unchanged(v) => v,
                        Reconciled::Changed(v) => {
                            changed = true;
                            v
                        }
                    },
                    None => {
                        changed = true;
                        s_val.clone()
                    }
                };
                out.insert(key.clone(), merged);
            }
            finish_map(target, out, changed)
        }
        (Value::Array(t), Value::Array(s)) => {
            let mut changed = t.len() != s.len();
            let mut out = Vec::with_capacity(s.len());
            for (index, s_val) in s.iter().enumerate() {
                let merged = match t.get(index) {
                    Some(t_val) => match reconcile(t_val, s_val) {
                        Reconciled::Unchanged(v) => v,
                        Reconciled::Changed(v) => {
                            changed = true;
                            v
                        }
                    },
                    None => s_val.clone(),
                };
                out.push(merged);
            }
            if changed {
                Reconciled::Changed(Value::from_vec(out))
            } else {
                Reconciled::Unchanged(target.clone())
            }
        }
        _ if Value::deep_eq(target, source) => Reconciled::Unchanged(target.clone()),
        _ => Reconciled::Changed(source.clone()),
    }
}

/// Apply a default template to a stored value.
///
/// Keys the template has but `stored` lacks (or holds as `null`) are filled
/// from the template, recursively through maps present on both sides. Stored
/// leaves always win over template leaves. Keys absent from a non-empty
/// template map are dropped; an empty template map is an open collection and
/// keeps whatever entries the stored map has.
pub fn apply_template(stored: &Value, template: &Value) -> Reconciled {
    if Value::ptr_eq(stored, template) {
        return Reconciled::Unchanged(stored.clone());
    }

    match (stored, template) {
        (Value::Map(s), Value::Map(t)) => {
            let open = t.is_empty();
            let mut changed = false;
            let mut out = Map::new();
            for (key, s_val) in s.iter() {
                match t.get(key) {
                    Some(t_val) => {
                        let merged = match apply_template(s_val, t_val) {
                            Reconciled::Unchanged(v) => v,
                            Reconciled::Changed(v) => {
                                changed = true;
                                v
                            }
                        };
                        out.insert(key.clone(), merged);
                    }
                    None if open => {
                        out.insert(key.clone(), s_val.clone());
                    }
                    None => changed = true,
                }
            }
            for (key, t_val) in t.iter() {
                if !s.contains_key(key) {
                    out.insert(key.clone(), t_val.clone());
                    changed = true;
                }
            }
            finish_map(stored, out, changed)
        }
        (Value::Null, t) if !t.is_null() => Reconciled::Changed(t.clone()),
        _ => Reconciled::Unchanged(stored.clone()),
    }
}

/// Compute the minimal patch turning `old` into `new`.
///
/// Maps are descended; any other differing value is replaced wholesale.
/// Branches that share a reference are skipped without being walked.
pub fn diff(old: &Value, new: &Value) -> Patch {
    let mut patch = Patch::new();
    let mut path = Vec::new();
    diff_into(old, new, &mut path, &mut patch);
    patch
}

fn diff_into(old: &Value, new: &Value, path: &mut Vec<String>, patch: &mut Patch) {
    if Value::ptr_eq(old, new) {
        return;
    }

    match (old, new) {
        (Value::Map(o), Value::Map(n)) => {
            for key in o.keys().filter(|k| !n.contains_key(*k)) {
                patch.push(PatchOp::Remove {
                    path: child_path(path, key),
                });
            }
            for (key, n_val) in n.iter() {
                match o.get(key) {
                    Some(o_val) => {
                        path.push(key.clone());
                        diff_into(o_val, n_val, path, patch);
                        path.pop();
                    }
                    None => patch.push(PatchOp::Set {
                        path: child_path(path, key),
                        value: n_val.clone(),
                    }),
                }
            }
        }
        _ if Value::deep_eq(old, new) => {}
        _ => patch.push(PatchOp::Set {
            path: path.clone(),
            value: new.clone(),
        }),
    }
}

fn child_path(parent: &[String], key: &str) -> Vec<String> {
    let mut path = Vec::with_capacity(parent.len() + 1);
    path.extend_from_slice(parent);
    path.push(key.to_string());
    path
}

fn finish_map(original: &Value, out: Map, changed: bool) -> Reconciled {
    if changed {
        Reconciled::Changed(Value::from_map(out))
    } else {
        Reconciled::Unchanged(original.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn v(json: serde_json::Value) -> Value {
        Value::from(json)
    }

    #[test]
    fn same_reference_short_circuits() {
        let t = v(json!({"a": {"b": 1}}));
        let out = reconcile(&t, &t);
        assert!(!out.is_changed());
        assert!(Value::ptr_eq(out.value(), &t));
    }

    #[test]
    fn deep_equal_returns_target() {
        let t = v(json!({"a": {"b": [1, 2]}, "c": "x"}));
        let s = t.deep_copy();
        let out = reconcile(&t, &s);
        assert!(matches!(out, Reconciled::Unchanged(_)));
        assert!(Value::ptr_eq(out.value(), &t));
    }

    #[test]
    fn adds_removes_and_keeps_unchanged_branches() {
        let t = v(json!({"keep": {"deep": {"x": 1}}, "drop": 1, "edit": {"n": 1, "m": 2}}));
        let s = v(json!({"keep": {"deep": {"x": 1}}, "add": true, "edit": {"n": 5, "m": 2}}));
        let out = reconcile(&t, &s);

        assert!(out.is_changed());
        let result = out.value();
        assert_eq!(result, &s);
        assert!(Value::ptr_eq(result.get("keep").unwrap(), t.get("keep").unwrap()));
        assert!(!Value::ptr_eq(result.get("edit").unwrap(), t.get("edit").unwrap()));
        // Unchanged leaf inside a changed map is still the target's
        assert!(Value::ptr_eq(
            result.get_path(&["edit", "m"]).unwrap(),
            t.get_path(&["edit", "m"]).unwrap()
        ));
    }

    #[test]
    fn inputs_are_not_mutated() {
        let t = v(json!({"a": {"b": 1}}));
        let s = v(json!({"a": {"b": 2}, "c": 3}));
        let t_before = t.deep_copy();
        let s_before = s.deep_copy();
        let _ = reconcile(&t, &s);
        assert_eq!(t, t_before);
        assert_eq!(s, s_before);
    }

    #[test]
    fn template_fills_missing_keys_and_keeps_stored_leaves() {
        let stored = v(json!({"coins": 10, "inventory": {"sword": 1}, "legacy": 3}));
        let template = v(json!({"coins": 0, "inventory": {}, "gems": 0}));
        let out = apply_template(&stored, &template);

        assert_eq!(
            out.value(),
            &v(json!({"coins": 10, "inventory": {"sword": 1}, "gems": 0}))
        );
        assert!(Value::ptr_eq(
            out.value().get("inventory").unwrap(),
            stored.get("inventory").unwrap()
        ));
    }

    #[test]
    fn template_on_matching_shape_is_unchanged() {
        let stored = v(json!({"coins": 4, "inventory": {"a": 1}}));
        let template = v(json!({"coins": 0, "inventory": {}}));
        let out = apply_template(&stored, &template);
        assert!(!out.is_changed());
        assert!(Value::ptr_eq(out.value(), &stored));
    }

    #[test]
    fn template_fills_null_root() {
        let template = v(json!({"coins": 0, "inventory": {}}));
        let out = apply_template(&Value::Null, &template);
        assert_eq!(out.value(), &template);
    }

    #[test]
    fn diff_then_apply_reproduces_new() {
        let old = v(json!({"coins": 1, "bag": {"a": 1, "b": 2}, "gone": [1]}));
        let new = v(json!({"coins": 2, "bag": {"a": 1, "c": 3}, "fresh": {"x": null}}));
        let patch = diff(&old, &new);
        assert_eq!(patch.apply(&old).unwrap(), new);
    }

    #[test]
    fn diff_of_shared_value_is_empty() {
        let old = v(json!({"a": {"b": 1}}));
        let mut new = old.clone();
        new.insert("c", 1);
        let patch = diff(&old, &new);
        assert_eq!(patch.len(), 1);
        assert!(diff(&old, &old.clone()).is_empty());
    }
}
