//! Reconcile and diff property tests
//!
//! Checks the copy-on-write contract over generated nested values:
//! - reconcile(t, t) and reconcile(t, deep_copy(t)) return `t` itself
//! - reconcile never mutates its inputs and always lands on `source`
//! - unchanged branches keep the target's reference
//! - applying diff(old, new) to old reproduces new

#![allow(clippy::unwrap_used)]

use holdfast_core::{diff, reconcile, Map, Reconciled, Value};
use proptest::prelude::*;

fn leaf() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::from),
        (-50i64..50).prop_map(Value::from),
        "[a-c]{0,3}".prop_map(Value::from),
    ]
}

fn value() -> impl Strategy<Value = Value> {
    leaf().prop_recursive(4, 48, 5, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::from_vec),
            prop::collection::btree_map("[a-e]", inner, 0..5)
                .prop_map(|m: Map| Value::from_map(m)),
        ]
    })
}

/// A value, the key it was edited at, and a copy-on-write edit of it, so the
/// two share every branch except the edited one
fn value_and_edit() -> impl Strategy<Value = (Value, String, Value)> {
    (value(), "[a-e]", value(), any::<bool>()).prop_map(|(base, key, replacement, remove)| {
        let mut edited = base.clone();
        if let Some(map) = edited.as_map_mut() {
            if remove {
                map.remove(&key);
            } else {
                map.insert(key.clone(), replacement);
            }
        }
        (base, key, edited)
    })
}

proptest! {
    #[test]
    fn reconcile_with_self_is_identity(t in value()) {
        let out = reconcile(&t, &t);
        prop_assert!(matches!(out, Reconciled::Unchanged(_)));
        prop_assert!(Value::ptr_eq(out.value(), &t));
    }

    #[test]
    fn reconcile_with_deep_copy_returns_target(t in value()) {
        let s = t.deep_copy();
        let out = reconcile(&t, &s);
        prop_assert!(!out.is_changed());
        prop_assert!(Value::ptr_eq(out.value(), &t));
    }

    #[test]
    fn reconcile_lands_on_source_without_mutating(t in value(), s in value()) {
        let t_before = t.deep_copy();
        let s_before = s.deep_copy();
        let out = reconcile(&t, &s);
        prop_assert_eq!(out.value(), &s);
        prop_assert_eq!(&t, &t_before);
        prop_assert_eq!(&s, &s_before);
        prop_assert_eq!(out.is_changed(), !Value::deep_eq(&t, &s));
    }

    #[test]
    fn reconcile_keeps_unchanged_branches((base, _key, edited) in value_and_edit()) {
        let out = reconcile(&base, &edited);
        if let (Some(result), Some(original)) = (out.value().as_map(), base.as_map()) {
            for (key, branch) in result {
                if let Some(old) = original.get(key) {
                    if Value::deep_eq(old, branch) {
                        prop_assert!(Value::ptr_eq(old, branch));
                    }
                }
            }
        }
    }

    #[test]
    fn diff_round_trips(old in value(), new in value()) {
        let patch = diff(&old, &new);
        let applied = patch.apply(&old).unwrap();
        prop_assert_eq!(&applied, &new);
        prop_assert_eq!(patch.is_empty(), Value::deep_eq(&old, &new));
    }

    #[test]
    fn diff_of_edit_stays_under_edited_key((base, key, edited) in value_and_edit()) {
        for op in diff(&base, &edited).ops {
            prop_assert_eq!(op.path().first(), Some(&key));
        }
    }
}
