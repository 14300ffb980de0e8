//! Top-level-field patch derivation between two entity states. Kept at
//! top-level granularity by design — see DESIGN.md for the rationale.

use lens_proto::PatchOp;
use serde_json::Value;

/// Two JSON values are canonically equal for Lens's purposes iff `==` says
/// so. This holds as long as `serde_json`'s `preserve_order` feature stays
/// off, which keeps object key order out of the comparison (an object is a
/// `BTreeMap` internally in that mode) — giving a deterministic deep-equality
/// check.
pub fn canonical_eq(a: &Value, b: &Value) -> bool { a == b }

/// Compute the ordered list of patch operations that transform `old` into
/// `new`, one per top-level field that changed. Returns an empty vec when
/// the two states are canonically equal.
pub fn derive_patch(old: &Value, new: &Value) -> Vec<PatchOp> {
    let old_obj = old.as_object();
    let new_obj = new.as_object();

    let (Some(old_obj), Some(new_obj)) = (old_obj, new_obj) else {
        // Non-object states are atomic: a whole-value replace or nothing.
        return if canonical_eq(old, new) { Vec::new() } else { vec![PatchOp::Replace { path: "/".into(), value: new.clone() }] };
    };

    let mut ops = Vec::new();

    for (field, new_value) in new_obj.iter() {
        match old_obj.get(field) {
            None => ops.push(PatchOp::Add { path: format!("/{field}"), value: new_value.clone() }),
            Some(old_value) if !canonical_eq(old_value, new_value) => {
                ops.push(PatchOp::Replace { path: format!("/{field}"), value: new_value.clone() })
            }
            _ => {}
        }
    }

    for field in old_obj.keys() {
        if !new_obj.contains_key(field) {
            ops.push(PatchOp::Remove { path: format!("/{field}") });
        }
    }

    ops
}

#[cfg(test)]
mod tests {
    use super::*;
    use lens_proto::apply_patch;
    use serde_json::json;

    #[test]
    fn no_change_yields_no_ops() {
        let a = json!({"id": "u1", "name": "Alice"});
        assert!(derive_patch(&a, &a.clone()).is_empty());
    }

    #[test]
    fn field_key_order_does_not_matter() {
        let a = json!({"id": "u1", "name": "Alice"});
        let b = json!({"name": "Alice", "id": "u1"});
        assert!(canonical_eq(&a, &b));
        assert!(derive_patch(&a, &b).is_empty());
    }

    #[test]
    fn derive_then_apply_reproduces_new_state() {
        let old = json!({"id": "u1", "name": "Alice", "age": 30});
        let new = json!({"id": "u1", "name": "Alice Updated", "email": "a@x"});
        let ops = derive_patch(&old, &new);
        let applied = apply_patch(&old, &ops);
        assert_eq!(applied, new);
    }
}
