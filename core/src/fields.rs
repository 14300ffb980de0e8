//! Applies the wire-level `fields` selector (`lens_proto::FieldSelector`) to
//! an outgoing payload or patch — distinct from the recursive `$select` in
//! `selection.rs`, which shapes what a resolver computes in the first place.
//! This instead trims what's already been computed before it goes out.

use lens_proto::{FieldSelector, PatchOp};
use serde_json::Value;

/// Keep only the selected top-level fields of an object payload. Arrays are
/// filtered element-wise; `FieldSelector::All` and non-object values pass
/// through unchanged.
pub fn apply_field_selection(value: Value, selector: &FieldSelector) -> Value {
    match selector {
        FieldSelector::All(_) => value,
        FieldSelector::Set(set) => match value {
            Value::Object(obj) => Value::Object(obj.into_iter().filter(|(key, _)| set.contains(key)).collect()),
            Value::Array(items) => Value::Array(items.into_iter().map(|item| apply_field_selection(item, selector)).collect()),
            other => other,
        },
    }
}

/// Drop patch operations targeting a field the selector excludes.
pub fn filter_patch_fields(ops: Vec<PatchOp>, selector: &FieldSelector) -> Vec<PatchOp> {
    match selector {
        FieldSelector::All(_) => ops,
        FieldSelector::Set(set) => ops.into_iter().filter(|op| set.contains(op.path().trim_start_matches('/'))).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    #[test]
    fn all_passes_object_through_unchanged() {
        let value = json!({"id": "u1", "name": "Alice"});
        assert_eq!(apply_field_selection(value.clone(), &FieldSelector::all()), value);
    }

    #[test]
    fn set_keeps_only_selected_top_level_fields() {
        let value = json!({"id": "u1", "name": "Alice", "email": "a@x"});
        let fields = FieldSelector::Set(HashSet::from(["id".to_string(), "name".to_string()]));
        assert_eq!(apply_field_selection(value, &fields), json!({"id": "u1", "name": "Alice"}));
    }

    #[test]
    fn set_filters_each_array_element() {
        let value = json!([{"id": "u1", "name": "Alice"}, {"id": "u2", "name": "Bob"}]);
        let fields = FieldSelector::Set(HashSet::from(["id".to_string()]));
        assert_eq!(apply_field_selection(value, &fields), json!([{"id": "u1"}, {"id": "u2"}]));
    }

    #[test]
    fn filter_patch_fields_drops_excluded_ops() {
        let ops = vec![
            PatchOp::Replace { path: "/name".into(), value: json!("Alice Updated") },
            PatchOp::Add { path: "/email".into(), value: json!("a@x") },
        ];
        let fields = FieldSelector::Set(HashSet::from(["name".to_string()]));
        let filtered = filter_patch_fields(ops, &fields);
        assert_eq!(filtered, vec![PatchOp::Replace { path: "/name".into(), value: json!("Alice Updated") }]);
    }
}
