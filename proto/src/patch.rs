use serde::{Deserialize, Serialize};

/// One JSON-Patch (RFC 6902 subset) operation against a top-level field of
/// an entity. Lens only ever derives `add`/`replace`/`remove` at field
/// granularity — `path` is always `"/<field>"`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp {
    Add { path: String, value: serde_json::Value },
    Replace { path: String, value: serde_json::Value },
    Remove { path: String },
}

impl PatchOp {
    pub fn path(&self) -> &str {
        match self {
            PatchOp::Add { path, .. } | PatchOp::Replace { path, .. } | PatchOp::Remove { path } => path,
        }
    }

    fn field_name(&self) -> &str { self.path().trim_start_matches('/') }
}

/// Apply an ordered list of patch operations to a JSON object, producing the
/// new state. Unknown paths are created (`add`)/overwritten (`replace`), and
/// `remove` on a missing field is a no-op — matching RFC 6902 leniency for
/// the flat field-pointer subset Lens uses.
pub fn apply_patch(state: &serde_json::Value, ops: &[PatchOp]) -> serde_json::Value {
    let mut obj = state.as_object().cloned().unwrap_or_default();
    for op in ops {
        match op {
            PatchOp::Add { value, .. } | PatchOp::Replace { value, .. } => {
                obj.insert(op.field_name().to_string(), value.clone());
            }
            PatchOp::Remove { .. } => {
                obj.remove(op.field_name());
            }
        }
    }
    serde_json::Value::Object(obj)
}

/// One versioned transition in an entity's history: the patch that carried
/// `version - 1` to `version`, and when it was produced.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Patch {
    pub version: u64,
    pub operations: Vec<PatchOp>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn apply_roundtrips_add_replace_remove() {
        let state = json!({"id": "u1", "name": "Alice"});
        let ops = vec![
            PatchOp::Replace { path: "/name".into(), value: json!("Alice Updated") },
            PatchOp::Add { path: "/email".into(), value: json!("a@x") },
        ];
        let next = apply_patch(&state, &ops);
        assert_eq!(next, json!({"id": "u1", "name": "Alice Updated", "email": "a@x"}));

        let removed = apply_patch(&next, &[PatchOp::Remove { path: "/email".into() }]);
        assert_eq!(removed, json!({"id": "u1", "name": "Alice Updated"}));
    }

    #[test]
    fn remove_of_missing_field_is_noop() {
        let state = json!({"id": "u1"});
        let next = apply_patch(&state, &[PatchOp::Remove { path: "/ghost".into() }]);
        assert_eq!(next, state);
    }
}
