//! Input selection: the recursive `$select` structure clients may attach to
//! an operation's `input`.
//!
//! ```text
//! selection := { field: true | false | { select?: selection, input?: any } }
//! ```

use serde_json::Value;
use std::collections::HashMap;

pub const SELECT_KEY: &str = "$select";

#[derive(Debug, Clone)]
pub enum SelectionField {
    Include,
    Exclude,
    Nested { select: Option<Selection>, input: Option<Value> },
}

pub type Selection = HashMap<String, SelectionField>;

/// Pull `$select` out of an operation's `input`, if present.
pub fn extract(input: &Value) -> Option<Selection> { input.as_object()?.get(SELECT_KEY).and_then(parse) }

pub fn parse(value: &Value) -> Option<Selection> {
    let obj = value.as_object()?;
    let mut selection = HashMap::with_capacity(obj.len());
    for (field, spec) in obj {
        let parsed = match spec {
            Value::Bool(true) => SelectionField::Include,
            Value::Bool(false) => SelectionField::Exclude,
            Value::Object(nested) => {
                let select = nested.get("select").and_then(parse);
                let input = nested.get("input").cloned();
                SelectionField::Nested { select, input }
            }
            _ => continue,
        };
        selection.insert(field.clone(), parsed);
    }
    Some(selection)
}

/// `false` excludes a field; everything else (no entry, `true`, or a nested
/// selector) keeps it.
pub fn is_excluded(selection: &Option<Selection>, field: &str) -> bool {
    matches!(selection.as_ref().and_then(|s| s.get(field)), Some(SelectionField::Exclude))
}

pub fn nested_of<'a>(selection: &'a Option<Selection>, field: &str) -> Option<&'a SelectionField> {
    selection.as_ref().and_then(|s| s.get(field))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_mixed_selection() {
        let input = json!({
            "id": "u1",
            "$select": {
                "name": true,
                "email": false,
                "posts": { "select": { "title": true }, "input": { "limit": 5 } }
            }
        });
        let selection = extract(&input).unwrap();
        assert!(matches!(selection.get("name"), Some(SelectionField::Include)));
        assert!(matches!(selection.get("email"), Some(SelectionField::Exclude)));
        match selection.get("posts") {
            Some(SelectionField::Nested { select, input }) => {
                assert!(select.as_ref().unwrap().contains_key("title"));
                assert_eq!(input.as_ref().unwrap()["limit"], 5);
            }
            _ => panic!("expected nested selector"),
        }
    }

    #[test]
    fn false_excludes_and_everything_else_keeps() {
        let sel = extract(&json!({"$select": {"email": false}})).map(Some).unwrap();
        assert!(is_excluded(&sel, "email"));
        assert!(!is_excluded(&sel, "name"));
    }
}
