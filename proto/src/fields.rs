use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// The flat field set a caller is interested in for a query/mutation/subscribe
/// frame's output, or the corresponding argument to `updateFields`. This is
/// the wire-level `fields` attribute — distinct from the recursive `$select`
/// that may additionally appear inside `input`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldSelector {
    All(AllFieldsMarker),
    Set(HashSet<String>),
}

/// Serializes as the literal string `"*"`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllFieldsMarker;

impl Serialize for AllFieldsMarker {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> { serializer.serialize_str("*") }
}

impl<'de> Deserialize<'de> for AllFieldsMarker {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        if s == "*" {
            Ok(AllFieldsMarker)
        } else {
            Err(serde::de::Error::custom("expected \"*\""))
        }
    }
}

impl FieldSelector {
    pub fn all() -> Self { FieldSelector::All(AllFieldsMarker) }

    pub fn includes(&self, field: &str) -> bool {
        match self {
            FieldSelector::All(_) => true,
            FieldSelector::Set(set) => set.contains(field),
        }
    }
}

impl Default for FieldSelector {
    fn default() -> Self { FieldSelector::all() }
}
