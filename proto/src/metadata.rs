use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What kind of operation lives at a router path.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Query,
    Mutation,
}

/// Per-operation metadata flattened from the router, sent to clients on
/// handshake.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OperationMeta {
    #[serde(rename = "type")]
    pub kind: OperationType,
    #[serde(rename = "returnType", skip_serializing_if = "Option::is_none")]
    pub return_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub optimistic: Option<bool>,
}

/// The full metadata document exchanged at handshake.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Metadata {
    pub version: String,
    pub operations: BTreeMap<String, OperationMeta>,
}
