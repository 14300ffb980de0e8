use crate::{fields::FieldSelector, id::EntityId, id::CollectionId, patch::PatchOp};
use serde::{Deserialize, Serialize};

/// One entry of a `reconnect` frame's `subscriptions` array: the client's
/// last-known state for one previously-active subscription.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReconnectSubscription {
    pub id: String,
    pub entity: CollectionId,
    #[serde(rename = "entityId")]
    pub entity_id: EntityId,
    pub fields: FieldSelector,
    pub version: u64,
    #[serde(rename = "dataHash", skip_serializing_if = "Option::is_none")]
    pub data_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,
}

/// The outcome the server computed for one `ReconnectSubscription`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ReconnectStatus {
    Patched { version: u64, patches: Vec<Vec<PatchOp>> },
    Snapshot { version: u64, data: serde_json::Value },
    Unchanged,
    Gone,
}

/// One row of a `reconnect_ack`'s `results` array.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReconnectResult {
    pub id: String,
    pub entity: CollectionId,
    #[serde(rename = "entityId")]
    pub entity_id: EntityId,
    #[serde(flatten)]
    pub status: ReconnectStatus,
}
