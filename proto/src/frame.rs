use crate::{
    error::WireError,
    fields::FieldSelector,
    id::CallId,
    metadata::Metadata,
    patch::PatchOp,
    reconnect::{ReconnectId, ReconnectResult, ReconnectSubscription},
};
use serde::{Deserialize, Serialize};

/// A frame sent from client to server. Every frame is a JSON object with a
/// `type` discriminator.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    #[serde(rename = "handshake")]
    Handshake,

    #[serde(rename = "query")]
    Query { id: CallId, operation: String, #[serde(skip_serializing_if = "Option::is_none")] input: Option<serde_json::Value>, #[serde(skip_serializing_if = "Option::is_none")] fields: Option<FieldSelector> },

    #[serde(rename = "mutation")]
    Mutation { id: CallId, operation: String, #[serde(skip_serializing_if = "Option::is_none")] input: Option<serde_json::Value>, #[serde(skip_serializing_if = "Option::is_none")] fields: Option<FieldSelector> },

    #[serde(rename = "subscribe")]
    Subscribe {
        id: CallId,
        operation: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        input: Option<serde_json::Value>,
        #[serde(default)]
        fields: FieldSelector,
    },

    #[serde(rename = "updateFields")]
    UpdateFields {
        id: CallId,
        #[serde(rename = "setFields", skip_serializing_if = "Option::is_none")]
        set_fields: Option<FieldSelector>,
        #[serde(rename = "addFields", skip_serializing_if = "Option::is_none")]
        add_fields: Option<FieldSelector>,
        #[serde(rename = "removeFields", skip_serializing_if = "Option::is_none")]
        remove_fields: Option<Vec<String>>,
    },

    #[serde(rename = "unsubscribe")]
    Unsubscribe { id: CallId },

    #[serde(rename = "reconnect")]
    Reconnect { #[serde(rename = "reconnectId")] reconnect_id: ReconnectId, subscriptions: Vec<ReconnectSubscription> },
}

/// A frame sent from server to client.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    #[serde(rename = "handshake")]
    Handshake {
        #[serde(flatten)]
        metadata: Metadata,
    },

    #[serde(rename = "result")]
    Result { id: CallId, data: serde_json::Value },

    #[serde(rename = "error")]
    Error { #[serde(skip_serializing_if = "Option::is_none")] id: Option<CallId>, error: WireError },

    #[serde(rename = "update")]
    Update {
        #[serde(rename = "subscriptionId")]
        subscription_id: CallId,
        #[serde(skip_serializing_if = "Option::is_none")]
        version: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        patch: Option<Vec<PatchOp>>,
    },

    #[serde(rename = "reconnect_ack")]
    ReconnectAck {
        #[serde(rename = "reconnectId")]
        reconnect_id: ReconnectId,
        results: Vec<ReconnectResult>,
        #[serde(rename = "serverTime")]
        server_time: chrono::DateTime<chrono::Utc>,
        #[serde(rename = "processingTime")]
        processing_time_ms: u64,
    },
}

impl ServerFrame {
    pub fn snapshot_update(subscription_id: CallId, version: u64, data: serde_json::Value) -> Self {
        ServerFrame::Update { subscription_id, version: Some(version), data: Some(data), patch: None }
    }

    pub fn patch_update(subscription_id: CallId, version: u64, patch: Vec<PatchOp>) -> Self {
        ServerFrame::Update { subscription_id, version: Some(version), data: None, patch: Some(patch) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_frame_round_trips() {
        let json = r#"{"type":"subscribe","id":"s1","operation":"user.get","input":{"id":"u1"},"fields":"*"}"#;
        let frame: ClientFrame = serde_json::from_str(json).unwrap();
        match frame {
            ClientFrame::Subscribe { id, operation, fields, .. } => {
                assert_eq!(id.as_str(), "s1");
                assert_eq!(operation, "user.get");
                assert!(fields.includes("anything"));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn update_frame_serializes_patch_without_data() {
        let frame = ServerFrame::patch_update(CallId::new("s1"), 2, vec![PatchOp::Replace { path: "/name".into(), value: serde_json::json!("x") }]);
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "update");
        assert!(value.get("data").is_none());
        assert_eq!(value["version"], 2);
    }
}
