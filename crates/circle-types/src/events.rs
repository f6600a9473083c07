use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::IncomingRequest;

/// Events sent over the WebSocket gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum GatewayEvent {
    /// Server confirms successful authentication
    Ready { user_id: Uuid, username: String },

    /// Friend requests that have not been pushed to this user before.
    /// Clients de-duplicate by request id: two live connections of the same
    /// user may both receive the same batch.
    Notification { requests: Vec<IncomingRequest> },

    /// The poller could not load pending requests on this tick
    NewNotification { error: String },
}

impl GatewayEvent {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"type":"newNotification","data":{"error":"encoding failed"}}"#.to_string())
    }
}
