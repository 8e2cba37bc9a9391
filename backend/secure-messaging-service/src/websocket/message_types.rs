use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::store::StoredMessage;

pub const MESSAGE: &str = "message";
pub const TYPING: &str = "typing";
pub const READ: &str = "read";
pub const DELIVERED: &str = "delivered";
pub const PRESENCE: &str = "presence";
pub const ERROR: &str = "error";
pub const SENT: &str = "sent";

/// Envelope for every frame on the socket, in both directions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WsFrame {
    #[serde(rename = "type")]
    pub frame_type: String,
    #[serde(default)]
    pub payload: Value,
}

impl WsFrame {
    pub fn new(frame_type: impl Into<String>, payload: Value) -> Self {
        Self {
            frame_type: frame_type.into(),
            payload,
        }
    }

    pub fn presence(user_id: Uuid, online: bool) -> Self {
        Self::new(
            PRESENCE,
            json!({
                "user_id": user_id,
                "status": if online { "online" } else { "offline" },
            }),
        )
    }

    /// Stored ciphertext envelope pushed to an online recipient
    pub fn message(stored: &StoredMessage) -> Self {
        Self::new(
            MESSAGE,
            json!({
                "id": stored.id,
                "sender_id": stored.sender_id,
                "recipient_id": stored.recipient_id,
                "content": stored.content,
                "message_type": stored.message_type,
                "counter": stored.counter,
                "created_at": stored.created_at,
            }),
        )
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::new(ERROR, json!({ "code": code, "message": message.into() }))
    }

    /// Overwrite `payload.sender_id`, turning a non-object payload into one
    pub fn with_sender(mut self, sender_id: Uuid) -> Self {
        if !self.payload.is_object() {
            self.payload = json!({});
        }
        if let Value::Object(map) = &mut self.payload {
            map.insert("sender_id".into(), json!(sender_id));
        }
        self
    }

    pub fn payload_uuid(&self, field: &str) -> Option<Uuid> {
        self.payload
            .get(field)
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())
    }

    pub fn to_text(&self) -> String {
        // a Value-backed struct always serializes
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Body of a client `message` frame
#[derive(Debug, Deserialize)]
pub struct SendPayload {
    pub recipient_id: Uuid,
    pub content: String,
}
